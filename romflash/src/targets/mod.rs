//! Flashable target devices
//!
//! Everything romflash knows about a chip family is described by a
//! [ChipProfile]: the magic values identifying it, the opcodes and block
//! sizes its bootloaders use, how to reset it and, optionally, the flasher
//! stub to run on it. Profiles are plain data and can be loaded from TOML, so
//! supporting a new chip does not require any code.

use serde::{Deserialize, Serialize};

pub use self::flash_target::{
    FlashRegion, FlashTarget, FlashWriter, ProgressCallbacks, RamTarget, Segment,
};
use crate::{
    connection::{
        command::{CommandType, CHECKSUM_INIT},
        reset::ResetSequences,
    },
    error::Error,
    flasher::stubs::StubImage,
};

pub mod flash_target;

/// Size of a flash sector, the smallest unit the flash erases
pub const FLASH_SECTOR_SIZE: u32 = 0x1000;
/// Flash write block size of the ROM bootloader
pub const FLASH_WRITE_SIZE: u32 = 0x400;
/// Flash write block size of the flasher stub
pub const STUB_FLASH_WRITE_SIZE: u32 = 0x4000;
/// Largest block the ROM accepts when loading code into RAM
pub const MAX_RAM_BLOCK_SIZE: u32 = 0x1800;
/// Number of status bytes most ROM bootloaders append to a response
pub const ROM_STATUS_LEN: usize = 4;

/// Size of the fields preceding the payload of a data command
const DATA_HEADER_LEN: u32 = 16;

/// Block sizes accepted by a bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLimits {
    /// Size of the blocks sent with the flash data commands
    pub flash_block_size: u32,
    /// Size of the blocks sent with the memory data commands
    pub ram_block_size: u32,
}

impl BlockLimits {
    pub const fn new(flash_block_size: u32, ram_block_size: u32) -> Self {
        Self {
            flash_block_size,
            ram_block_size,
        }
    }
}

/// Wire opcodes of every logical command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpcodeTable {
    pub flash_begin: u8,
    pub flash_data: u8,
    pub flash_end: u8,
    pub mem_begin: u8,
    pub mem_end: u8,
    pub mem_data: u8,
    pub sync: u8,
    pub write_reg: u8,
    pub read_reg: u8,
    pub change_baudrate: u8,
    pub flash_defl_begin: u8,
    pub flash_defl_data: u8,
    pub flash_defl_end: u8,
    pub flash_md5: u8,
    pub erase_flash: u8,
    pub erase_region: u8,
}

impl Default for OpcodeTable {
    fn default() -> Self {
        Self {
            flash_begin: 0x02,
            flash_data: 0x03,
            flash_end: 0x04,
            mem_begin: 0x05,
            mem_end: 0x06,
            mem_data: 0x07,
            sync: 0x08,
            write_reg: 0x09,
            read_reg: 0x0a,
            change_baudrate: 0x0f,
            flash_defl_begin: 0x10,
            flash_defl_data: 0x11,
            flash_defl_end: 0x12,
            flash_md5: 0x13,
            erase_flash: 0xd0,
            erase_region: 0xd1,
        }
    }
}

impl OpcodeTable {
    /// Wire opcode of a command type
    pub fn opcode(&self, command: CommandType) -> u8 {
        match command {
            CommandType::FlashBegin => self.flash_begin,
            CommandType::FlashData => self.flash_data,
            CommandType::FlashEnd => self.flash_end,
            CommandType::MemBegin => self.mem_begin,
            CommandType::MemEnd => self.mem_end,
            CommandType::MemData => self.mem_data,
            CommandType::Sync => self.sync,
            CommandType::WriteReg => self.write_reg,
            CommandType::ReadReg => self.read_reg,
            CommandType::ChangeBaudrate => self.change_baudrate,
            CommandType::FlashDeflBegin => self.flash_defl_begin,
            CommandType::FlashDeflData => self.flash_defl_data,
            CommandType::FlashDeflEnd => self.flash_defl_end,
            CommandType::FlashMd5 => self.flash_md5,
            CommandType::EraseFlash => self.erase_flash,
            CommandType::EraseRegion => self.erase_region,
        }
    }
}

fn default_checksum_seed() -> u8 {
    CHECKSUM_INIT
}

fn default_sector_size() -> u32 {
    FLASH_SECTOR_SIZE
}

fn default_rom_status_len() -> usize {
    ROM_STATUS_LEN
}

fn default_rom_limits() -> BlockLimits {
    BlockLimits::new(FLASH_WRITE_SIZE, MAX_RAM_BLOCK_SIZE)
}

fn default_stub_limits() -> BlockLimits {
    BlockLimits::new(STUB_FLASH_WRITE_SIZE, MAX_RAM_BLOCK_SIZE)
}

/// Static description of a chip family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChipProfile {
    pub name: String,
    /// Values of the chip detect magic register identifying the family
    ///
    /// When empty, any value is accepted.
    #[serde(default)]
    pub magic_values: Vec<u32>,
    /// Initial value of the data checksum
    #[serde(default = "default_checksum_seed")]
    pub checksum_seed: u8,
    #[serde(default)]
    pub opcodes: OpcodeTable,
    /// Block sizes used while talking to the ROM bootloader
    #[serde(default = "default_rom_limits")]
    pub rom_limits: BlockLimits,
    /// Block sizes used once the flasher stub is running
    #[serde(default = "default_stub_limits")]
    pub stub_limits: BlockLimits,
    #[serde(default = "default_sector_size")]
    pub sector_size: u32,
    /// Number of status bytes the ROM bootloader appends to each response
    #[serde(default = "default_rom_status_len")]
    pub rom_status_len: usize,
    /// Whether the ROM bootloader understands the deflate commands
    #[serde(default)]
    pub rom_supports_compression: bool,
    /// Whether data responses echo the sequence number in their value field
    #[serde(default)]
    pub sequence_echo: bool,
    #[serde(default)]
    pub reset: ResetSequences,
    #[serde(default)]
    pub stub: Option<StubImage>,
}

impl ChipProfile {
    /// The ESP32
    pub fn esp32() -> Self {
        Self {
            name: "esp32".into(),
            magic_values: vec![0x00f0_1d83],
            checksum_seed: CHECKSUM_INIT,
            opcodes: OpcodeTable::default(),
            rom_limits: default_rom_limits(),
            stub_limits: default_stub_limits(),
            sector_size: FLASH_SECTOR_SIZE,
            rom_status_len: ROM_STATUS_LEN,
            rom_supports_compression: true,
            sequence_echo: false,
            reset: ResetSequences::default(),
            stub: None,
        }
    }

    /// The ESP8266, whose ROM cannot inflate compressed data and reports
    /// only two status bytes
    pub fn esp8266() -> Self {
        Self {
            name: "esp8266".into(),
            magic_values: vec![0xfff0_c101],
            rom_status_len: 2,
            rom_supports_compression: false,
            ..Self::esp32()
        }
    }

    /// Parse a profile from its TOML description
    pub fn from_toml(s: &str) -> Result<Self, Error> {
        let profile: Self = toml::from_str(s)?;
        profile.validate()?;

        Ok(profile)
    }

    /// Reject sizes the flashing code cannot work with
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |reason: String| Error::InvalidProfileValue {
            profile: self.name.clone(),
            reason,
        };

        if self.sector_size == 0 {
            return Err(invalid("sector_size must be non-zero".into()));
        }

        // The status trailer must at least carry the status and error bytes
        if !(2..=4).contains(&self.rom_status_len) {
            return Err(invalid(format!(
                "rom_status_len must be between 2 and 4, got {}",
                self.rom_status_len
            )));
        }

        let sections = [("rom_limits", self.rom_limits), ("stub_limits", self.stub_limits)];
        for (section, limits) in sections {
            if limits.flash_block_size == 0 || limits.ram_block_size == 0 {
                return Err(invalid(format!("{section} block sizes must be non-zero")));
            }

            let largest = limits.flash_block_size.max(limits.ram_block_size);
            if largest > u16::MAX as u32 - DATA_HEADER_LEN {
                return Err(invalid(format!(
                    "{section} block size {largest:#x} does not fit in a frame"
                )));
            }
        }

        Ok(())
    }

    /// Check if the magic value identifies this chip
    pub fn has_magic_value(&self, value: u32) -> bool {
        self.magic_values.is_empty() || self.magic_values.contains(&value)
    }

    /// Amount of flash erased when writing `len` bytes, rounded up to whole
    /// sectors
    pub fn erase_size(&self, len: u32) -> u32 {
        len.div_ceil(self.sector_size).saturating_mul(self.sector_size)
    }
}
