//! Write a binary application to a target device
//!
//! The [Flasher] struct abstracts over various operations for writing a binary
//! application to a target device. It additionally provides some operations to
//! read information from the target device.

use std::{iter::zip, time::Duration};

use log::{debug, info, warn};
use md5::{Digest, Md5};
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::Display;

use self::stubs::{StubImage, CHIP_DETECT_MAGIC_REG_ADDR, EXPECTED_STUB_HANDSHAKE};
use crate::{
    connection::{
        command::{Command, CommandType},
        reset::{ResetController, ResetMode, ResetSequence},
        CommandResponse,
        Connection,
        ResponseFormat,
    },
    error::{Error, ProtocolError, Result},
    targets::{
        BlockLimits,
        ChipProfile,
        FlashRegion,
        FlashTarget,
        FlashWriter,
        ProgressCallbacks,
        RamTarget,
        Segment,
    },
    transport::Transport,
};

pub mod stubs;

/// How long to wait for the boot log after a reset
const BOOT_LOG_TIMEOUT: Duration = Duration::from_millis(100);
/// How long the stub may take to greet us once started
const STUB_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
/// Time for the link to settle after a baud rate change
const BAUD_SETTLE_DELAY: Duration = Duration::from_millis(50);

/// Where a [Flasher] is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    /// Nothing is known about the bootloader yet
    Unsynced,
    /// A sync handshake is in progress
    Syncing,
    /// Talking to the ROM bootloader
    Synced,
    /// Talking to the flasher stub
    StubActive,
    /// The session is over, only the transport can be recovered
    Closed,
}

/// Tunables of a [Flasher]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlasherConfig {
    /// Number of resets tried by [Flasher::connect]
    pub connect_attempts: usize,
    /// Number of sync commands sent before giving up
    pub sync_attempts: usize,
    /// Pause between two sync attempts
    pub sync_delay_ms: u64,
    /// How many times an idempotent command is resent on timeout
    pub retries: usize,
    /// Compare the MD5 of the flash with the image after each write
    pub verify: bool,
    /// Baud rate the bootloader is first contacted at
    pub baud: u32,
}

impl Default for FlasherConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 7,
            sync_attempts: 5,
            sync_delay_ms: 50,
            retries: 3,
            verify: false,
            baud: 115_200,
        }
    }
}

impl FlasherConfig {
    fn sync_delay(&self) -> Duration {
        Duration::from_millis(self.sync_delay_ms)
    }
}

const ACTIVE: &[SessionState] = &[SessionState::Synced, SessionState::StubActive];

/// Connect to and flash a target device
#[derive(Debug)]
pub struct Flasher<T> {
    /// Connection for flash operations
    connection: Connection<T>,
    profile: ChipProfile,
    config: FlasherConfig,
    state: SessionState,
    /// Value of the chip detect magic register read after the last sync
    chip_magic: Option<u32>,
    /// Block sizes of the bootloader currently running
    limits: BlockLimits,
    /// Current baud rate of the link
    baud: u32,
    /// Set while an operation is running, left set if it was cancelled
    busy: bool,
}

impl<T: Transport> Flasher<T> {
    /// Wrap an open transport without touching the device
    pub fn new(transport: T, profile: ChipProfile, config: FlasherConfig) -> Self {
        let connection = Connection::new(transport, &profile, config.retries);

        Flasher {
            connection,
            limits: profile.rom_limits,
            baud: config.baud,
            profile,
            config,
            state: SessionState::Unsynced,
            chip_magic: None,
            busy: false,
        }
    }

    /// Reset the device into its ROM bootloader and synchronise with it
    ///
    /// The transport's baud rate should already be set to
    /// [FlasherConfig::baud].
    pub async fn connect(
        transport: T,
        profile: ChipProfile,
        config: FlasherConfig,
    ) -> Result<Self> {
        let mut flasher = Self::new(transport, profile, config);
        flasher.begin().await?;

        Ok(flasher)
    }

    /// Reset the device into its ROM bootloader and synchronise with it
    pub async fn begin(&mut self) -> Result<()> {
        self.enter("connect", &[SessionState::Unsynced, SessionState::Synced])?;
        let result = self.begin_inner().await;
        self.leave(result)
    }

    async fn begin_inner(&mut self) -> Result<()> {
        let sequences = self.profile.reset.bootloader.clone();
        if sequences.is_empty() {
            return self.sync_inner().await;
        }

        let mut last_error = Error::SyncFailed;

        for (attempt, sequence) in zip(1..=self.config.connect_attempts, sequences.iter().cycle()) {
            match self.connect_attempt(sequence).await {
                Ok(()) => return Ok(()),
                Err(e @ (Error::ChipMismatch { .. } | Error::Transport(_))) => return Err(e),
                Err(e) => {
                    debug!("Connect attempt {attempt} failed: {e}, retrying");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn connect_attempt(&mut self, sequence: &ResetSequence) -> Result<()> {
        ResetController::run(self.connection.transport_mut(), sequence).await?;

        let log = self.connection.read_raw(BOOT_LOG_TIMEOUT).await?;
        let boot_mode = parse_boot_log(&String::from_utf8_lossy(&log));

        if let Some((mode, download)) = &boot_mode {
            debug!("Boot Mode: {}", mode);
            debug!("Download Mode: {}", download);
        }

        match (self.sync_inner().await, boot_mode) {
            (Err(Error::SyncFailed), Some((mode, false))) => Err(Error::WrongBootMode(mode)),
            (result, _) => result,
        }
    }

    /// Synchronise with the ROM bootloader
    pub async fn sync(&mut self) -> Result<()> {
        self.enter("sync", &[SessionState::Unsynced, SessionState::Synced])?;
        let result = self.sync_inner().await;
        self.leave(result)
    }

    async fn sync_inner(&mut self) -> Result<()> {
        self.state = SessionState::Syncing;

        let mut synced = false;
        for attempt in 1..=self.config.sync_attempts {
            self.connection.drain().await?;

            // a lost sync is retried here, not by the channel
            match self
                .connection
                .command_with_retries(Command::Sync, CommandType::Sync.timeout(), 0)
                .await
            {
                Ok(_) => {
                    synced = true;
                    break;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    debug!("Sync attempt {attempt} failed: {e}");
                    tokio::time::sleep(self.config.sync_delay()).await;
                }
            }
        }

        if !synced {
            self.state = SessionState::Unsynced;
            return Err(Error::SyncFailed);
        }

        // the ROM answers a single sync several times
        self.connection.drain().await?;

        let magic = match self.connection.read_reg(CHIP_DETECT_MAGIC_REG_ADDR).await {
            Ok(magic) => magic,
            Err(e) => {
                self.state = SessionState::Unsynced;
                return Err(e);
            }
        };
        debug!("Chip detect magic value: {:#010x}", magic);
        self.chip_magic = Some(magic);

        if !self.profile.has_magic_value(magic) {
            self.state = SessionState::Unsynced;
            return Err(Error::ChipMismatch {
                expected: self.profile.name.clone(),
                found: magic,
            });
        }

        self.state = SessionState::Synced;
        info!("Connected to {} bootloader", self.profile.name);

        Ok(())
    }

    /// Load the stub of the chip profile, see [Flasher::load_stub]
    pub async fn load_profile_stub(&mut self) -> Result<()> {
        let stub = self
            .profile
            .stub
            .clone()
            .ok_or_else(|| Error::NoStub(self.profile.name.clone()))?;

        self.load_stub(&stub).await
    }

    /// Upload the flasher stub into RAM and hand control over to it
    ///
    /// On failure the session keeps talking to the ROM bootloader.
    pub async fn load_stub(&mut self, stub: &StubImage) -> Result<()> {
        self.enter("load the stub", &[SessionState::Synced])?;
        let result = self.load_stub_inner(stub).await;
        self.leave(result)
    }

    async fn load_stub_inner(&mut self, stub: &StubImage) -> Result<()> {
        debug!("Loading flash stub for chip: {}", self.profile.name);

        let binary = stub.decode()?;
        let mut ram_target = RamTarget::new(
            Some(binary.entry),
            self.limits.ram_block_size,
            self.profile.checksum_seed,
        );
        ram_target.begin(&mut self.connection).await?;

        for segment in binary.segments {
            debug!("Write {} byte stub segment at {:#x}", segment.size(), segment.addr);

            ram_target
                .write_segment(&mut self.connection, segment, &mut None)
                .await?;
        }

        debug!("Finish stub write");
        ram_target.finish(&mut self.connection, true).await?;

        match self.connection.read_frame(STUB_HANDSHAKE_TIMEOUT).await {
            Ok(frame) if frame == EXPECTED_STUB_HANDSHAKE.as_bytes() => {}
            Ok(_) | Err(Error::Timeout(_)) => return Err(Error::InvalidStubHandshake),
            Err(e) => return Err(e),
        }

        self.connection.set_response_format(ResponseFormat::Stub);
        self.limits = self.profile.stub_limits;
        self.state = SessionState::StubActive;
        info!("Using flash stub");

        Ok(())
    }

    /// Erase a region of flash
    pub async fn erase(&mut self, offset: u32, length: u32) -> Result<()> {
        self.enter("erase", ACTIVE)?;
        let result = self.erase_inner(offset, length).await;
        self.leave(result)
    }

    async fn erase_inner(&mut self, offset: u32, length: u32) -> Result<()> {
        debug!("Erasing region of 0x{:x}B at 0x{:08x}", length, offset);

        let sector_size = self.profile.sector_size;
        if offset % sector_size != 0 {
            return Err(Error::UnalignedOffset {
                offset,
                block_size: sector_size,
            });
        }

        if self.is_stub() {
            let command = Command::EraseRegion {
                offset,
                size: length,
            };
            self.command(command, CommandType::EraseRegion.timeout_for_size(length))
                .await?;
            tokio::time::sleep(BAUD_SETTLE_DELAY).await;
            self.connection.drain().await?;
        } else {
            // Beginning a write erases the region, ending it right away leaves
            // nothing written
            let erase_size = self.profile.erase_size(length);
            let begin = Command::FlashBegin {
                size: length,
                blocks: 0,
                block_size: self.limits.flash_block_size,
                offset,
            };
            self.command(begin, CommandType::FlashBegin.timeout_for_size(erase_size))
                .await?;
            self.command(
                Command::FlashEnd { reboot: false },
                CommandType::FlashEnd.timeout(),
            )
            .await?;
        }

        Ok(())
    }

    /// Erase the whole flash, only available through the stub
    pub async fn erase_flash(&mut self) -> Result<()> {
        self.enter("erase the flash", ACTIVE)?;
        let result = self.erase_flash_inner().await;
        self.leave(result)
    }

    async fn erase_flash_inner(&mut self) -> Result<()> {
        debug!("Erasing the entire flash");

        self.command(Command::EraseFlash, CommandType::EraseFlash.timeout())
            .await?;
        tokio::time::sleep(BAUD_SETTLE_DELAY).await;
        self.connection.drain().await?;

        Ok(())
    }

    /// Write a binary image to flash at `offset`
    ///
    /// `offset` has to be aligned to the flash block size of the running
    /// bootloader. The image is compressed when `compress` is set and the
    /// bootloader can inflate it. A failure after the write has begun is
    /// reported as [Error::FlashWriteFailed], carrying the number of bytes
    /// acknowledged so far.
    pub async fn write(
        &mut self,
        offset: u32,
        data: &[u8],
        compress: bool,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<()> {
        self.enter("write", ACTIVE)?;
        let result = self.write_inner(offset, data, compress, progress).await;
        self.leave(result)
    }

    /// Write a [FlashRegion], see [Flasher::write]
    pub async fn write_region(
        &mut self,
        region: &FlashRegion<'_>,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<()> {
        self.write(region.offset, region.data, region.compressed, progress)
            .await
    }

    async fn write_inner(
        &mut self,
        offset: u32,
        data: &[u8],
        compress: bool,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<()> {
        let block_size = self.limits.flash_block_size;
        if offset % block_size != 0 {
            return Err(Error::UnalignedOffset { offset, block_size });
        }

        u32::try_from(data.len())
            .ok()
            .and_then(|len| offset.checked_add(len))
            .ok_or(Error::ImageTooBig(data.len()))?;

        let compress = if compress && !self.supports_compression() {
            warn!("The ROM bootloader cannot inflate data, writing uncompressed");
            false
        } else {
            compress
        };

        let mut writer = FlashWriter::new(&self.profile, self.limits, compress);
        let segment = Segment::new(offset, data);

        let written = write_segment(&mut self.connection, &mut writer, segment, progress).await;
        if let Err(source) = written {
            return Err(Error::FlashWriteFailed {
                offset,
                bytes_sent: writer.bytes_sent(),
                source: Box::new(source),
            });
        }

        if self.config.verify {
            self.verify_inner(offset, data).await?;
        }

        info!("Binary successfully written to flash!");

        Ok(())
    }

    async fn verify_inner(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let expected = Md5::digest(data);
        let found = self.checksum_md5_inner(offset, data.len() as u32).await?;

        if expected.as_slice() != found.to_be_bytes() {
            return Err(Error::VerifyFailed);
        }
        debug!("Flash contents at {:#x} verified", offset);

        Ok(())
    }

    /// Get MD5 of region
    pub async fn checksum_md5(&mut self, offset: u32, length: u32) -> Result<u128> {
        self.enter("compute a checksum", ACTIVE)?;
        let result = self.checksum_md5_inner(offset, length).await;
        self.leave(result)
    }

    async fn checksum_md5_inner(&mut self, offset: u32, length: u32) -> Result<u128> {
        let response = self
            .command(
                Command::FlashMd5 {
                    offset,
                    size: length,
                },
                CommandType::FlashMd5.timeout(),
            )
            .await?;

        parse_md5(&response)
    }

    /// Read a register of the target device
    pub async fn read_reg(&mut self, address: u32) -> Result<u32> {
        self.enter("read a register", ACTIVE)?;
        let result = self.connection.read_reg(address).await;
        self.leave(result)
    }

    /// Write a register of the target device
    pub async fn write_reg(&mut self, address: u32, value: u32, mask: Option<u32>) -> Result<()> {
        self.enter("write a register", ACTIVE)?;
        let result = self.connection.write_reg(address, value, mask).await;
        self.leave(result)
    }

    /// Switch both the device and the transport to a new baud rate
    pub async fn change_baud(&mut self, speed: u32) -> Result<()> {
        self.enter("change the baud rate", ACTIVE)?;
        let result = self.change_baud_inner(speed).await;
        self.leave(result)
    }

    async fn change_baud_inner(&mut self, speed: u32) -> Result<()> {
        debug!("Change baud to: {}", speed);

        let prior_baud = match self.is_stub() {
            true => self.baud,
            false => 0,
        };

        self.command(
            Command::ChangeBaudrate {
                new_baud: speed,
                prior_baud,
            },
            CommandType::ChangeBaudrate.timeout(),
        )
        .await?;
        self.connection.set_baud(speed).await?;
        self.baud = speed;

        tokio::time::sleep(BAUD_SETTLE_DELAY).await;
        self.connection.drain().await?;

        Ok(())
    }

    /// Reset the device into the bootloader or the user application
    ///
    /// After a reset into the bootloader the session has to be synchronised
    /// again. A reset into the application ends the session.
    pub async fn reset(&mut self, mode: ResetMode) -> Result<()> {
        self.enter(
            "reset",
            &[
                SessionState::Unsynced,
                SessionState::Synced,
                SessionState::StubActive,
            ],
        )?;
        let result = self.reset_inner(mode).await;
        self.leave(result)
    }

    async fn reset_inner(&mut self, mode: ResetMode) -> Result<()> {
        let sequence = self
            .profile
            .reset
            .for_mode(mode)
            .cloned()
            .unwrap_or_else(|| ResetSequence::classic(false));

        info!("Resetting into {}", mode);
        ResetController::run(self.connection.transport_mut(), &sequence).await?;

        match mode {
            ResetMode::Bootloader => {
                // Whatever ran before is gone, the ROM starts over
                if self.baud != self.config.baud {
                    self.connection.set_baud(self.config.baud).await?;
                    self.baud = self.config.baud;
                }
                self.connection.set_response_format(ResponseFormat::Rom);
                self.limits = self.profile.rom_limits;
                self.chip_magic = None;
                self.state = SessionState::Unsynced;
            }
            ResetMode::Application => self.state = SessionState::Closed,
        }

        Ok(())
    }

    /// End the session
    pub fn close(&mut self) {
        debug!("Closing the session");
        self.state = SessionState::Closed;
        self.busy = false;
    }

    /// End the session and give back the transport
    pub fn into_transport(self) -> T {
        self.connection.into_transport()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the flasher stub is running
    pub fn is_stub(&self) -> bool {
        self.state == SessionState::StubActive
    }

    /// Value of the chip detect magic register, once synchronised
    pub fn chip_magic(&self) -> Option<u32> {
        self.chip_magic
    }

    /// Block sizes of the bootloader currently running
    pub fn limits(&self) -> BlockLimits {
        self.limits
    }

    pub fn profile(&self) -> &ChipProfile {
        &self.profile
    }

    pub fn config(&self) -> &FlasherConfig {
        &self.config
    }

    /// Whether the running bootloader accepts compressed data
    pub fn supports_compression(&self) -> bool {
        self.is_stub() || self.profile.rom_supports_compression
    }

    /// Run a command, refusing stub-only commands while the ROM is running
    async fn command(
        &mut self,
        command: Command<'_>,
        timeout: Duration,
    ) -> Result<CommandResponse> {
        let ty = command.command_type();
        if ty.requires_stub() && !self.is_stub() {
            return Err(Error::StubRequired(ty));
        }

        self.connection.command(command, timeout).await
    }

    /// Check that an operation may start, and mark the session busy
    fn enter(&mut self, operation: &'static str, allowed: &[SessionState]) -> Result<()> {
        if self.busy {
            warn!("A previous operation was cancelled, the device state is unknown");
            self.busy = false;
            self.state = SessionState::Closed;
        }

        if self.state == SessionState::Closed {
            return Err(Error::SessionClosed);
        }

        if !allowed.contains(&self.state) {
            return Err(Error::InvalidState {
                operation,
                state: self.state,
            });
        }

        self.busy = true;
        Ok(())
    }

    /// Mark the session idle again, closing it if the link failed
    fn leave<R>(&mut self, result: Result<R>) -> Result<R> {
        self.busy = false;

        if let Err(e) = &result {
            if e.is_fatal() {
                warn!("Closing the session after a transport error");
                self.state = SessionState::Closed;
            }
        }

        result
    }
}

async fn write_segment<T: Transport>(
    connection: &mut Connection<T>,
    writer: &mut FlashWriter,
    segment: Segment<'_>,
    progress: &mut Option<&mut dyn ProgressCallbacks>,
) -> Result<()> {
    writer.begin(connection).await?;
    writer.write_segment(connection, segment, progress).await?;
    writer.finish(connection, false).await
}

/// Find the boot mode, and whether it is the download mode, in a boot log
fn parse_boot_log(log: &str) -> Option<(String, bool)> {
    let pattern = Regex::new(r"boot:(0x[0-9a-fA-F]+)(.*waiting for download)?").ok()?;
    let captures = pattern.captures(log)?;

    let mode = captures.get(1)?.as_str().to_string();
    let download = captures.get(2).is_some();

    Some((mode, download))
}

/// The ROM reports the digest as 32 hex digits, the stub as 16 raw bytes
fn parse_md5(response: &CommandResponse) -> Result<u128> {
    let unexpected = || {
        Error::Protocol(ProtocolError::UnexpectedPayload {
            command: CommandType::FlashMd5,
            len: response.data.len(),
        })
    };

    match response.data.len() {
        16 => {
            let bytes: [u8; 16] = response.data.as_slice().try_into().map_err(|_| unexpected())?;
            Ok(u128::from_be_bytes(bytes))
        }
        32 => {
            let hex = std::str::from_utf8(&response.data).map_err(|_| unexpected())?;
            u128::from_str_radix(hex, 16).map_err(|_| unexpected())
        }
        _ => Err(unexpected()),
    }
}
