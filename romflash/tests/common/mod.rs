#![allow(dead_code)]

//! A simulated ROM bootloader, answering the host over an in-memory transport

use std::{
    collections::{HashMap, VecDeque},
    io::{self, Write},
    time::Duration,
};

use flate2::write::ZlibDecoder;
use md5::{Digest, Md5};
use romflash::{
    slip::{self, Decoded},
    targets::ProgressCallbacks,
    transport::Transport,
    ChipProfile,
    Flasher,
    FlasherConfig,
};
use tokio::time::Instant;

pub const MAGIC_ESP32: u32 = 0x00f0_1d83;
pub const MAGIC_ESP8266: u32 = 0xfff0_c101;
pub const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;

const FLASH_SIZE: usize = 0x40_0000;
const SECTOR_SIZE: usize = 0x1000;

pub const STUB_TOML: &str = include_str!("../resources/stub.toml");

/// Default opcodes
pub mod op {
    pub const FLASH_BEGIN: u8 = 0x02;
    pub const FLASH_DATA: u8 = 0x03;
    pub const FLASH_END: u8 = 0x04;
    pub const MEM_BEGIN: u8 = 0x05;
    pub const MEM_END: u8 = 0x06;
    pub const MEM_DATA: u8 = 0x07;
    pub const SYNC: u8 = 0x08;
    pub const WRITE_REG: u8 = 0x09;
    pub const READ_REG: u8 = 0x0a;
    pub const CHANGE_BAUDRATE: u8 = 0x0f;
    pub const FLASH_DEFL_BEGIN: u8 = 0x10;
    pub const FLASH_DEFL_DATA: u8 = 0x11;
    pub const FLASH_DEFL_END: u8 = 0x12;
    pub const FLASH_MD5: u8 = 0x13;
    pub const ERASE_FLASH: u8 = 0xd0;
    pub const ERASE_REGION: u8 = 0xd1;
}

const BAD_DATA_CHECKSUM: u8 = 0xc1;
const INVALID_COMMAND: u8 = 0xc3;

/// The text section of the stub in `resources/stub.toml`
pub fn stub_text() -> Vec<u8> {
    (0..8000u32).map(|i| ((i * 7 + 3) % 256) as u8).collect()
}

/// The data section of the stub in `resources/stub.toml`
pub fn stub_data() -> Vec<u8> {
    (0..300u32).map(|i| (i % 251) as u8).collect()
}

/// A request received by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub op: u8,
    pub checksum: u32,
    pub payload: Vec<u8>,
}

impl Request {
    /// The `i`th little endian word of the payload
    pub fn word(&self, i: usize) -> u32 {
        u32::from_le_bytes(self.payload[i * 4..i * 4 + 4].try_into().unwrap())
    }

    /// Sequence number of a data command
    pub fn sequence(&self) -> u32 {
        self.word(1)
    }

    /// Block carried by a data command
    pub fn data(&self) -> &[u8] {
        &self.payload[16..]
    }
}

/// A change of the DTR and RTS lines, and when it happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineChange {
    pub dtr: bool,
    pub rts: bool,
    pub at: Duration,
}

/// Behaves like a ROM bootloader which can be told to misbehave
#[derive(Debug)]
pub struct SimulatedDevice {
    /// Value of the chip detect magic register
    pub magic: u32,
    /// Number of sync commands left unanswered before the device wakes up
    pub ignored_syncs: usize,
    /// Line noise sent ahead of every response
    pub noise: Vec<u8>,
    /// Send a frame nobody asked for ahead of every response
    pub unsolicited: bool,
    /// Never answer the data block with this sequence number
    pub drop_sequence: Option<u32>,
    /// Echo the sequence number of data blocks in the value field
    pub echo_sequence: bool,
    /// Echo a wrong sequence number for this block
    pub wrong_sequence_at: Option<u32>,
    /// What the stub sends once started
    pub handshake: Vec<u8>,
    /// Printed by the device every time it comes out of reset
    pub boot_log: Option<String>,
    /// Fail the write carrying a request with this opcode, and every one after
    pub fail_on: Option<u8>,
    /// Report a wrong digest for the flash contents
    pub corrupt_md5: bool,
    /// Number of status bytes the ROM appends to each response
    pub rom_status_len: usize,

    pub requests: Vec<Request>,
    pub lines: Vec<LineChange>,
    pub bauds: Vec<u32>,
    pub flash: Vec<u8>,
    /// Sizes of the inflated blocks of the last compressed write
    pub inflated_blocks: Vec<usize>,
    /// Data loaded into RAM, by address
    pub ram: HashMap<u32, Vec<u8>>,
    pub stub_running: bool,

    broken: bool,
    inbox: Vec<u8>,
    outbox: VecDeque<Vec<u8>>,
    registers: HashMap<u32, u32>,
    syncs_seen: usize,
    write_offset: usize,
    ram_offset: u32,
    decoder: Option<ZlibDecoder<Vec<u8>>>,
    start: Instant,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new(MAGIC_ESP32)
    }
}

impl SimulatedDevice {
    pub fn new(magic: u32) -> Self {
        Self {
            magic,
            ignored_syncs: 0,
            noise: Vec::new(),
            unsolicited: false,
            drop_sequence: None,
            echo_sequence: false,
            wrong_sequence_at: None,
            handshake: b"OHAI".to_vec(),
            boot_log: None,
            fail_on: None,
            corrupt_md5: false,
            rom_status_len: if magic == MAGIC_ESP8266 { 2 } else { 4 },
            requests: Vec::new(),
            lines: Vec::new(),
            bauds: Vec::new(),
            flash: vec![0xff; FLASH_SIZE],
            inflated_blocks: Vec::new(),
            ram: HashMap::new(),
            stub_running: false,
            broken: false,
            inbox: Vec::new(),
            outbox: VecDeque::new(),
            registers: HashMap::new(),
            syncs_seen: 0,
            write_offset: 0,
            ram_offset: 0,
            decoder: None,
            start: Instant::now(),
        }
    }

    pub fn set_register(&mut self, address: u32, value: u32) {
        self.registers.insert(address, value);
    }

    /// Opcodes of every request received, in order
    pub fn opcodes(&self) -> Vec<u8> {
        self.requests.iter().map(|r| r.op).collect()
    }

    /// Requests with the given opcode
    pub fn requests_of(&self, op: u8) -> Vec<&Request> {
        self.requests.iter().filter(|r| r.op == op).collect()
    }

    /// Queue raw bytes for the host
    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.outbox.push_back(bytes.to_vec());
    }

    fn handle(&mut self, request: Request) {
        self.requests.push(request.clone());

        match request.op {
            op::SYNC => {
                self.syncs_seen += 1;
                if self.syncs_seen <= self.ignored_syncs {
                    return;
                }
                // The ROM answers a sync several times
                for _ in 0..3 {
                    self.respond(op::SYNC, 0, &[]);
                }
            }
            op::READ_REG => {
                let address = request.word(0);
                let value = match address {
                    CHIP_DETECT_MAGIC_REG_ADDR => self.magic,
                    _ => self.registers.get(&address).copied().unwrap_or(0),
                };
                self.respond(op::READ_REG, value, &[]);
            }
            op::WRITE_REG => {
                self.registers.insert(request.word(0), request.word(1));
                self.respond(op::WRITE_REG, 0, &[]);
            }
            op::FLASH_BEGIN | op::FLASH_DEFL_BEGIN => {
                let size = request.word(0) as usize;
                let offset = request.word(3) as usize;

                self.erase(offset, size.div_ceil(SECTOR_SIZE) * SECTOR_SIZE);
                self.write_offset = offset;
                self.inflated_blocks.clear();
                self.decoder = (request.op == op::FLASH_DEFL_BEGIN)
                    .then(|| ZlibDecoder::new(Vec::new()));

                self.respond(request.op, 0, &[]);
            }
            op::FLASH_DATA | op::FLASH_DEFL_DATA => {
                let sequence = request.sequence();
                if self.drop_sequence == Some(sequence) {
                    return;
                }

                let block = match self.decoder.as_mut() {
                    Some(decoder) => {
                        decoder.write_all(request.data()).unwrap();
                        decoder.flush().unwrap();
                        let inflated = std::mem::take(decoder.get_mut());
                        self.inflated_blocks.push(inflated.len());
                        inflated
                    }
                    None => request.data().to_vec(),
                };

                if checksum(&block) != request.checksum {
                    self.respond_error(request.op, BAD_DATA_CHECKSUM);
                    return;
                }

                let end = self.write_offset + block.len();
                self.flash[self.write_offset..end].copy_from_slice(&block);
                self.write_offset = end;

                self.respond(request.op, self.sequence_value(sequence), &[]);
            }
            op::FLASH_END | op::FLASH_DEFL_END => self.respond(request.op, 0, &[]),
            op::MEM_BEGIN => {
                self.ram_offset = request.word(3);
                self.ram.insert(self.ram_offset, Vec::new());
                self.respond(op::MEM_BEGIN, 0, &[]);
            }
            op::MEM_DATA => {
                if checksum(request.data()) != request.checksum {
                    self.respond_error(op::MEM_DATA, BAD_DATA_CHECKSUM);
                    return;
                }

                self.ram
                    .entry(self.ram_offset)
                    .or_default()
                    .extend_from_slice(request.data());

                let value = self.sequence_value(request.sequence());
                self.respond(op::MEM_DATA, value, &[]);
            }
            op::MEM_END => {
                self.respond(op::MEM_END, 0, &[]);

                let handshake = self.handshake.clone();
                self.outbox.push_back(slip::encode(&handshake));
                self.stub_running = handshake == b"OHAI";
            }
            op::FLASH_MD5 => {
                let offset = request.word(0) as usize;
                let size = request.word(1) as usize;

                let mut digest = [0; 16];
                digest.copy_from_slice(&Md5::digest(&self.flash[offset..offset + size]));
                if self.corrupt_md5 {
                    digest[0] ^= 0xff;
                }

                let body = match self.stub_running {
                    true => digest.to_vec(),
                    false => digest
                        .iter()
                        .map(|b| format!("{b:02x}"))
                        .collect::<String>()
                        .into_bytes(),
                };
                self.respond(op::FLASH_MD5, 0, &body);
            }
            op::ERASE_REGION if self.stub_running => {
                self.erase(request.word(0) as usize, request.word(1) as usize);
                self.respond(op::ERASE_REGION, 0, &[]);
            }
            op::ERASE_FLASH if self.stub_running => {
                self.flash.fill(0xff);
                self.respond(op::ERASE_FLASH, 0, &[]);
            }
            op::CHANGE_BAUDRATE => self.respond(op::CHANGE_BAUDRATE, 0, &[]),
            other => self.respond_error(other, INVALID_COMMAND),
        }
    }

    fn sequence_value(&self, sequence: u32) -> u32 {
        match (self.echo_sequence, self.wrong_sequence_at) {
            (false, _) => 0,
            (true, Some(wrong)) if wrong == sequence => sequence + 1,
            (true, _) => sequence,
        }
    }

    fn erase(&mut self, offset: usize, size: usize) {
        let end = (offset + size).min(self.flash.len());
        self.flash[offset..end].fill(0xff);
    }

    fn status(&self, error: Option<u8>) -> Vec<u8> {
        let mut status = match error {
            Some(code) => vec![1, code],
            None => vec![0, 0],
        };
        if !self.stub_running {
            status.resize(self.rom_status_len, 0);
        }
        status
    }

    fn respond(&mut self, op: u8, value: u32, data: &[u8]) {
        let status = self.status(None);
        self.send_response(op, value, data, status);
    }

    fn respond_error(&mut self, op: u8, code: u8) {
        let status = self.status(Some(code));
        self.send_response(op, 0, &[], status);
    }

    fn send_response(&mut self, op: u8, value: u32, data: &[u8], status: Vec<u8>) {
        if !self.noise.is_empty() {
            self.outbox.push_back(self.noise.clone());
        }
        if self.unsolicited {
            let frame = response_frame(0x7f, 0xdead_beef, &[], &self.status(None));
            self.outbox.push_back(slip::encode(&frame));
        }

        let frame = response_frame(op, value, data, &status);
        self.outbox.push_back(slip::encode(&frame));
    }
}

fn response_frame(op: u8, value: u32, data: &[u8], status: &[u8]) -> Vec<u8> {
    let len = (data.len() + status.len()) as u16;

    let mut frame = vec![1, op];
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&value.to_le_bytes());
    frame.extend_from_slice(data);
    frame.extend_from_slice(status);
    frame
}

fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0xef_u8, |check, byte| check ^ byte) as u32
}

impl Transport for SimulatedDevice {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.broken {
            return Err(io::ErrorKind::BrokenPipe.into());
        }

        self.inbox.extend_from_slice(bytes);

        loop {
            match slip::decode(&self.inbox) {
                Decoded::Frame { payload, consumed } => {
                    self.inbox.drain(..consumed);

                    if payload.len() < 8 || payload[0] != 0 {
                        continue;
                    }
                    if self.fail_on == Some(payload[1]) {
                        self.broken = true;
                        return Err(io::ErrorKind::BrokenPipe.into());
                    }

                    self.handle(Request {
                        op: payload[1],
                        checksum: u32::from_le_bytes(payload[4..8].try_into().unwrap()),
                        payload: payload[8..].to_vec(),
                    });
                }
                Decoded::Corrupt { consumed } => {
                    self.inbox.drain(..consumed);
                }
                Decoded::Incomplete => break,
            }
        }

        Ok(())
    }

    async fn read(&mut self, max: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        match self.outbox.pop_front() {
            Some(mut chunk) => {
                if chunk.len() > max {
                    let rest = chunk.split_off(max);
                    self.outbox.push_front(rest);
                }
                Ok(chunk)
            }
            None => {
                tokio::time::sleep(timeout).await;
                Ok(Vec::new())
            }
        }
    }

    async fn set_control_lines(&mut self, dtr: bool, rts: bool) -> io::Result<()> {
        if self.broken {
            return Err(io::ErrorKind::BrokenPipe.into());
        }

        self.lines.push(LineChange {
            dtr,
            rts,
            at: self.start.elapsed(),
        });

        // Both lines released: the chip comes out of reset into the ROM
        if !dtr && !rts {
            self.stub_running = false;
            self.outbox.clear();
            if let Some(log) = &self.boot_log {
                self.outbox.push_back(log.clone().into_bytes());
            }
        }

        Ok(())
    }

    async fn set_baud_rate(&mut self, baud: u32) -> io::Result<()> {
        self.bauds.push(baud);
        Ok(())
    }
}

/// Records every progress callback
#[derive(Debug, Default)]
pub struct ProgressRecorder {
    pub init: Option<(u32, usize)>,
    pub updates: Vec<usize>,
    pub finished: usize,
}

impl ProgressCallbacks for ProgressRecorder {
    fn init(&mut self, addr: u32, total: usize) {
        self.init = Some((addr, total));
    }

    fn update(&mut self, current: usize) {
        self.updates.push(current);
    }

    fn finish(&mut self) {
        self.finished += 1;
    }
}

/// A flasher which has already synchronised with `device`
pub async fn synced<T: Transport>(
    device: T,
    profile: ChipProfile,
    config: FlasherConfig,
) -> Flasher<T> {
    let mut flasher = Flasher::new(device, profile, config);
    flasher.sync().await.unwrap();
    flasher
}

/// The ESP32 profile carrying the stub in `resources/stub.toml`
pub fn esp32_with_stub() -> ChipProfile {
    ChipProfile {
        stub: Some(romflash::flasher::stubs::StubImage::from_toml(STUB_TOML).unwrap()),
        ..ChipProfile::esp32()
    }
}

/// Image which compresses well
pub fn compressible_image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i / 64 % 16) as u8).collect()
}

/// Image which does not compress at all
pub fn noisy_image(len: usize) -> Vec<u8> {
    let mut state = 0x1234_5678_u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}
