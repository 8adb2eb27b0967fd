//! Establish a connection with a target device
//!
//! The [Connection] struct abstracts over the transport and the
//! sending/decoding of commands. It does not know about sessions; the
//! [crate::flasher::Flasher] builds the bootloader state machine on top of
//! it.

use std::time::Duration;

use log::debug;
use tokio::time::Instant;

use self::command::{Command, CommandType};
use crate::{
    error::{Error, ProtocolError, Result, ResultExt, RomError, RomErrorKind, TimedOutCommand},
    slip::{self, Decoded},
    targets::{ChipProfile, OpcodeTable},
    transport::Transport,
};

pub mod command;
pub mod reset;

/// Direction byte of a request
const DIRECTION_REQUEST: u8 = 0x00;
/// Direction byte of a response
const DIRECTION_RESPONSE: u8 = 0x01;
/// Size of a response header: direction, opcode, length and value
const RESPONSE_HEADER_LEN: usize = 8;
/// Largest read issued to the transport at once
const READ_CHUNK: usize = 1024;
/// How long [Connection::drain] waits for more bytes to show up
const DRAIN_TIMEOUT: Duration = Duration::from_millis(10);
/// Upper bound on the number of reads a drain performs
const MAX_DRAIN_READS: usize = 64;

/// Number of status bytes the flasher stub appends to each response
pub const STUB_STATUS_LEN: usize = 2;

/// Which bootloader is producing responses
///
/// The width of the status trailer depends on it: the stub always reports
/// two bytes, the ROM reports as many as the chip profile says.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    #[default]
    Rom,
    Stub,
}

/// Outcome reported in the status bytes of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Failure {
        /// Raw error code, see [RomErrorKind]
        error: u8,
    },
}

/// A response from a target device following a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    /// Opcode echoed by the device
    pub op: u8,
    /// The value field of the header
    pub value: u32,
    /// Body of the response without the status bytes
    pub data: Vec<u8>,
    pub status: Status,
    /// The status bytes exactly as received
    pub raw_status: Vec<u8>,
}

/// An established connection with a target device
#[derive(Debug)]
pub struct Connection<T> {
    transport: T,
    buffer: Vec<u8>,
    opcodes: OpcodeTable,
    format: ResponseFormat,
    rom_status_len: usize,
    sequence_echo: bool,
    retries: usize,
}

impl<T: Transport> Connection<T> {
    /// Wrap an open transport, speaking the dialect described by `profile`
    pub fn new(transport: T, profile: &ChipProfile, retries: usize) -> Self {
        Connection {
            transport,
            buffer: Vec::with_capacity(READ_CHUNK),
            opcodes: profile.opcodes.clone(),
            format: ResponseFormat::Rom,
            rom_status_len: profile.rom_status_len,
            sequence_echo: profile.sequence_echo,
            retries,
        }
    }

    /// Switch the number of status bytes expected in each response
    pub fn set_response_format(&mut self, format: ResponseFormat) {
        debug!("Expecting {:?} response format", format);
        self.format = format;
    }

    pub fn response_format(&self) -> ResponseFormat {
        self.format
    }

    /// Number of status bytes expected at the end of each response body
    pub fn status_len(&self) -> usize {
        match self.format {
            ResponseFormat::Rom => self.rom_status_len,
            ResponseFormat::Stub => STUB_STATUS_LEN,
        }
    }

    /// Write a command and read its response
    ///
    /// Idempotent commands are written again when no response arrived within
    /// `timeout`, up to the configured number of retries.
    pub async fn command(
        &mut self,
        command: Command<'_>,
        timeout: Duration,
    ) -> Result<CommandResponse> {
        let retries = if command.command_type().is_idempotent() {
            self.retries
        } else {
            0
        };

        self.command_with_retries(command, timeout, retries).await
    }

    /// Write a command and read its response, retrying at most `retries`
    /// times on timeout
    pub async fn command_with_retries(
        &mut self,
        command: Command<'_>,
        timeout: Duration,
        retries: usize,
    ) -> Result<CommandResponse> {
        let ty = command.command_type();
        let mut attempt = 0;

        let response = loop {
            self.write_command(&command).await?;

            match self.read_response(ty, timeout).await.for_command(ty) {
                Err(Error::Timeout(_)) if attempt < retries => {
                    attempt += 1;
                    debug!("No response to {ty}, retrying ({attempt}/{retries})");
                }
                res => break res?,
            }
        };

        if let Status::Failure { error } = response.status {
            return Err(RomError::new(ty, RomErrorKind::from(error), response.raw_status).into());
        }

        if self.sequence_echo {
            if let Some(expected) = command.sequence() {
                if response.value != expected {
                    return Err(Error::SequenceError {
                        expected,
                        received: response.value,
                    });
                }
            }
        }

        Ok(response)
    }

    /// Write a command to the transport
    pub async fn write_command(&mut self, command: &Command<'_>) -> Result<()> {
        debug!("Writing command: {:?}", command);

        let opcode = self.opcodes.opcode(command.command_type());
        let mut packet = Vec::new();
        command.write(opcode, &mut packet)?;

        // Whatever is still buffered belongs to an earlier exchange
        self.buffer.clear();
        self.transport.write(&slip::encode(&packet)).await?;

        Ok(())
    }

    /// Wait for the response to a command of type `ty`
    ///
    /// Frames which are not a response to `ty` are discarded.
    async fn read_response(
        &mut self,
        ty: CommandType,
        timeout: Duration,
    ) -> Result<CommandResponse> {
        let deadline = Instant::now() + timeout;
        let opcode = self.opcodes.opcode(ty);

        loop {
            let frame = self.read_frame_until(deadline).await?;

            if frame.len() < 2 || frame[0] != DIRECTION_RESPONSE {
                debug!("Discarding unsolicited frame: {:02x?}", frame);
                continue;
            }

            if frame[1] != opcode {
                debug!(
                    "Discarding response to opcode {:#04x} while waiting for {ty}",
                    frame[1]
                );
                continue;
            }

            return self.parse_response(&frame).map_err(Error::Protocol);
        }
    }

    fn parse_response(&self, frame: &[u8]) -> std::result::Result<CommandResponse, ProtocolError> {
        if frame.len() < RESPONSE_HEADER_LEN {
            return Err(ProtocolError::Truncated(frame.len()));
        }

        let declared = u16::from_le_bytes([frame[2], frame[3]]) as usize;
        let value = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        let body = &frame[RESPONSE_HEADER_LEN..];

        if declared != body.len() {
            return Err(ProtocolError::LengthMismatch {
                declared,
                actual: body.len(),
            });
        }

        let status_len = self.status_len();
        if body.len() < status_len {
            return Err(ProtocolError::MissingStatus(body.len()));
        }

        let (data, raw_status) = body.split_at(body.len() - status_len);
        let status = match raw_status[0] {
            0 => Status::Success,
            _ => Status::Failure {
                error: raw_status[1],
            },
        };

        Ok(CommandResponse {
            op: frame[1],
            value,
            data: data.to_vec(),
            status,
            raw_status: raw_status.to_vec(),
        })
    }

    /// Read the next non-empty frame, whatever it contains
    pub async fn read_frame(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        self.read_frame_until(Instant::now() + timeout).await
    }

    async fn read_frame_until(&mut self, deadline: Instant) -> Result<Vec<u8>> {
        loop {
            while let Some(frame) = self.next_buffered_frame() {
                if !frame.is_empty() {
                    return Ok(frame);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(TimedOutCommand::default()));
            }

            let bytes = self.transport.read(READ_CHUNK, remaining).await?;
            self.buffer.extend_from_slice(&bytes);
        }
    }

    /// Pop the first complete frame out of the receive buffer
    fn next_buffered_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            match slip::decode(&self.buffer) {
                Decoded::Frame { payload, consumed } => {
                    self.buffer.drain(..consumed);
                    return Some(payload);
                }
                Decoded::Corrupt { consumed } => {
                    debug!("Discarding corrupt frame of {} bytes", consumed);
                    self.buffer.drain(..consumed);
                }
                Decoded::Incomplete => {
                    // Without a delimiter in sight, everything is line noise
                    if !self.buffer.contains(&slip::END) {
                        self.buffer.clear();
                    }
                    return None;
                }
            }
        }
    }

    /// Discard anything pending on the link
    pub async fn drain(&mut self) -> Result<()> {
        self.buffer.clear();

        for _ in 0..MAX_DRAIN_READS {
            let bytes = self.transport.read(READ_CHUNK, DRAIN_TIMEOUT).await?;
            if bytes.is_empty() {
                break;
            }
            debug!("Drained {} bytes", bytes.len());
        }

        Ok(())
    }

    /// Read whatever raw bytes arrive within `timeout`, bypassing framing
    pub async fn read_raw(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let mut bytes = std::mem::take(&mut self.buffer);
        bytes.extend(self.transport.read(READ_CHUNK, timeout).await?);

        Ok(bytes)
    }

    /// Read a register
    pub async fn read_reg(&mut self, address: u32) -> Result<u32> {
        let response = self
            .command(Command::ReadReg { address }, CommandType::ReadReg.timeout())
            .await?;

        Ok(response.value)
    }

    /// Write a register, only touching the bits set in `mask`
    pub async fn write_reg(&mut self, address: u32, value: u32, mask: Option<u32>) -> Result<()> {
        self.command(
            Command::WriteReg {
                address,
                value,
                mask,
            },
            CommandType::WriteReg.timeout(),
        )
        .await?;

        Ok(())
    }

    /// Change the baud rate of the transport, not of the device
    pub async fn set_baud(&mut self, baud: u32) -> Result<()> {
        self.transport.set_baud_rate(baud).await?;
        Ok(())
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Give back the transport
    pub fn into_transport(self) -> T {
        self.transport
    }
}
