//! Library and application errors

use std::{
    fmt::{Display, Formatter},
    io,
};

use miette::Diagnostic;
use thiserror::Error;

use crate::{connection::command::CommandType, flasher::SessionState};

/// Result type used throughout romflash
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible errors returned by romflash
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Timeout while running {0}command")]
    #[diagnostic(
        code(romflash::timeout),
        help("Make sure the device is powered and still in download mode")
    )]
    Timeout(TimedOutCommand),

    #[error("Malformed response from the bootloader")]
    #[diagnostic(transparent)]
    Protocol(#[source] ProtocolError),

    #[error("Out of order response: expected sequence {expected}, device acknowledged {received}")]
    #[diagnostic(
        code(romflash::sequence),
        help("A frame was probably dropped on the link, try again at a lower baud rate")
    )]
    SequenceError { expected: u32, received: u32 },

    #[error("Failed to synchronise with the bootloader")]
    #[diagnostic(
        code(romflash::sync_failed),
        help("Ensure that the device is connected and the reset and boot pins are not being held down")
    )]
    SyncFailed,

    #[error("The flasher stub image is corrupt: {0}")]
    #[diagnostic(code(romflash::corrupt_stub))]
    CorruptStubImage(String),

    #[error("Writing flash at {offset:#x} failed after {bytes_sent} bytes")]
    #[diagnostic(
        code(romflash::flash_write_failed),
        help("The region is left partially written, erase it and write the whole image again")
    )]
    FlashWriteFailed {
        offset: u32,
        bytes_sent: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("The session has been closed")]
    #[diagnostic(
        code(romflash::session_closed),
        help("Reconnect to the device to start a new session")
    )]
    SessionClosed,

    #[error("IO error while using the transport: {0}")]
    #[diagnostic(code(romflash::transport))]
    Transport(#[source] io::Error),

    #[error("The bootloader returned an error")]
    #[diagnostic(transparent)]
    RomError(#[from] RomError),

    #[error("The {0} command requires using the RAM stub")]
    #[diagnostic(
        code(romflash::stub_required),
        help("Load the flasher stub before running this operation")
    )]
    StubRequired(CommandType),

    #[error("Cannot {operation} while the session is {state}")]
    #[diagnostic(code(romflash::invalid_state))]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Offset {offset:#x} is not aligned to the flash block size ({block_size:#x})")]
    #[diagnostic(code(romflash::unaligned_offset))]
    UnalignedOffset { offset: u32, block_size: u32 },

    #[error("Image of {0} bytes does not fit the 32-bit address space of the device")]
    #[diagnostic(code(romflash::image_too_big))]
    ImageTooBig(usize),

    #[error("Chip profile '{expected}' does not match the detected chip (magic value {found:#x})")]
    #[diagnostic(
        code(romflash::chip_mismatch),
        help("Ensure that the correct chip profile is selected")
    )]
    ChipMismatch { expected: String, found: u32 },

    #[error("Wrong boot mode detected ({0})! The chip needs to be in download mode.")]
    #[diagnostic(code(romflash::wrong_boot_mode))]
    WrongBootMode(String),

    #[error("The chip profile '{0}' does not include a flasher stub")]
    #[diagnostic(
        code(romflash::no_stub),
        help("Provide a stub image, or run without the stub")
    )]
    NoStub(String),

    #[error("Invalid stub handshake response received")]
    #[diagnostic(code(romflash::stub_handshake))]
    InvalidStubHandshake,

    #[error("Verification of flash content failed")]
    #[diagnostic(code(romflash::verify_failed))]
    VerifyFailed,

    #[error("Failed to parse the chip profile")]
    #[diagnostic(code(romflash::invalid_profile))]
    InvalidProfile(#[from] toml::de::Error),

    #[error("Chip profile `{profile}` is unusable: {reason}")]
    #[diagnostic(
        code(romflash::invalid_profile_value),
        help("Block and sector sizes must be non-zero and fit in a single frame")
    )]
    InvalidProfileValue { profile: String, reason: String },
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Transport(err)
    }
}

impl Error {
    /// Whether the byte stream can no longer be trusted after this error
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::FlashWriteFailed { source, .. } => source.is_fatal(),
            _ => false,
        }
    }
}

/// Responses which could not be interpreted
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("Response is too short ({0} bytes)")]
    #[diagnostic(
        code(romflash::protocol::truncated),
        help("Try hard-resetting the device and try again")
    )]
    Truncated(usize),

    #[error("Response length field says {declared} bytes but {actual} were received")]
    #[diagnostic(code(romflash::protocol::length_mismatch))]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Response body of {0} bytes cannot hold the status bytes")]
    #[diagnostic(code(romflash::protocol::missing_status))]
    MissingStatus(usize),

    #[error("Unexpected {command} response payload of {len} bytes")]
    #[diagnostic(code(romflash::protocol::unexpected_payload))]
    UnexpectedPayload { command: CommandType, len: usize },
}

/// An executed command which has timed out
#[derive(Clone, Debug, Default)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl TimedOutCommand {
    /// The command which timed out, if known
    pub fn command(&self) -> Option<CommandType> {
        self.command
    }
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

impl From<CommandType> for TimedOutCommand {
    fn from(ct: CommandType) -> Self {
        TimedOutCommand { command: Some(ct) }
    }
}

/// Errors originating from a device's ROM functionality
#[derive(Clone, Copy, Debug, Default, Diagnostic, Error, PartialEq, Eq, strum::FromRepr)]
#[non_exhaustive]
#[repr(u8)]
pub enum RomErrorKind {
    #[error("Invalid message received")]
    #[diagnostic(code(romflash::rom::invalid_message))]
    InvalidMessage = 0x05,

    #[error("Bootloader failed to execute command")]
    #[diagnostic(code(romflash::rom::failed))]
    FailedToAct = 0x06,

    #[error("Received message has invalid CRC")]
    #[diagnostic(code(romflash::rom::crc))]
    InvalidCrc = 0x07,

    #[error("Bootloader failed to write to flash")]
    #[diagnostic(code(romflash::rom::flash_write))]
    FlashWriteError = 0x08,

    #[error("Bootloader failed to read from flash")]
    #[diagnostic(code(romflash::rom::flash_read))]
    FlashReadError = 0x09,

    #[error("Invalid length for flash read")]
    #[diagnostic(code(romflash::rom::flash_read_length))]
    FlashReadLengthError = 0x0a,

    #[error("Malformed compressed data received")]
    #[diagnostic(code(romflash::rom::deflate))]
    DeflateError = 0x0b,

    #[error("Bad data length")]
    #[diagnostic(code(romflash::rom::data_len))]
    BadDataLen = 0xc0,

    #[error("Bad data checksum")]
    #[diagnostic(code(romflash::rom::data_crc))]
    BadDataChecksum = 0xc1,

    #[error("Bad block size")]
    #[diagnostic(code(romflash::rom::block_size))]
    BadBlocksize = 0xc2,

    #[error("Invalid command")]
    #[diagnostic(code(romflash::rom::cmd))]
    InvalidCommand = 0xc3,

    #[error("SPI operation failed")]
    #[diagnostic(code(romflash::rom::spi))]
    FailedSpiOp = 0xc4,

    #[error("SPI unlock failed")]
    #[diagnostic(code(romflash::rom::spi_unlock))]
    FailedSpiUnlock = 0xc5,

    #[error("Not in flash mode")]
    #[diagnostic(code(romflash::rom::flash_mode))]
    NotInFlashMode = 0xc6,

    #[error("Error when uncompressing the data")]
    #[diagnostic(code(romflash::rom::inflate))]
    InflateError = 0xc7,

    #[error("Didn't receive enough data")]
    #[diagnostic(code(romflash::rom::not_enough))]
    NotEnoughData = 0xc8,

    #[error("Received too much data")]
    #[diagnostic(code(romflash::rom::too_much_data))]
    TooMuchData = 0xc9,

    #[default]
    #[error("Other")]
    #[diagnostic(code(romflash::rom::other))]
    Other = 0xff,
}

impl From<u8> for RomErrorKind {
    fn from(raw: u8) -> Self {
        Self::from_repr(raw).unwrap_or_default()
    }
}

/// An error originating from a device's ROM functionality
#[derive(Clone, Debug, Diagnostic, Error)]
#[error("Error while running {command} command")]
#[non_exhaustive]
pub struct RomError {
    command: CommandType,
    #[source]
    kind: RomErrorKind,
    /// Status bytes exactly as reported by the device
    raw: Vec<u8>,
}

impl RomError {
    pub fn new(command: CommandType, kind: RomErrorKind, raw: Vec<u8>) -> RomError {
        RomError { command, kind, raw }
    }

    pub fn command(&self) -> CommandType {
        self.command
    }

    pub fn kind(&self) -> RomErrorKind {
        self.kind
    }

    /// Raw status payload of the failed response
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

pub(crate) trait ResultExt {
    /// Mark the command from which this error originates
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Timeout(_)) => Err(Error::Timeout(command.into())),
            res => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rom_error_kind_from_raw_code() {
        assert_eq!(RomErrorKind::from(0xc1), RomErrorKind::BadDataChecksum);
        assert_eq!(RomErrorKind::from(0x42), RomErrorKind::Other);
    }

    #[test]
    fn timeouts_are_tagged_with_their_command() {
        let res: Result<()> = Err(Error::Timeout(TimedOutCommand::default()));
        let err = res.for_command(CommandType::ReadReg).unwrap_err();

        assert_eq!(err.to_string(), "Timeout while running ReadReg command");
    }

    #[test]
    fn transport_errors_are_fatal() {
        let err = Error::FlashWriteFailed {
            offset: 0,
            bytes_sent: 0,
            source: Box::new(io::Error::from(io::ErrorKind::BrokenPipe).into()),
        };

        assert!(err.is_fatal());
        assert!(!Error::SyncFailed.is_fatal());
    }
}
