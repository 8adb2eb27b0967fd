//! Stub loader module.

use std::{borrow::Cow, io::Read};

use base64::{engine::general_purpose, Engine as _};
use flate2::read::ZlibDecoder;
use serde::{Deserialize, Serialize};

use crate::{error::Error, targets::Segment};

pub(crate) const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x40001000;
pub(crate) const EXPECTED_STUB_HANDSHAKE: &str = "OHAI";

/// How the segments of a stub image are packed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StubCompression {
    #[default]
    None,
    Zlib,
}

/// Flash stub object (deserialized from TOML, converted from JSON as used by
/// `esptool.py`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StubImage {
    /// Entry point (address)
    pub entry: u32,
    #[serde(default)]
    pub compression: StubCompression,
    /// Text (base64 encoded)
    pub text: String,
    /// Start of text section address
    pub text_start: u32,
    /// Data (base64 encoded)
    #[serde(default)]
    pub data: Option<String>,
    /// Start of data section address
    #[serde(default)]
    pub data_start: Option<u32>,
}

/// A decoded stub, ready to be loaded into RAM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubBinary {
    pub entry: u32,
    pub segments: Vec<Segment<'static>>,
}

impl StubImage {
    /// Parse a stub image from TOML
    pub fn from_toml(s: &str) -> Result<Self, Error> {
        toml::from_str(s).map_err(|e| Error::CorruptStubImage(e.to_string()))
    }

    /// Unpack the text and data sections
    pub fn decode(&self) -> Result<StubBinary, Error> {
        let mut segments = vec![Segment::new(self.text_start, self.unpack("text", &self.text)?)];

        match (&self.data, self.data_start) {
            (Some(data), Some(addr)) => {
                segments.push(Segment::new(addr, self.unpack("data", data)?))
            }
            (None, _) => {}
            (Some(_), None) => {
                return Err(Error::CorruptStubImage(
                    "data section has no start address".into(),
                ))
            }
        }

        Ok(StubBinary {
            entry: self.entry,
            segments,
        })
    }

    fn unpack(&self, section: &str, encoded: &str) -> Result<Cow<'static, [u8]>, Error> {
        let raw = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::CorruptStubImage(format!("{section} section: {e}")))?;

        match self.compression {
            StubCompression::None => Ok(Cow::Owned(raw)),
            StubCompression::Zlib => {
                let mut inflated = Vec::new();
                ZlibDecoder::new(raw.as_slice())
                    .read_to_end(&mut inflated)
                    .map_err(|e| Error::CorruptStubImage(format!("{section} section: {e}")))?;

                Ok(Cow::Owned(inflated))
            }
        }
    }
}
