//! SLIP framing of the serial byte stream
//!
//! Every command and response exchanged with the bootloader travels as one
//! SLIP frame: the payload is wrapped in [END] delimiters, and any payload
//! byte equal to [END] or [ESC] is replaced by a two byte escape sequence.
//!
//! [decode] is a pure function over a caller owned buffer, so the caller
//! decides how much of the stream to keep around between reads.
//!
//! See https://docs.espressif.com/projects/esptool/en/latest/esp32c3/advanced-topics/serial-protocol.html#low-level-protocol

/// SLIP end of packet token
pub const END: u8 = 0xC0;
/// SLIP escape token
pub const ESC: u8 = 0xDB;
/// SLIP escaped 0xC0 token
pub const ESC_END: u8 = 0xDC;
/// SLIP escaped 0xDB token
pub const ESC_ESC: u8 = 0xDD;

/// Result of decoding a SLIP frame from a buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame was found
    Frame {
        /// Unescaped payload
        payload: Vec<u8>,
        /// Number of bytes of the input buffer used up, including any noise
        /// preceding the frame and both delimiters
        consumed: usize,
    },
    /// No complete frame in the buffer yet, keep buffering
    Incomplete,
    /// An escape byte was followed by an invalid code
    Corrupt {
        /// Number of bytes to drop to skip past the damaged frame
        consumed: usize,
    },
}

/// Encode a payload as a single SLIP frame
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(END);

    for &value in payload {
        match value {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            _ => out.push(value),
        }
    }

    out.push(END);
    out
}

/// Attempt to decode the first SLIP frame in `buf`
///
/// Bytes before the first [END] are treated as line noise and skipped. An
/// empty frame (two back-to-back delimiters) only consumes its opening
/// delimiter, so the second one may still open the frame that follows.
pub fn decode(buf: &[u8]) -> Decoded {
    let Some(start) = buf.iter().position(|&b| b == END) else {
        return Decoded::Incomplete;
    };

    if buf.get(start + 1) == Some(&END) {
        return Decoded::Frame {
            payload: Vec::new(),
            consumed: start + 1,
        };
    }

    let mut payload = Vec::new();
    let mut escaped = false;

    for (i, &value) in buf.iter().enumerate().skip(start + 1) {
        if escaped {
            escaped = false;
            match value {
                ESC_END => payload.push(END),
                ESC_ESC => payload.push(ESC),
                END => {
                    // The frame ended in the middle of an escape sequence,
                    // keep the delimiter so the next frame can start on it
                    return Decoded::Corrupt { consumed: i };
                }
                _ => {
                    // Resynchronise on the next delimiter, which is kept so
                    // it can open the following frame
                    let consumed = buf[i..]
                        .iter()
                        .position(|&b| b == END)
                        .map_or(buf.len(), |p| i + p);

                    return Decoded::Corrupt { consumed };
                }
            }
            continue;
        }

        match value {
            END => {
                return Decoded::Frame {
                    payload,
                    consumed: i + 1,
                };
            }
            ESC => escaped = true,
            _ => payload.push(value),
        }
    }

    Decoded::Incomplete
}
