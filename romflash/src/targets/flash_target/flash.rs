use std::{borrow::Cow, io::Write};

use flate2::{
    write::{ZlibDecoder, ZlibEncoder},
    Compression,
};
use log::debug;

use crate::{
    connection::{
        command::{checksum, Command},
        Connection,
    },
    error::Error,
    targets::{BlockLimits, ChipProfile, FlashTarget, ProgressCallbacks, Segment},
    transport::Transport,
};

/// Writes images to the target device's flash
///
/// The number of bytes acknowledged by the device is kept across calls, so
/// that a failed write can tell how far it got.
#[derive(Debug)]
pub struct FlashWriter {
    limits: BlockLimits,
    sector_size: u32,
    checksum_seed: u8,
    compress: bool,
    need_end: bool,
    bytes_sent: usize,
}

impl FlashWriter {
    pub fn new(profile: &ChipProfile, limits: BlockLimits, compress: bool) -> Self {
        FlashWriter {
            limits,
            sector_size: profile.sector_size,
            checksum_seed: profile.checksum_seed,
            compress,
            need_end: false,
            bytes_sent: 0,
        }
    }

    /// Bytes of the (possibly compressed) stream acknowledged so far
    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    fn erase_size(&self, len: u32) -> u32 {
        len.div_ceil(self.sector_size).saturating_mul(self.sector_size)
    }
}

impl FlashTarget for FlashWriter {
    async fn begin<T: Transport>(&mut self, _connection: &mut Connection<T>) -> Result<(), Error> {
        self.need_end = false;
        self.bytes_sent = 0;

        Ok(())
    }

    async fn write_segment<T: Transport>(
        &mut self,
        connection: &mut Connection<T>,
        segment: Segment<'_>,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let addr = segment.addr;
        let size = u32::try_from(segment.size()).map_err(|_| Error::ImageTooBig(segment.size()))?;

        let stream: Cow<'_, [u8]> = if self.compress {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
            encoder.write_all(&segment.data)?;
            Cow::Owned(encoder.finish()?)
        } else {
            Cow::Borrowed(&segment.data)
        };

        let block_size = self.limits.flash_block_size;
        let block_count = stream.len().div_ceil(block_size as usize) as u32;
        let erase_size = self.erase_size(size);

        let begin = if self.compress {
            Command::FlashDeflBegin {
                size,
                blocks: block_count,
                block_size,
                offset: addr,
            }
        } else {
            Command::FlashBegin {
                size,
                blocks: block_count,
                block_size,
                offset: addr,
            }
        };

        debug!(
            "Writing {} bytes ({} on the wire, {} blocks) at {:#x}",
            size,
            stream.len(),
            block_count,
            addr
        );

        connection
            .command(begin, begin.command_type().timeout_for_size(erase_size))
            .await?;
        self.need_end = true;

        if let Some(cb) = progress.as_mut() {
            cb.init(addr, stream.len())
        }

        // decode the chunks to see what the device will have to save
        let mut decoder = ZlibDecoder::new(Vec::new());

        for (i, block) in stream.chunks(block_size as usize).enumerate() {
            let sequence = i as u32;

            let (command, decoded_len) = if self.compress {
                decoder.write_all(block)?;
                decoder.flush()?;
                let decoded = std::mem::take(decoder.get_mut());

                let command = Command::FlashDeflData {
                    data: block,
                    sequence,
                    checksum: checksum(&decoded, self.checksum_seed),
                };
                (command, decoded.len())
            } else {
                let command = Command::FlashData {
                    data: block,
                    sequence,
                    checksum: checksum(block, self.checksum_seed),
                };
                (command, block.len())
            };

            let timeout = command
                .command_type()
                .timeout_for_size(decoded_len as u32);
            connection.command(command, timeout).await?;

            self.bytes_sent += block.len();
            if let Some(cb) = progress.as_mut() {
                cb.update(self.bytes_sent)
            }
        }

        if let Some(cb) = progress.as_mut() {
            cb.finish()
        }

        Ok(())
    }

    async fn finish<T: Transport>(
        &mut self,
        connection: &mut Connection<T>,
        reboot: bool,
    ) -> Result<(), Error> {
        if !self.need_end {
            return Ok(());
        }

        let end = if self.compress {
            Command::FlashDeflEnd { reboot }
        } else {
            Command::FlashEnd { reboot }
        };

        connection.command(end, end.command_type().timeout()).await?;
        self.need_end = false;

        Ok(())
    }
}
