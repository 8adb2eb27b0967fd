use crate::{
    connection::{
        command::{checksum, Command, CommandType},
        Connection,
    },
    error::Error,
    targets::{FlashTarget, ProgressCallbacks, Segment},
    transport::Transport,
};

/// Applications running in the target device's RAM
#[derive(Debug)]
pub struct RamTarget {
    entry: Option<u32>,
    block_size: u32,
    checksum_seed: u8,
}

impl RamTarget {
    pub fn new(entry: Option<u32>, block_size: u32, checksum_seed: u8) -> Self {
        RamTarget {
            entry,
            block_size,
            checksum_seed,
        }
    }
}

impl FlashTarget for RamTarget {
    async fn begin<T: Transport>(&mut self, _connection: &mut Connection<T>) -> Result<(), Error> {
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
        let block_count = size.div_ceil(self.block_size);

        connection
            .command(
                Command::MemBegin {
                    size,
                    blocks: block_count,
                    block_size: self.block_size,
                    offset: addr,
                },
                CommandType::MemBegin.timeout(),
            )
            .await?;

        if let Some(cb) = progress.as_mut() {
            cb.init(addr, segment.size())
        }

        let mut written = 0;
        for (i, block) in segment.data.chunks(self.block_size as usize).enumerate() {
            connection
                .command(
                    Command::MemData {
                        data: block,
                        sequence: i as u32,
                        checksum: checksum(block, self.checksum_seed),
                    },
                    CommandType::MemData.timeout(),
                )
                .await?;

            written += block.len();
            if let Some(cb) = progress.as_mut() {
                cb.update(written)
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
        if reboot {
            let entry = self.entry.unwrap_or_default();
            connection
                .command(
                    Command::MemEnd {
                        no_entry: entry == 0,
                        entry,
                    },
                    CommandType::MemEnd.timeout(),
                )
                .await?;
        }

        Ok(())
    }
}
