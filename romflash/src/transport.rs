//! Byte transport used to talk to a target device
//!
//! The [Transport] trait is the only thing the protocol stack needs from the
//! outside world: a duplex byte channel with a configurable baud rate and two
//! control lines (DTR and RTS) that are wired to the chip's reset and boot
//! strapping pins on most development boards.
//!
//! The stack never opens or closes the underlying device. An already-open
//! handle is passed in and handed back once the session is done with it.

use std::{future::Future, io, time::Duration};

#[cfg(feature = "serialport")]
pub use self::serial::SerialTransport;

/// An open duplex byte channel to a target device
pub trait Transport: Send {
    /// Write all of `bytes` to the device
    fn write(&mut self, bytes: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Read up to `max` bytes, waiting at most `timeout` for any to arrive
    ///
    /// An empty vector means nothing was received within the timeout; it is
    /// not an error.
    fn read(
        &mut self,
        max: usize,
        timeout: Duration,
    ) -> impl Future<Output = io::Result<Vec<u8>>> + Send;

    /// Drive the DTR and RTS control lines
    fn set_control_lines(
        &mut self,
        dtr: bool,
        rts: bool,
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Change the baud rate of the link
    fn set_baud_rate(&mut self, baud: u32) -> impl Future<Output = io::Result<()>> + Send;
}

impl<T: Transport> Transport for &mut T {
    fn write(&mut self, bytes: &[u8]) -> impl Future<Output = io::Result<()>> + Send {
        (**self).write(bytes)
    }

    fn read(
        &mut self,
        max: usize,
        timeout: Duration,
    ) -> impl Future<Output = io::Result<Vec<u8>>> + Send {
        (**self).read(max, timeout)
    }

    fn set_control_lines(
        &mut self,
        dtr: bool,
        rts: bool,
    ) -> impl Future<Output = io::Result<()>> + Send {
        (**self).set_control_lines(dtr, rts)
    }

    fn set_baud_rate(&mut self, baud: u32) -> impl Future<Output = io::Result<()>> + Send {
        (**self).set_baud_rate(baud)
    }
}

#[cfg(feature = "serialport")]
mod serial {
    use std::{io, time::Duration};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_serial::{ClearBuffer, SerialPort, SerialStream};

    use super::Transport;

    /// [Transport] over a serial port opened with `tokio-serial`
    #[derive(Debug)]
    pub struct SerialTransport {
        port: SerialStream,
    }

    impl SerialTransport {
        pub fn new(port: SerialStream) -> Self {
            Self { port }
        }
    }

    impl Transport for SerialTransport {
        async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.port.write_all(bytes).await?;
            self.port.flush().await
        }

        async fn read(&mut self, max: usize, timeout: Duration) -> io::Result<Vec<u8>> {
            let mut buf = vec![0; max];

            match tokio::time::timeout(timeout, self.port.read(&mut buf)).await {
                Ok(read) => {
                    let n = read?;
                    if n == 0 {
                        return Err(io::ErrorKind::UnexpectedEof.into());
                    }
                    buf.truncate(n);
                    Ok(buf)
                }
                Err(_elapsed) => Ok(Vec::new()),
            }
        }

        async fn set_control_lines(&mut self, dtr: bool, rts: bool) -> io::Result<()> {
            self.port.write_data_terminal_ready(dtr)?;
            self.port.write_request_to_send(rts)?;

            Ok(())
        }

        async fn set_baud_rate(&mut self, baud: u32) -> io::Result<()> {
            self.port.set_baud_rate(baud)?;
            self.port.clear(ClearBuffer::Input)?;

            Ok(())
        }
    }
}
