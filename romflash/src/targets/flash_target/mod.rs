//! Targets which can receive data through the bootloader
//!
//! A [FlashTarget] takes care of the begin/data/end command triplet of one
//! kind of memory: [FlashWriter] writes (and erases) flash, [RamTarget] loads
//! code into RAM.

use std::{borrow::Cow, future::Future};

pub use self::{flash::FlashWriter, ram::RamTarget};
use crate::{connection::Connection, error::Error, transport::Transport};

mod flash;
mod ram;

/// Operations for interacting with a flash target
pub trait FlashTarget {
    /// Begin the flashing operation
    fn begin<T: Transport>(
        &mut self,
        connection: &mut Connection<T>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Write a segment to the target device
    fn write_segment<T: Transport>(
        &mut self,
        connection: &mut Connection<T>,
        segment: Segment<'_>,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Complete the flashing operation
    fn finish<T: Transport>(
        &mut self,
        connection: &mut Connection<T>,
        reboot: bool,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Progress update callbacks
pub trait ProgressCallbacks: Send {
    /// Initialize some progress report
    fn init(&mut self, addr: u32, total: usize);
    /// Update some progress report with the number of bytes sent so far
    fn update(&mut self, current: usize);
    /// Finish some progress report
    fn finish(&mut self);
}

/// A segment of code or data destined for one address of the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment<'a> {
    pub addr: u32,
    pub data: Cow<'a, [u8]>,
}

impl<'a> Segment<'a> {
    pub fn new(addr: u32, data: impl Into<Cow<'a, [u8]>>) -> Self {
        Segment {
            addr,
            data: data.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// An image to be written to flash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashRegion<'a> {
    /// Flash offset, aligned to the flash block size
    pub offset: u32,
    pub data: &'a [u8],
    /// Whether to send the image compressed, when the bootloader allows it
    pub compressed: bool,
}

impl<'a> FlashRegion<'a> {
    pub fn new(offset: u32, data: &'a [u8], compressed: bool) -> Self {
        FlashRegion {
            offset,
            data,
            compressed,
        }
    }
}
