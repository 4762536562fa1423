//! Contract of the bus/DMA engine that moves pixels into the pool

use crate::capture::controller::IrqLine;
use crate::error::CaptureError;
use crate::framebuffer::DmaAddr;
use crate::sensor::{ClockEdge, HwFlags, Polarity};

/// Bus programming derived from the sensor's hardware flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusSetup {
    pub vsync: Polarity,
    pub hsync: Polarity,
    pub pixck: ClockEdge,
    pub frame_sync: bool,
    pub jpeg: bool,
    /// Raster on the bus, before any windowing
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: usize,
    pub byte_swap: bool,
}

impl BusSetup {
    pub fn new(hw: &HwFlags, width: u32, height: u32, bytes_per_pixel: usize, jpeg: bool) -> Self {
        Self {
            vsync: hw.vsync,
            hsync: hw.hsync,
            pixck: hw.pixck,
            frame_sync: hw.frame_sync,
            jpeg,
            width,
            height,
            bytes_per_pixel,
            byte_swap: hw.rgb_swap || hw.yuv_swap,
        }
    }

    pub fn line_len(&self) -> usize {
        self.width as usize * self.bytes_per_pixel
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// One transaction of up to `length` bytes, completion signalled once
    WholeFrame { length: usize },
    /// One interrupt per scanline of `line_len` bytes
    LineByLine { line_len: usize, lines: u32 },
}

/// Where the next frame goes and how it gets there
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaTarget {
    pub dest: DmaAddr,
    pub mode: TransferMode,
}

/// Bus/DMA driver.
///
/// Completion and fault events are reported through the [`IrqLine`] handed
/// to [`start`](Transport::start). When `IrqLine::frame_done` returns a new
/// target the driver keeps capturing into it without another `start`.
pub trait Transport: Send {
    fn configure(&mut self, setup: &BusSetup) -> Result<(), CaptureError>;

    fn start(&mut self, target: DmaTarget, irq: IrqLine) -> Result<(), CaptureError>;

    /// Stops DMA immediately; no further events may be delivered for the
    /// aborted transfer.
    fn abort(&mut self);

    fn is_busy(&self) -> bool;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn configure(&mut self, setup: &BusSetup) -> Result<(), CaptureError> {
        (**self).configure(setup)
    }

    fn start(&mut self, target: DmaTarget, irq: IrqLine) -> Result<(), CaptureError> {
        (**self).start(target, irq)
    }

    fn abort(&mut self) {
        (**self).abort()
    }

    fn is_busy(&self) -> bool {
        (**self).is_busy()
    }
}
