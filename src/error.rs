//! Error taxonomy for the capture engine

use thiserror::Error;

use crate::capture::frame::PixelFormat;
use crate::geometry::{FrameSize, Resolution, Window};

/// Chip-level failures reported by sensor drivers and probing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("sensor bus transfer failed (register {register:#06x})")]
    IoFailure { register: u16 },

    #[error("sensor cannot produce {0:?}")]
    UnsupportedFormat(PixelFormat),

    #[error("sensor cannot produce frame size {0:?}")]
    UnsupportedFramesize(FrameSize),

    #[error("operation not supported by this sensor")]
    UnsupportedOperation,

    #[error("{control} level {value} outside what the sensor accepts")]
    OutOfRange { control: &'static str, value: i32 },

    #[error("unknown sensor (slave address {slave_addr:#04x}, id {chip_id:#06x})")]
    InvalidChipId { slave_addr: u8, chip_id: u16 },

    #[error("no sensor answered on the bus after all reset/power-down combinations")]
    NotDetected,
}

/// Frame buffer pool failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("frame buffer of {capacity} bytes cannot hold a {required} byte slot")]
    OutOfMemory { required: usize, capacity: usize },

    #[error("frame needs {required} bytes but only {capacity} are available")]
    FrameTooLarge { required: usize, capacity: usize },

    #[error("no free frame buffer slot")]
    NoFreeSlot,

    #[error("slot {0} is not the current DMA destination")]
    SlotBusy(usize),

    #[error("write of {len} bytes at offset {offset} overruns a {slot_len} byte slot")]
    OutOfBounds {
        offset: usize,
        len: usize,
        slot_len: usize,
    },

    #[error("buffer count {requested} outside 1..={max}")]
    InvalidCount { requested: usize, max: usize },
}

/// Failures of a capture call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("capture not possible: {0}")]
    InvalidState(&'static str),

    #[error("window {window:?} does not fit the {raster:?} raster")]
    InvalidWindow { window: Window, raster: Resolution },

    #[error("capture FIFO overrun")]
    Overrun,

    #[error("bus error (code {0:#x})")]
    BusError(u32),

    #[error("no frame within {waited_ms} ms")]
    Timeout { waited_ms: u64 },

    #[error("pixel pipeline failed in {stage}: {reason}")]
    Io { stage: &'static str, reason: String },

    #[error(transparent)]
    Sensor(#[from] SensorError),

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

impl CaptureError {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::InvalidState(_) => "invalid_state",
            CaptureError::InvalidWindow { .. } => "invalid_window",
            CaptureError::Overrun => "overrun",
            CaptureError::BusError(_) => "bus_error",
            CaptureError::Timeout { .. } => "timeout",
            CaptureError::Io { .. } => "io",
            CaptureError::Sensor(_) => "sensor",
            CaptureError::Buffer(_) => "buffer",
        }
    }
}
