use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::sync::{Arc, MutexGuard};
use std::time::Instant;

use crate::framebuffer::FrameBufferPool;
use crate::geometry::{Resolution, Window};

/// Pixel formats the engine can deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Binary,
    Grayscale,
    Rgb565,
    Bayer,
    Yuv422,
    Jpeg,
}

impl PixelFormat {
    /// Bytes per pixel for fixed-size formats.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Grayscale | PixelFormat::Bayer => Some(1),
            PixelFormat::Rgb565 | PixelFormat::Yuv422 => Some(2),
            PixelFormat::Binary | PixelFormat::Jpeg => None,
        }
    }

    /// Payload size of a `width` x `height` frame. Binary is never
    /// captured and is sized like grayscale.
    pub fn frame_len(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            // Upper bound for the compressed stream
            PixelFormat::Jpeg => w * h,
            fixed => fixed.bytes_per_pixel().unwrap_or(1) * w * h,
        }
    }

    pub fn is_compressed(self) -> bool {
        self == PixelFormat::Jpeg
    }
}

/// Bayer color filter array layout, named by the top-left 2x2 block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CfaPattern {
    Bggr,
    Gbrg,
    Grbg,
    #[default]
    Rggb,
}

/// Color channel sampled at a CFA site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Red,
    Green,
    Blue,
}

impl CfaPattern {
    pub fn channel_at(self, x: usize, y: usize) -> Channel {
        let quad = match self {
            CfaPattern::Bggr => [Channel::Blue, Channel::Green, Channel::Green, Channel::Red],
            CfaPattern::Gbrg => [Channel::Green, Channel::Blue, Channel::Red, Channel::Green],
            CfaPattern::Grbg => [Channel::Green, Channel::Red, Channel::Blue, Channel::Green],
            CfaPattern::Rggb => [Channel::Red, Channel::Green, Channel::Green, Channel::Blue],
        };
        quad[(y & 1) * 2 + (x & 1)]
    }

    /// Pattern seen by a raster whose origin moved by (`dx`, `dy`).
    pub fn shifted(self, dx: u32, dy: u32) -> Self {
        let mut cfa = self;
        if dx & 1 == 1 {
            cfa = match cfa {
                CfaPattern::Bggr => CfaPattern::Gbrg,
                CfaPattern::Gbrg => CfaPattern::Bggr,
                CfaPattern::Grbg => CfaPattern::Rggb,
                CfaPattern::Rggb => CfaPattern::Grbg,
            };
        }
        if dy & 1 == 1 {
            cfa = match cfa {
                CfaPattern::Bggr => CfaPattern::Grbg,
                CfaPattern::Grbg => CfaPattern::Bggr,
                CfaPattern::Gbrg => CfaPattern::Rggb,
                CfaPattern::Rggb => CfaPattern::Gbrg,
            };
        }
        cfa
    }
}

/// Chroma byte order of packed YUV 4:2:2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum YuvOrder {
    #[default]
    Yuyv,
    Yvyu,
}

impl YuvOrder {
    pub fn shifted(self, dx: u32) -> Self {
        match (self, dx & 1) {
            (order, 0) => order,
            (YuvOrder::Yuyv, _) => YuvOrder::Yvyu,
            (YuvOrder::Yvyu, _) => YuvOrder::Yuyv,
        }
    }
}

/// Format-specific layout tag carried next to the pixel format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubFormat {
    #[default]
    None,
    Cfa(CfaPattern),
    Yuv(YuvOrder),
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Raster the frame was cut from (before windowing)
    pub raster: Resolution,
    /// Window origin inside the raster
    pub x: u32,
    pub y: u32,
    pub bytes_per_pixel: usize,
    pub format: PixelFormat,
    pub subformat: SubFormat,
    /// Valid payload bytes
    pub len: usize,
    pub captured_at: Instant,
}

impl FrameMetadata {
    pub fn window(&self) -> Window {
        Window::new(self.x, self.y, self.width, self.height)
    }
}

/// Pixels copied out of a pool slot, cheap to clone and send
#[derive(Clone)]
pub struct Frame {
    pub data: Bytes,
    pub meta: Arc<FrameMetadata>,
    /// When the copy was taken
    pub timestamp: Instant,
}

/// A delivered frame borrowed straight from its pool slot.
///
/// The slot stays checked out of the ring until this reference is
/// dropped. The borrow on the engine keeps a second capture from starting
/// while it is alive.
pub struct FrameRef<'a> {
    slot: Option<MutexGuard<'a, Vec<u8>>>,
    pool: &'a FrameBufferPool,
    meta: FrameMetadata,
}

impl<'a> FrameRef<'a> {
    pub(crate) fn new(
        slot: MutexGuard<'a, Vec<u8>>,
        pool: &'a FrameBufferPool,
        meta: FrameMetadata,
    ) -> Self {
        Self {
            slot: Some(slot),
            pool,
            meta,
        }
    }
}

impl FrameRef<'_> {
    pub fn data(&self) -> &[u8] {
        match &self.slot {
            Some(slot) => &slot[..self.meta.len],
            None => &[],
        }
    }

    pub fn meta(&self) -> &FrameMetadata {
        &self.meta
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    /// Copies the pixels out so the frame can outlive the slot.
    pub fn to_frame(&self) -> Frame {
        Frame {
            data: Bytes::copy_from_slice(self.data()),
            meta: Arc::new(self.meta.clone()),
            timestamp: Instant::now(),
        }
    }
}

impl Deref for FrameRef<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data()
    }
}

impl Drop for FrameRef<'_> {
    fn drop(&mut self) {
        // Unlock the pixels before handing the slot back to DMA
        self.slot.take();
        self.pool.free_current();
    }
}

impl std::fmt::Debug for FrameRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRef").field("meta", &self.meta).finish()
    }
}
