//! Transfer strategies for the `Transferring` state
//!
//! Whole-frame DMA lands the full raster in the slot and leaves windowing to
//! the pixel pipeline. Line-by-line DMA gets an interrupt per scanline and
//! crops (and extracts luma) while the next line is already on the bus.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::frame::PixelFormat;
use crate::capture::transport::{BusSetup, TransferMode};
use crate::geometry::{Resolution, Window};
use crate::pipeline::convert;
use crate::sensor::HwFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    #[default]
    WholeFrame,
    LineByLine,
}

impl TransferKind {
    pub fn strategy(self) -> &'static dyn TransferStrategy {
        match self {
            TransferKind::WholeFrame => &WholeFrameDma,
            TransferKind::LineByLine => &LineByLineDma,
        }
    }
}

/// How the bus encodes what the caller asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEncoding {
    /// Bus carries the requested format as is
    Native,
    /// Raw Bayer that has to be debayered
    Bayer,
    /// Grayscale carried as the luma byte of YUV422
    YuvLuma,
}

impl BusEncoding {
    pub fn resolve(format: PixelFormat, bus_bpp: usize, hw: &HwFlags) -> Self {
        match format {
            PixelFormat::Jpeg | PixelFormat::Bayer => BusEncoding::Native,
            _ if hw.raw_output => BusEncoding::Bayer,
            PixelFormat::Grayscale if bus_bpp == 2 => BusEncoding::YuvLuma,
            _ => BusEncoding::Native,
        }
    }
}

/// Everything one capture needs to know, fixed when it is armed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureSession {
    pub format: PixelFormat,
    pub raster: Resolution,
    pub window: Window,
    pub encoding: BusEncoding,
    pub bus_bpp: usize,
    pub hw: HwFlags,
    pub transfer: TransferKind,
    pub streaming: bool,
    pub double_buffer: bool,
    pub timeout: Duration,
}

impl CaptureSession {
    pub fn strategy(&self) -> &'static dyn TransferStrategy {
        self.transfer.strategy()
    }

    pub fn bus_setup(&self) -> BusSetup {
        BusSetup::new(
            &self.hw,
            self.raster.width,
            self.raster.height,
            self.bus_bpp,
            self.format.is_compressed(),
        )
    }

    /// Bytes per pixel left in the slot after in-flight extraction.
    pub fn line_bpp(&self) -> usize {
        match self.encoding {
            BusEncoding::Native => self.bus_bpp,
            BusEncoding::Bayer | BusEncoding::YuvLuma => 1,
        }
    }

    /// Size of the delivered frame.
    pub fn output_len(&self) -> usize {
        if self.format.is_compressed() {
            return self.strategy().dma_len(self);
        }
        self.format.frame_len(self.window.w, self.window.h)
    }

    /// Slot size that holds both the DMA payload and the converted frame.
    pub fn slot_len(&self) -> usize {
        self.strategy().dma_len(self).max(self.output_len())
    }
}

pub trait TransferStrategy: Send + Sync {
    fn kind(&self) -> TransferKind;

    /// Bytes DMA lands in the slot for one frame.
    fn dma_len(&self, session: &CaptureSession) -> usize;

    fn mode(&self, session: &CaptureSession) -> TransferMode;

    /// Whether windowing and luma extraction already happened during transfer.
    fn crops_in_flight(&self) -> bool;

    /// Handles one completed scanline, filling `out` with the bytes to
    /// store. Returns the slot offset for `out`, or `None` to drop the line.
    fn on_line(
        &self,
        session: &CaptureSession,
        row: u32,
        src: &[u8],
        out: &mut Vec<u8>,
    ) -> Option<usize>;
}

pub struct WholeFrameDma;

impl TransferStrategy for WholeFrameDma {
    fn kind(&self) -> TransferKind {
        TransferKind::WholeFrame
    }

    fn dma_len(&self, session: &CaptureSession) -> usize {
        let raster = session.raster;
        if session.format.is_compressed() {
            return session.format.frame_len(raster.width, raster.height);
        }
        raster.pixels() * session.bus_bpp
    }

    fn mode(&self, session: &CaptureSession) -> TransferMode {
        TransferMode::WholeFrame {
            length: self.dma_len(session),
        }
    }

    fn crops_in_flight(&self) -> bool {
        false
    }

    fn on_line(&self, _: &CaptureSession, _: u32, _: &[u8], _: &mut Vec<u8>) -> Option<usize> {
        None
    }
}

pub struct LineByLineDma;

impl TransferStrategy for LineByLineDma {
    fn kind(&self) -> TransferKind {
        TransferKind::LineByLine
    }

    fn dma_len(&self, session: &CaptureSession) -> usize {
        session.window.pixels() * session.line_bpp()
    }

    fn mode(&self, session: &CaptureSession) -> TransferMode {
        TransferMode::LineByLine {
            line_len: session.raster.width as usize * session.bus_bpp,
            lines: session.raster.height,
        }
    }

    fn crops_in_flight(&self) -> bool {
        true
    }

    fn on_line(
        &self,
        session: &CaptureSession,
        row: u32,
        src: &[u8],
        out: &mut Vec<u8>,
    ) -> Option<usize> {
        let win = session.window;
        if row < win.y || row >= win.y + win.h {
            return None;
        }
        let (x, w) = (win.x as usize, win.w as usize);
        out.clear();
        match session.encoding {
            BusEncoding::YuvLuma => {
                let offset = usize::from(session.hw.yuv_swap);
                convert::extract_luma_line(src, x, w, offset, out)?;
            }
            BusEncoding::Native | BusEncoding::Bayer => {
                let bpp = session.bus_bpp;
                out.extend_from_slice(src.get(x * bpp..(x + w) * bpp)?);
            }
        }
        Some((row - win.y) as usize * w * session.line_bpp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(format: PixelFormat, bus_bpp: usize, window: Window, transfer: TransferKind) -> CaptureSession {
        let hw = HwFlags {
            gs_bpp: bus_bpp as u8,
            ..HwFlags::default()
        };
        CaptureSession {
            format,
            raster: Resolution::new(8, 4),
            window,
            encoding: BusEncoding::resolve(format, bus_bpp, &hw),
            bus_bpp,
            hw,
            transfer,
            streaming: false,
            double_buffer: false,
            timeout: Duration::from_secs(3),
        }
    }

    #[test]
    fn whole_frame_lands_full_raster() {
        let s = session(PixelFormat::Rgb565, 2, Window::new(2, 1, 4, 2), TransferKind::WholeFrame);
        assert_eq!(s.strategy().dma_len(&s), 64);
        assert_eq!(s.output_len(), 16);
        assert_eq!(s.slot_len(), 64);
        assert_eq!(s.strategy().mode(&s), TransferMode::WholeFrame { length: 64 });
    }

    #[test]
    fn line_mode_crops_rows_and_columns() {
        let s = session(PixelFormat::Rgb565, 2, Window::new(2, 1, 4, 2), TransferKind::LineByLine);
        assert_eq!(s.slot_len(), 16);
        let line: Vec<u8> = (0..16).collect();
        let mut out = Vec::new();

        assert_eq!(s.strategy().on_line(&s, 0, &line, &mut out), None);
        assert_eq!(s.strategy().on_line(&s, 2, &line, &mut out), Some(8));
        assert_eq!(out, vec![4, 5, 6, 7, 8, 9, 10, 11]);
        assert_eq!(s.strategy().on_line(&s, 3, &line, &mut out), None);
    }

    #[test]
    fn line_mode_extracts_luma() {
        let s = session(PixelFormat::Grayscale, 2, Window::new(1, 0, 3, 4), TransferKind::LineByLine);
        assert_eq!(s.encoding, BusEncoding::YuvLuma);
        let line = [10, 128, 11, 128, 12, 128, 13, 128, 14, 128, 15, 128, 16, 128, 17, 128];
        let mut out = Vec::new();
        assert_eq!(s.strategy().on_line(&s, 1, &line, &mut out), Some(3));
        assert_eq!(out, vec![11, 12, 13]);
    }
}
