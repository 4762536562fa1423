//! Turns what DMA wrote into the frame the caller asked for
//!
//! Order matters: the window is cut first so later stages touch fewer
//! pixels, then luma is packed for YUV grayscale, then raw Bayer data is
//! debayered into the requested format.

pub mod convert;
pub mod debayer;
pub mod window;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::capture::frame::{PixelFormat, SubFormat, YuvOrder};
use crate::capture::strategy::{BusEncoding, CaptureSession};
use crate::error::{CaptureError, SensorError};
use crate::sensor::{Ioctl, IoctlReply, Sensor};

pub use debayer::AwbGains;

/// Where debayer gains come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AwbMode {
    /// Refreshed from sensor statistics every few frames
    #[default]
    Auto,
    Fixed { r: u16, g: u16, b: u16 },
}

/// Result of processing one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Processed {
    pub len: usize,
    pub subformat: SubFormat,
}

pub struct PixelPipeline {
    scratch: Vec<u8>,
    frames: u64,
    gains: AwbGains,
    awb: AwbMode,
    refresh_interval: u64,
}

impl PixelPipeline {
    pub fn new(awb: AwbMode, refresh_interval: u64) -> Self {
        let gains = match awb {
            AwbMode::Auto => AwbGains::UNITY,
            AwbMode::Fixed { r, g, b } => AwbGains { r, g, b },
        };
        Self {
            scratch: Vec::new(),
            frames: 0,
            gains,
            awb,
            refresh_interval: refresh_interval.max(1),
        }
    }

    pub fn gains(&self) -> AwbGains {
        self.gains
    }

    /// Processes the `raw_len` bytes DMA left at the front of `buf`.
    pub fn process(
        &mut self,
        sensor: &mut dyn Sensor,
        session: &CaptureSession,
        buf: &mut [u8],
        raw_len: usize,
    ) -> Result<Processed, CaptureError> {
        if session.format.is_compressed() {
            return Ok(Processed {
                len: raw_len,
                subformat: SubFormat::None,
            });
        }

        let win = session.window;
        let mut len = raw_len;
        if !session.strategy().crops_in_flight() {
            len = window::crop_in_place(buf, session.raster, win, session.bus_bpp)?;
            if session.encoding == BusEncoding::YuvLuma {
                let offset = usize::from(session.hw.yuv_swap);
                len = convert::luma_in_place(buf, win.pixels(), offset)?;
            }
        }

        if session.encoding == BusEncoding::Bayer {
            self.refresh_gains(sensor);
            let cfa = session.hw.cfa.shifted(win.x, win.y);
            let out_len = session.output_len();
            if buf.len() < out_len {
                return Err(CaptureError::Io {
                    stage: "debayer",
                    reason: format!("slot of {} bytes cannot hold {}", buf.len(), out_len),
                });
            }
            self.scratch.resize(out_len, 0);
            len = debayer::debayer(
                &buf[..win.pixels()],
                win.w as usize,
                win.h as usize,
                cfa,
                self.gains,
                session.format,
                &mut self.scratch,
            )?;
            buf[..len].copy_from_slice(&self.scratch[..len]);
        }

        let subformat = match session.format {
            PixelFormat::Bayer => SubFormat::Cfa(session.hw.cfa.shifted(win.x, win.y)),
            PixelFormat::Yuv422 if session.encoding == BusEncoding::Bayer => {
                SubFormat::Yuv(YuvOrder::Yuyv)
            }
            PixelFormat::Yuv422 => SubFormat::Yuv(session.hw.yuv_order.shifted(win.x)),
            _ => SubFormat::None,
        };
        Ok(Processed { len, subformat })
    }

    fn refresh_gains(&mut self, sensor: &mut dyn Sensor) {
        let frame = self.frames;
        self.frames += 1;
        if self.awb != AwbMode::Auto || frame % self.refresh_interval != 0 {
            return;
        }
        match sensor.ioctl(Ioctl::GetRgbStats) {
            Ok(IoctlReply::RgbStats(stats)) => {
                self.gains = AwbGains::from_stats(&stats);
                debug!(gains = ?self.gains, "white balance refreshed");
            }
            Ok(_) | Err(SensorError::UnsupportedOperation) => {}
            Err(e) => warn!("keeping previous white balance: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capture::frame::CfaPattern;
    use crate::capture::strategy::TransferKind;
    use crate::geometry::{Resolution, Window};
    use crate::sensor::{HwFlags, RgbStats, SimCapabilities, SimSensor};

    fn raw_session(window: Window, format: PixelFormat) -> CaptureSession {
        let hw = HwFlags {
            raw_output: true,
            cfa: CfaPattern::Rggb,
            ..HwFlags::default()
        };
        CaptureSession {
            format,
            raster: Resolution::new(4, 4),
            window,
            encoding: BusEncoding::resolve(format, 1, &hw),
            bus_bpp: 1,
            hw,
            transfer: TransferKind::WholeFrame,
            streaming: false,
            double_buffer: false,
            timeout: Duration::from_secs(3),
        }
    }

    #[test]
    fn odd_window_shifts_cfa_before_debayer() {
        // Raster is RGGB; a window at (1, 1) starts on a blue site
        let mut buf: Vec<u8> = (0..16usize)
            .map(|i| match CfaPattern::Rggb.channel_at(i % 4, i / 4) {
                crate::capture::frame::Channel::Red => 200,
                crate::capture::frame::Channel::Green => 100,
                crate::capture::frame::Channel::Blue => 50,
            })
            .collect();
        let session = raw_session(Window::new(1, 1, 2, 2), PixelFormat::Rgb565);
        let mut sensor = SimSensor::new(SimCapabilities::raw_bayer());
        let mut pipeline = PixelPipeline::new(AwbMode::Auto, 100);

        let out = pipeline.process(&mut sensor, &session, &mut buf, 16).unwrap();
        assert_eq!(out.len, 8);
        for px in buf[..8].chunks_exact(2) {
            assert_eq!(u16::from_le_bytes([px[0], px[1]]), 52006);
        }
    }

    #[test]
    fn stats_refresh_on_interval() {
        let stats = RgbStats {
            r: 50,
            gb: 100,
            gr: 100,
            b: 100,
        };
        let mut sensor = SimSensor::new(SimCapabilities {
            rgb_stats: Some(stats),
            ..SimCapabilities::raw_bayer()
        });
        let session = raw_session(Window::new(0, 0, 4, 4), PixelFormat::Grayscale);
        let mut pipeline = PixelPipeline::new(AwbMode::Auto, 100);

        let mut buf = vec![100; 16];
        pipeline.process(&mut sensor, &session, &mut buf, 16).unwrap();
        assert_eq!(pipeline.gains().r, 512);
    }

    #[test]
    fn fixed_gains_ignore_stats() {
        let mut sensor = SimSensor::new(SimCapabilities::raw_bayer());
        let session = raw_session(Window::new(0, 0, 4, 4), PixelFormat::Grayscale);
        let mut pipeline = PixelPipeline::new(AwbMode::Fixed { r: 300, g: 256, b: 200 }, 1);
        let mut buf = vec![100; 16];
        pipeline.process(&mut sensor, &session, &mut buf, 16).unwrap();
        assert_eq!(pipeline.gains(), AwbGains { r: 300, g: 256, b: 200 });
    }

    #[test]
    fn bayer_passthrough_keeps_cfa_tag() {
        let mut sensor = SimSensor::new(SimCapabilities::raw_bayer());
        let session = raw_session(Window::new(1, 0, 2, 2), PixelFormat::Bayer);
        let mut pipeline = PixelPipeline::new(AwbMode::Auto, 100);
        let mut buf: Vec<u8> = (0..16).collect();
        let out = pipeline.process(&mut sensor, &session, &mut buf, 16).unwrap();
        assert_eq!(out.len, 4);
        assert_eq!(&buf[..4], &[1, 2, 5, 6]);
        assert_eq!(out.subformat, SubFormat::Cfa(CfaPattern::Grbg));
    }
}
