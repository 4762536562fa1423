//! Sensor abstraction layer
//!
//! Every image sensor driver implements [`Sensor`]. Optional capabilities
//! default to [`SensorError::UnsupportedOperation`], so the capture engine
//! always gets an answer instead of a silent no-op. Sensor calls only touch
//! the chip's control registers; they never reach the frame buffer pool or
//! the DMA engine.

pub mod probe;
pub mod sim;

use serde::{Deserialize, Serialize};

use crate::capture::frame::{CfaPattern, PixelFormat, YuvOrder};
use crate::error::SensorError;
use crate::geometry::{FrameSize, Resolution, Window};

pub use probe::{probe, ChipId, Delay, ProbeResult, RegisterBus, SensorGpio, StdDelay};
pub use sim::{SimCapabilities, SimControls, SimSensor};

/// Active level of a control or sync line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    #[default]
    ActiveHigh,
    ActiveLow,
}

/// Pixel clock edge the bus samples data on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockEdge {
    #[default]
    Rising,
    Falling,
}

/// Bus-level properties a driver reports to the capture controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwFlags {
    pub vsync: Polarity,
    pub hsync: Polarity,
    pub pixck: ClockEdge,
    /// Sensor waits for a frame-sync pulse before each frame
    pub frame_sync: bool,
    /// Bytes per pixel the chip emits for grayscale (1, or 2 for YUV luma)
    pub gs_bpp: u8,
    /// Chip only emits raw Bayer data, color formats need debayering
    pub raw_output: bool,
    pub cfa: CfaPattern,
    pub yuv_order: YuvOrder,
    pub rgb_swap: bool,
    pub yuv_swap: bool,
}

impl Default for HwFlags {
    fn default() -> Self {
        Self {
            vsync: Polarity::ActiveHigh,
            hsync: Polarity::ActiveLow,
            pixck: ClockEdge::Rising,
            frame_sync: false,
            gs_bpp: 1,
            raw_output: false,
            cfa: CfaPattern::Rggb,
            yuv_order: YuvOrder::Yuyv,
            rgb_swap: false,
            yuv_swap: false,
        }
    }
}

/// Per-channel sums gathered by the sensor for white balancing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RgbStats {
    pub r: u32,
    pub gb: u32,
    pub gr: u32,
    pub b: u32,
}

/// Driver-specific requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ioctl {
    GetRgbStats,
    SetTriggeredMode(bool),
    GetTriggeredMode,
    SetReadoutWindow(Window),
    GetReadoutWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlReply {
    Done,
    RgbStats(RgbStats),
    Flag(bool),
    Window(Window),
}

/// Ceiling the automatic gain control may not exceed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GainCeiling {
    X2,
    X4,
    X8,
    X16,
    X32,
    X64,
    X128,
}

impl GainCeiling {
    pub fn factor(self) -> u32 {
        2 << self as u32
    }
}

/// Digital effect applied by the chip's image processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecialEffect {
    #[default]
    Normal,
    Negative,
}

/// Capability contract of an image sensor driver
pub trait Sensor: Send {
    fn chip_id(&self) -> ChipId;

    fn hw_flags(&self) -> HwFlags;

    /// Runs the chip reset sequence and waits for it to settle.
    fn reset(&mut self) -> Result<(), SensorError>;

    fn sleep(&mut self, _enable: bool) -> Result<(), SensorError> {
        Err(SensorError::UnsupportedOperation)
    }

    fn read_register(&mut self, _addr: u16) -> Result<u16, SensorError> {
        Err(SensorError::UnsupportedOperation)
    }

    fn write_register(&mut self, _addr: u16, _value: u16) -> Result<(), SensorError> {
        Err(SensorError::UnsupportedOperation)
    }

    /// Reprograms the output format, returning bytes per pixel on the bus.
    fn set_pixformat(&mut self, format: PixelFormat) -> Result<usize, SensorError>;

    /// Reprograms the output size, returning the raster the bus will carry.
    fn set_framesize(&mut self, size: FrameSize) -> Result<Resolution, SensorError>;

    fn set_windowing(&mut self, _window: Window) -> Result<(), SensorError> {
        Err(SensorError::UnsupportedOperation)
    }

    fn set_hmirror(&mut self, _enable: bool) -> Result<(), SensorError> {
        Err(SensorError::UnsupportedOperation)
    }

    fn set_vflip(&mut self, _enable: bool) -> Result<(), SensorError> {
        Err(SensorError::UnsupportedOperation)
    }

    fn ioctl(&mut self, _request: Ioctl) -> Result<IoctlReply, SensorError> {
        Err(SensorError::UnsupportedOperation)
    }

    // Image controls. Levels are chip steps around 0.

    fn set_framerate(&mut self, _fps: u32) -> Result<(), SensorError> {
        Err(SensorError::UnsupportedOperation)
    }

    fn set_contrast(&mut self, _level: i32) -> Result<(), SensorError> {
        Err(SensorError::UnsupportedOperation)
    }

    fn set_brightness(&mut self, _level: i32) -> Result<(), SensorError> {
        Err(SensorError::UnsupportedOperation)
    }

    fn set_saturation(&mut self, _level: i32) -> Result<(), SensorError> {
        Err(SensorError::UnsupportedOperation)
    }

    fn set_gainceiling(&mut self, _ceiling: GainCeiling) -> Result<(), SensorError> {
        Err(SensorError::UnsupportedOperation)
    }

    /// JPEG quantizer scale, 0 is best quality.
    fn set_quality(&mut self, _qs: u8) -> Result<(), SensorError> {
        Err(SensorError::UnsupportedOperation)
    }

    fn set_colorbar(&mut self, _enable: bool) -> Result<(), SensorError> {
        Err(SensorError::UnsupportedOperation)
    }

    /// With AGC off, `gain_db` fixes the gain. With AGC on,
    /// `ceiling_db` caps it. `None` leaves the value alone.
    fn set_auto_gain(
        &mut self,
        _enable: bool,
        _gain_db: Option<f32>,
        _ceiling_db: Option<f32>,
    ) -> Result<(), SensorError> {
        Err(SensorError::UnsupportedOperation)
    }

    fn gain_db(&mut self) -> Result<f32, SensorError> {
        Err(SensorError::UnsupportedOperation)
    }

    fn set_auto_exposure(
        &mut self,
        _enable: bool,
        _exposure_us: Option<u32>,
    ) -> Result<(), SensorError> {
        Err(SensorError::UnsupportedOperation)
    }

    fn exposure_us(&mut self) -> Result<u32, SensorError> {
        Err(SensorError::UnsupportedOperation)
    }

    /// Manual gains are red, green, blue in dB.
    fn set_auto_whitebal(
        &mut self,
        _enable: bool,
        _rgb_gain_db: Option<[f32; 3]>,
    ) -> Result<(), SensorError> {
        Err(SensorError::UnsupportedOperation)
    }

    fn rgb_gain_db(&mut self) -> Result<[f32; 3], SensorError> {
        Err(SensorError::UnsupportedOperation)
    }

    fn set_special_effect(&mut self, _effect: SpecialEffect) -> Result<(), SensorError> {
        Err(SensorError::UnsupportedOperation)
    }

    fn set_lens_correction(
        &mut self,
        _enable: bool,
        _radius: u32,
        _coef: u32,
    ) -> Result<(), SensorError> {
        Err(SensorError::UnsupportedOperation)
    }
}

impl<S: Sensor + ?Sized> Sensor for Box<S> {
    fn chip_id(&self) -> ChipId {
        (**self).chip_id()
    }

    fn hw_flags(&self) -> HwFlags {
        (**self).hw_flags()
    }

    fn reset(&mut self) -> Result<(), SensorError> {
        (**self).reset()
    }

    fn sleep(&mut self, enable: bool) -> Result<(), SensorError> {
        (**self).sleep(enable)
    }

    fn read_register(&mut self, addr: u16) -> Result<u16, SensorError> {
        (**self).read_register(addr)
    }

    fn write_register(&mut self, addr: u16, value: u16) -> Result<(), SensorError> {
        (**self).write_register(addr, value)
    }

    fn set_pixformat(&mut self, format: PixelFormat) -> Result<usize, SensorError> {
        (**self).set_pixformat(format)
    }

    fn set_framesize(&mut self, size: FrameSize) -> Result<Resolution, SensorError> {
        (**self).set_framesize(size)
    }

    fn set_windowing(&mut self, window: Window) -> Result<(), SensorError> {
        (**self).set_windowing(window)
    }

    fn set_hmirror(&mut self, enable: bool) -> Result<(), SensorError> {
        (**self).set_hmirror(enable)
    }

    fn set_vflip(&mut self, enable: bool) -> Result<(), SensorError> {
        (**self).set_vflip(enable)
    }

    fn ioctl(&mut self, request: Ioctl) -> Result<IoctlReply, SensorError> {
        (**self).ioctl(request)
    }

    fn set_framerate(&mut self, fps: u32) -> Result<(), SensorError> {
        (**self).set_framerate(fps)
    }

    fn set_contrast(&mut self, level: i32) -> Result<(), SensorError> {
        (**self).set_contrast(level)
    }

    fn set_brightness(&mut self, level: i32) -> Result<(), SensorError> {
        (**self).set_brightness(level)
    }

    fn set_saturation(&mut self, level: i32) -> Result<(), SensorError> {
        (**self).set_saturation(level)
    }

    fn set_gainceiling(&mut self, ceiling: GainCeiling) -> Result<(), SensorError> {
        (**self).set_gainceiling(ceiling)
    }

    fn set_quality(&mut self, qs: u8) -> Result<(), SensorError> {
        (**self).set_quality(qs)
    }

    fn set_colorbar(&mut self, enable: bool) -> Result<(), SensorError> {
        (**self).set_colorbar(enable)
    }

    fn set_auto_gain(
        &mut self,
        enable: bool,
        gain_db: Option<f32>,
        ceiling_db: Option<f32>,
    ) -> Result<(), SensorError> {
        (**self).set_auto_gain(enable, gain_db, ceiling_db)
    }

    fn gain_db(&mut self) -> Result<f32, SensorError> {
        (**self).gain_db()
    }

    fn set_auto_exposure(&mut self, enable: bool, exposure_us: Option<u32>) -> Result<(), SensorError> {
        (**self).set_auto_exposure(enable, exposure_us)
    }

    fn exposure_us(&mut self) -> Result<u32, SensorError> {
        (**self).exposure_us()
    }

    fn set_auto_whitebal(
        &mut self,
        enable: bool,
        rgb_gain_db: Option<[f32; 3]>,
    ) -> Result<(), SensorError> {
        (**self).set_auto_whitebal(enable, rgb_gain_db)
    }

    fn rgb_gain_db(&mut self) -> Result<[f32; 3], SensorError> {
        (**self).rgb_gain_db()
    }

    fn set_special_effect(&mut self, effect: SpecialEffect) -> Result<(), SensorError> {
        (**self).set_special_effect(effect)
    }

    fn set_lens_correction(&mut self, enable: bool, radius: u32, coef: u32) -> Result<(), SensorError> {
        (**self).set_lens_correction(enable, radius, coef)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bare;

    impl Sensor for Bare {
        fn chip_id(&self) -> ChipId {
            ChipId::Simulated
        }

        fn hw_flags(&self) -> HwFlags {
            HwFlags::default()
        }

        fn reset(&mut self) -> Result<(), SensorError> {
            Ok(())
        }

        fn set_pixformat(&mut self, _: PixelFormat) -> Result<usize, SensorError> {
            Ok(1)
        }

        fn set_framesize(&mut self, size: FrameSize) -> Result<Resolution, SensorError> {
            Ok(size.resolution())
        }
    }

    #[test]
    fn optional_controls_report_unsupported() {
        let mut sensor: Box<dyn Sensor> = Box::new(Bare);
        let unsupported = Err(SensorError::UnsupportedOperation);
        assert_eq!(sensor.set_contrast(1), unsupported);
        assert_eq!(sensor.set_gainceiling(GainCeiling::X8), unsupported);
        assert_eq!(sensor.set_auto_gain(true, None, Some(24.0)), unsupported);
        assert_eq!(sensor.gain_db(), Err(SensorError::UnsupportedOperation));
        assert_eq!(sensor.set_lens_correction(true, 10, 2), unsupported);
    }

    #[test]
    fn gain_ceiling_factors() {
        assert_eq!(GainCeiling::X2.factor(), 2);
        assert_eq!(GainCeiling::X16.factor(), 16);
        assert_eq!(GainCeiling::X128.factor(), 128);
    }
}
