//! Software sensor for host-side runs and tests

use std::collections::HashMap;

use tracing::debug;

use super::probe::ChipId;
use super::{GainCeiling, HwFlags, Ioctl, IoctlReply, RgbStats, Sensor, SpecialEffect};
use crate::capture::frame::{CfaPattern, PixelFormat};
use crate::error::SensorError;
use crate::geometry::{FrameSize, Resolution, Window};

/// Mirror/flip control register, laid out like the OmniVision parts
pub const REG_MVFP: u16 = 0x1E;
pub const MVFP_MIRROR: u16 = 1 << 5;
pub const MVFP_FLIP: u16 = 1 << 4;

/// What the simulated chip claims to support
#[derive(Debug, Clone)]
pub struct SimCapabilities {
    pub formats: Vec<PixelFormat>,
    /// Only raw Bayer leaves the chip
    pub raw_output: bool,
    /// Bus bytes per pixel for grayscale (2 = luma inside YUV422)
    pub gs_bpp: u8,
    pub max_resolution: Resolution,
    pub windowing: bool,
    pub mirror_flip: bool,
    pub cfa: CfaPattern,
    /// Answer to `Ioctl::GetRgbStats`, `None` if the chip has no statistics
    pub rgb_stats: Option<RgbStats>,
}

impl Default for SimCapabilities {
    fn default() -> Self {
        Self {
            formats: vec![
                PixelFormat::Grayscale,
                PixelFormat::Rgb565,
                PixelFormat::Yuv422,
                PixelFormat::Bayer,
                PixelFormat::Jpeg,
            ],
            raw_output: false,
            gs_bpp: 1,
            max_resolution: Resolution::new(1600, 1200),
            windowing: true,
            mirror_flip: true,
            cfa: CfaPattern::Rggb,
            rgb_stats: None,
        }
    }
}

impl SimCapabilities {
    /// Raw Bayer chip whose color output goes through the debayer stage.
    pub fn raw_bayer() -> Self {
        Self {
            formats: vec![
                PixelFormat::Grayscale,
                PixelFormat::Rgb565,
                PixelFormat::Yuv422,
                PixelFormat::Bayer,
            ],
            raw_output: true,
            rgb_stats: Some(RgbStats {
                r: 1 << 16,
                gb: 1 << 16,
                gr: 1 << 16,
                b: 1 << 16,
            }),
            ..Self::default()
        }
    }

    /// YUV chip that delivers grayscale as the luma of YUV422.
    pub fn yuv_luma() -> Self {
        Self {
            gs_bpp: 2,
            ..Self::default()
        }
    }
}

/// Contrast, brightness and saturation steps either side of neutral
pub const LEVEL_RANGE: std::ops::RangeInclusive<i32> = -3..=3;

/// Image controls as the chip would hold them in its registers
#[derive(Debug, Clone, PartialEq)]
pub struct SimControls {
    pub framerate: u32,
    pub contrast: i32,
    pub brightness: i32,
    pub saturation: i32,
    pub gainceiling: GainCeiling,
    pub quality: u8,
    pub colorbar: bool,
    pub auto_gain: bool,
    pub gain_db: f32,
    pub gain_ceiling_db: f32,
    pub auto_exposure: bool,
    pub exposure_us: u32,
    pub auto_whitebal: bool,
    pub rgb_gain_db: [f32; 3],
    pub effect: SpecialEffect,
    pub lens_correction: Option<(u32, u32)>,
}

impl Default for SimControls {
    fn default() -> Self {
        Self {
            framerate: 30,
            contrast: 0,
            brightness: 0,
            saturation: 0,
            gainceiling: GainCeiling::X8,
            quality: 12,
            colorbar: false,
            auto_gain: true,
            gain_db: 0.0,
            gain_ceiling_db: 18.0,
            auto_exposure: true,
            exposure_us: 10_000,
            auto_whitebal: true,
            rgb_gain_db: [0.0; 3],
            effect: SpecialEffect::Normal,
            lens_correction: None,
        }
    }
}

fn level(control: &'static str, value: i32) -> Result<i32, SensorError> {
    if LEVEL_RANGE.contains(&value) {
        Ok(value)
    } else {
        Err(SensorError::OutOfRange { control, value })
    }
}

#[derive(Debug)]
pub struct SimSensor {
    caps: SimCapabilities,
    controls: SimControls,
    registers: HashMap<u16, u16>,
    format: Option<PixelFormat>,
    framesize: Option<FrameSize>,
    window: Option<Window>,
    triggered: bool,
    readout: Option<Window>,
    asleep: bool,
}

impl SimSensor {
    pub fn new(caps: SimCapabilities) -> Self {
        Self {
            caps,
            controls: SimControls::default(),
            registers: HashMap::new(),
            format: None,
            framesize: None,
            window: None,
            triggered: false,
            readout: None,
            asleep: false,
        }
    }

    pub fn format(&self) -> Option<PixelFormat> {
        self.format
    }

    pub fn is_asleep(&self) -> bool {
        self.asleep
    }

    pub fn controls(&self) -> &SimControls {
        &self.controls
    }

    fn set_mvfp_bit(&mut self, bit: u16, enable: bool) -> Result<(), SensorError> {
        if !self.caps.mirror_flip {
            return Err(SensorError::UnsupportedOperation);
        }
        let reg = self.registers.entry(REG_MVFP).or_insert(0);
        if enable {
            *reg |= bit;
        } else {
            *reg &= !bit;
        }
        Ok(())
    }
}

impl Default for SimSensor {
    fn default() -> Self {
        Self::new(SimCapabilities::default())
    }
}

impl Sensor for SimSensor {
    fn chip_id(&self) -> ChipId {
        ChipId::Simulated
    }

    fn hw_flags(&self) -> HwFlags {
        HwFlags {
            gs_bpp: self.caps.gs_bpp,
            raw_output: self.caps.raw_output,
            cfa: self.caps.cfa,
            ..HwFlags::default()
        }
    }

    fn reset(&mut self) -> Result<(), SensorError> {
        self.registers.clear();
        self.controls = SimControls::default();
        self.format = None;
        self.framesize = None;
        self.window = None;
        self.triggered = false;
        self.readout = None;
        self.asleep = false;
        debug!("simulated sensor reset");
        Ok(())
    }

    fn sleep(&mut self, enable: bool) -> Result<(), SensorError> {
        self.asleep = enable;
        Ok(())
    }

    fn read_register(&mut self, addr: u16) -> Result<u16, SensorError> {
        Ok(self.registers.get(&addr).copied().unwrap_or(0))
    }

    fn write_register(&mut self, addr: u16, value: u16) -> Result<(), SensorError> {
        self.registers.insert(addr, value);
        Ok(())
    }

    fn set_pixformat(&mut self, format: PixelFormat) -> Result<usize, SensorError> {
        if !self.caps.formats.contains(&format) {
            return Err(SensorError::UnsupportedFormat(format));
        }
        let bus_bpp = match format {
            PixelFormat::Grayscale if self.caps.raw_output => 1,
            PixelFormat::Grayscale => usize::from(self.caps.gs_bpp),
            PixelFormat::Rgb565 | PixelFormat::Yuv422 if self.caps.raw_output => 1,
            PixelFormat::Rgb565 | PixelFormat::Yuv422 => 2,
            PixelFormat::Bayer | PixelFormat::Jpeg => 1,
            PixelFormat::Binary => return Err(SensorError::UnsupportedFormat(format)),
        };
        self.format = Some(format);
        Ok(bus_bpp)
    }

    fn set_framesize(&mut self, size: FrameSize) -> Result<Resolution, SensorError> {
        let res = size.resolution();
        if !self.caps.max_resolution.contains(res) {
            return Err(SensorError::UnsupportedFramesize(size));
        }
        self.framesize = Some(size);
        self.window = None;
        Ok(res)
    }

    fn set_windowing(&mut self, window: Window) -> Result<(), SensorError> {
        if !self.caps.windowing {
            return Err(SensorError::UnsupportedOperation);
        }
        self.window = Some(window);
        Ok(())
    }

    fn set_hmirror(&mut self, enable: bool) -> Result<(), SensorError> {
        self.set_mvfp_bit(MVFP_MIRROR, enable)
    }

    fn set_vflip(&mut self, enable: bool) -> Result<(), SensorError> {
        self.set_mvfp_bit(MVFP_FLIP, enable)
    }

    fn ioctl(&mut self, request: Ioctl) -> Result<IoctlReply, SensorError> {
        match request {
            Ioctl::GetRgbStats => self
                .caps
                .rgb_stats
                .map(IoctlReply::RgbStats)
                .ok_or(SensorError::UnsupportedOperation),
            Ioctl::SetTriggeredMode(enable) => {
                self.triggered = enable;
                Ok(IoctlReply::Done)
            }
            Ioctl::GetTriggeredMode => Ok(IoctlReply::Flag(self.triggered)),
            Ioctl::SetReadoutWindow(window) => {
                let max = self.caps.max_resolution;
                if window.validate(max).is_err() {
                    return Err(SensorError::UnsupportedOperation);
                }
                self.readout = Some(window);
                Ok(IoctlReply::Done)
            }
            Ioctl::GetReadoutWindow => Ok(IoctlReply::Window(
                self.readout
                    .unwrap_or_else(|| Window::full(self.caps.max_resolution)),
            )),
        }
    }

    fn set_framerate(&mut self, fps: u32) -> Result<(), SensorError> {
        if fps == 0 || fps > 120 {
            return Err(SensorError::OutOfRange {
                control: "framerate",
                value: fps.try_into().unwrap_or(i32::MAX),
            });
        }
        self.controls.framerate = fps;
        Ok(())
    }

    fn set_contrast(&mut self, value: i32) -> Result<(), SensorError> {
        self.controls.contrast = level("contrast", value)?;
        Ok(())
    }

    fn set_brightness(&mut self, value: i32) -> Result<(), SensorError> {
        self.controls.brightness = level("brightness", value)?;
        Ok(())
    }

    fn set_saturation(&mut self, value: i32) -> Result<(), SensorError> {
        self.controls.saturation = level("saturation", value)?;
        Ok(())
    }

    fn set_gainceiling(&mut self, ceiling: GainCeiling) -> Result<(), SensorError> {
        self.controls.gainceiling = ceiling;
        Ok(())
    }

    fn set_quality(&mut self, qs: u8) -> Result<(), SensorError> {
        if !self.caps.formats.contains(&PixelFormat::Jpeg) {
            return Err(SensorError::UnsupportedOperation);
        }
        self.controls.quality = qs;
        Ok(())
    }

    fn set_colorbar(&mut self, enable: bool) -> Result<(), SensorError> {
        self.controls.colorbar = enable;
        Ok(())
    }

    fn set_auto_gain(
        &mut self,
        enable: bool,
        gain_db: Option<f32>,
        ceiling_db: Option<f32>,
    ) -> Result<(), SensorError> {
        let c = &mut self.controls;
        c.auto_gain = enable;
        match (enable, gain_db, ceiling_db) {
            (false, Some(gain), _) => c.gain_db = gain.max(0.0),
            (true, _, Some(ceiling)) => {
                c.gain_ceiling_db = ceiling.max(0.0);
                c.gain_db = c.gain_db.min(c.gain_ceiling_db);
            }
            _ => {}
        }
        Ok(())
    }

    fn gain_db(&mut self) -> Result<f32, SensorError> {
        Ok(self.controls.gain_db)
    }

    fn set_auto_exposure(&mut self, enable: bool, exposure_us: Option<u32>) -> Result<(), SensorError> {
        self.controls.auto_exposure = enable;
        if let (false, Some(us)) = (enable, exposure_us) {
            self.controls.exposure_us = us;
        }
        Ok(())
    }

    fn exposure_us(&mut self) -> Result<u32, SensorError> {
        Ok(self.controls.exposure_us)
    }

    fn set_auto_whitebal(
        &mut self,
        enable: bool,
        rgb_gain_db: Option<[f32; 3]>,
    ) -> Result<(), SensorError> {
        self.controls.auto_whitebal = enable;
        if let (false, Some(gains)) = (enable, rgb_gain_db) {
            self.controls.rgb_gain_db = gains;
        }
        Ok(())
    }

    fn rgb_gain_db(&mut self) -> Result<[f32; 3], SensorError> {
        Ok(self.controls.rgb_gain_db)
    }

    fn set_special_effect(&mut self, effect: SpecialEffect) -> Result<(), SensorError> {
        self.controls.effect = effect;
        Ok(())
    }

    fn set_lens_correction(&mut self, enable: bool, radius: u32, coef: u32) -> Result<(), SensorError> {
        self.controls.lens_correction = enable.then_some((radius, coef));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_bytes_per_pixel() {
        let mut plain = SimSensor::default();
        assert_eq!(plain.set_pixformat(PixelFormat::Rgb565), Ok(2));
        assert_eq!(plain.set_pixformat(PixelFormat::Grayscale), Ok(1));
        assert_eq!(
            plain.set_pixformat(PixelFormat::Binary),
            Err(SensorError::UnsupportedFormat(PixelFormat::Binary))
        );

        let mut raw = SimSensor::new(SimCapabilities::raw_bayer());
        assert_eq!(raw.set_pixformat(PixelFormat::Rgb565), Ok(1));
        assert_eq!(
            raw.set_pixformat(PixelFormat::Jpeg),
            Err(SensorError::UnsupportedFormat(PixelFormat::Jpeg))
        );

        let mut yuv = SimSensor::new(SimCapabilities::yuv_luma());
        assert_eq!(yuv.set_pixformat(PixelFormat::Grayscale), Ok(2));
    }

    #[test]
    fn mirror_and_flip_land_in_register() {
        let mut sensor = SimSensor::default();
        sensor.set_hmirror(true).unwrap();
        sensor.set_vflip(true).unwrap();
        sensor.set_hmirror(false).unwrap();
        assert_eq!(sensor.read_register(REG_MVFP), Ok(MVFP_FLIP));
    }

    #[test]
    fn missing_capabilities_are_reported() {
        let mut sensor = SimSensor::new(SimCapabilities {
            windowing: false,
            mirror_flip: false,
            max_resolution: Resolution::new(640, 480),
            ..SimCapabilities::default()
        });
        assert_eq!(
            sensor.set_windowing(Window::new(0, 0, 8, 8)),
            Err(SensorError::UnsupportedOperation)
        );
        assert_eq!(sensor.set_hmirror(true), Err(SensorError::UnsupportedOperation));
        assert_eq!(
            sensor.set_framesize(FrameSize::Svga),
            Err(SensorError::UnsupportedFramesize(FrameSize::Svga))
        );
        assert_eq!(
            sensor.ioctl(Ioctl::GetRgbStats),
            Err(SensorError::UnsupportedOperation)
        );
    }

    #[test]
    fn levels_outside_range_are_refused() {
        let mut sensor = SimSensor::default();
        sensor.set_brightness(-3).unwrap();
        sensor.set_contrast(2).unwrap();
        assert_eq!(
            sensor.set_saturation(4),
            Err(SensorError::OutOfRange {
                control: "saturation",
                value: 4
            })
        );
        let controls = sensor.controls();
        assert_eq!((controls.brightness, controls.contrast, controls.saturation), (-3, 2, 0));
    }

    #[test]
    fn manual_gain_and_exposure_stick() {
        let mut sensor = SimSensor::default();
        sensor.set_auto_gain(false, Some(6.0), None).unwrap();
        sensor.set_auto_exposure(false, Some(2500)).unwrap();
        assert_eq!(sensor.gain_db(), Ok(6.0));
        assert_eq!(sensor.exposure_us(), Ok(2500));

        // Re-enabling AGC under a lower ceiling clamps the current gain
        sensor.set_auto_gain(true, None, Some(3.0)).unwrap();
        assert_eq!(sensor.gain_db(), Ok(3.0));

        sensor.set_auto_whitebal(false, Some([1.0, 0.0, 2.5])).unwrap();
        assert_eq!(sensor.rgb_gain_db(), Ok([1.0, 0.0, 2.5]));
        sensor.reset().unwrap();
        assert_eq!(sensor.controls(), &SimControls::default());
    }

    #[test]
    fn triggered_mode_round_trip() {
        let mut sensor = SimSensor::default();
        sensor.ioctl(Ioctl::SetTriggeredMode(true)).unwrap();
        assert_eq!(
            sensor.ioctl(Ioctl::GetTriggeredMode),
            Ok(IoctlReply::Flag(true))
        );
    }
}
