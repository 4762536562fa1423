pub mod capture;
pub mod error;
pub mod framebuffer;
pub mod geometry;
pub mod pipeline;
pub mod sensor;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use config::{Config as Loader, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use capture::frame::PixelFormat;
use capture::strategy::TransferKind;
use geometry::{FrameSize, Resolution, Window};
use pipeline::AwbMode;

pub use capture::{CaptureEngine, CaptureState, Frame, FrameRef, SimBus};
pub use error::{BufferError, CaptureError, SensorError};
pub use sensor::{Sensor, SimSensor};

/// Engine configuration, loaded once at startup
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sensor: SensorConfig,
    pub capture: CaptureConfig,
    pub pool: PoolConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Wait after each reset/power-down edge while probing
    pub settle_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Applied at init when set
    pub pixformat: Option<PixelFormat>,
    pub framesize: Option<FrameSize>,
    pub transfer: TransferKind,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Byte budget shared by all frame slots
    pub capacity_bytes: usize,
    /// Ring depth when two frames fit the budget
    pub buffer_count: usize,
    pub max_buffers: usize,
    pub grayscale_fallback: CropPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub awb: AwbMode,
    /// Frames between white-balance statistics reads
    pub awb_refresh_interval: u64,
}

/// Window used when a grayscale frame does not fit the frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CropPolicy {
    Centered { width: u32, height: u32 },
    Fixed { x: u32, y: u32, w: u32, h: u32 },
    Disabled,
}

impl CropPolicy {
    pub fn window(&self, raster: Resolution) -> Option<Window> {
        match *self {
            CropPolicy::Centered { width, height } => Window::centered(raster, width, height),
            CropPolicy::Fixed { x, y, w, h } => {
                let window = Window::new(x, y, w, h);
                window.validate(raster).ok().map(|_| window)
            }
            CropPolicy::Disabled => None,
        }
    }
}

impl Default for CropPolicy {
    fn default() -> Self {
        CropPolicy::Centered {
            width: 320,
            height: 240,
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self { settle_ms: 10 }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            pixformat: None,
            framesize: None,
            transfer: TransferKind::WholeFrame,
            timeout_ms: 3000,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            // Two VGA RGB565 frames
            capacity_bytes: 2 * 640 * 480 * 2,
            buffer_count: 2,
            max_buffers: 4,
            grayscale_fallback: CropPolicy::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            awb: AwbMode::Auto,
            awb_refresh_interval: 100,
        }
    }
}

impl CaptureConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Defaults, overridden by an optional TOML file, overridden by
    /// `FRAMEGRAB__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Loader::builder().add_source(Loader::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        builder
            .add_source(
                Environment::with_prefix("FRAMEGRAB")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}
