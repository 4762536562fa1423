//! Frame size table and window rectangles

use serde::{Deserialize, Serialize};

use crate::error::CaptureError;

/// Named sensor output sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameSize {
    // C/SIF
    Qqcif,
    Qcif,
    Cif,
    Qqsif,
    Qsif,
    Sif,
    // VGA
    Qqqqvga,
    Qqqvga,
    Qqvga,
    Qvga,
    Vga,
    Hqqqvga,
    Hqqvga,
    Hqvga,
    // FFT
    B64x32,
    B64x64,
    B128x64,
    B128x128,
    // Other
    Lcd,
    Qqvga2,
    Wvga,
    Wvga2,
    Svga,
    Xga,
    Sxga,
    Uxga,
    Hd,
    Fhd,
}

/// Indexed by `FrameSize as usize`.
const RESOLUTION: [(u32, u32); 28] = [
    (88, 72),
    (176, 144),
    (352, 288),
    (88, 60),
    (176, 120),
    (352, 240),
    (40, 30),
    (80, 60),
    (160, 120),
    (320, 240),
    (640, 480),
    (60, 40),
    (120, 80),
    (240, 160),
    (64, 32),
    (64, 64),
    (128, 64),
    (128, 128),
    (128, 160),
    (128, 160),
    (720, 480),
    (752, 480),
    (800, 600),
    (1024, 768),
    (1280, 1024),
    (1600, 1200),
    (1280, 720),
    (1920, 1080),
];

impl FrameSize {
    pub fn resolution(self) -> Resolution {
        let (width, height) = RESOLUTION[self as usize];
        Resolution { width, height }
    }
}

/// Width and height of a raster in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn contains(&self, other: Resolution) -> bool {
        other.width <= self.width && other.height <= self.height
    }
}

/// Region of interest cropped out of the full sensor raster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Window {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    /// The window covering the whole raster.
    pub fn full(res: Resolution) -> Self {
        Self::new(0, 0, res.width, res.height)
    }

    /// A `w`x`h` window centered in `res`, if it fits.
    pub fn centered(res: Resolution, w: u32, h: u32) -> Option<Self> {
        if w > res.width || h > res.height {
            return None;
        }
        Some(Self::new((res.width - w) / 2, (res.height - h) / 2, w, h))
    }

    pub fn is_full(&self, res: Resolution) -> bool {
        *self == Self::full(res)
    }

    pub fn size(&self) -> Resolution {
        Resolution::new(self.w, self.h)
    }

    pub fn pixels(&self) -> usize {
        self.w as usize * self.h as usize
    }

    /// Checks the window lies inside `res` and is not empty.
    pub fn validate(&self, res: Resolution) -> Result<(), CaptureError> {
        let fits_x = self.x.checked_add(self.w).is_some_and(|r| r <= res.width);
        let fits_y = self.y.checked_add(self.h).is_some_and(|b| b <= res.height);
        if self.w == 0 || self.h == 0 || !fits_x || !fits_y {
            return Err(CaptureError::InvalidWindow {
                window: *self,
                raster: res,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_matches_names() {
        assert_eq!(FrameSize::Qvga.resolution(), Resolution::new(320, 240));
        assert_eq!(FrameSize::Vga.resolution(), Resolution::new(640, 480));
        assert_eq!(FrameSize::Qqvga.resolution(), Resolution::new(160, 120));
        assert_eq!(FrameSize::Wvga2.resolution(), Resolution::new(752, 480));
        assert_eq!(FrameSize::Fhd.resolution(), Resolution::new(1920, 1080));
    }

    #[test]
    fn window_bounds() {
        let res = FrameSize::Qvga.resolution();
        assert!(Window::new(0, 0, 320, 240).validate(res).is_ok());
        assert!(Window::new(10, 10, 100, 100).validate(res).is_ok());
        assert!(Window::new(300, 0, 21, 10).validate(res).is_err());
        assert!(Window::new(0, 200, 10, 41).validate(res).is_err());
        assert!(Window::new(0, 0, 0, 10).validate(res).is_err());
        assert!(Window::new(u32::MAX, 0, 2, 2).validate(res).is_err());
    }

    #[test]
    fn centered_window() {
        let vga = FrameSize::Vga.resolution();
        assert_eq!(
            Window::centered(vga, 320, 240),
            Some(Window::new(160, 120, 320, 240))
        );
        assert_eq!(Window::centered(FrameSize::Qqvga.resolution(), 320, 240), None);
    }
}
