//! Bilinear debayering with white-balance gains
//!
//! Missing channels are averaged from the nearest sites of that color: the
//! four edge neighbours when any match, otherwise the four diagonals. Edges
//! mirror without repeating the border pixel, which keeps the CFA phase.

use serde::{Deserialize, Serialize};

use super::convert::{pack_rgb565, rgb_to_gray, rgb_to_yuv};
use crate::capture::frame::{CfaPattern, Channel, PixelFormat};
use crate::error::CaptureError;
use crate::sensor::RgbStats;

/// Q8 fixed point, 256 = 1.0
pub const GAIN_ONE: u16 = 256;
const GAIN_MAX: u32 = 4 * GAIN_ONE as u32;

/// Per-channel multipliers applied to raw samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwbGains {
    pub r: u16,
    pub g: u16,
    pub b: u16,
}

impl AwbGains {
    pub const UNITY: Self = Self {
        r: GAIN_ONE,
        g: GAIN_ONE,
        b: GAIN_ONE,
    };

    /// Gray-world gains that pull red and blue to the green average.
    pub fn from_stats(stats: &RgbStats) -> Self {
        let g = (u64::from(stats.gb) + u64::from(stats.gr)) / 2;
        let gain = |c: u32| -> u16 {
            if c == 0 || g == 0 {
                return GAIN_ONE;
            }
            (g * u64::from(GAIN_ONE) / u64::from(c)).min(u64::from(GAIN_MAX)) as u16
        };
        Self {
            r: gain(stats.r),
            g: GAIN_ONE,
            b: gain(stats.b),
        }
    }

    fn for_channel(&self, channel: Channel) -> u32 {
        u32::from(match channel {
            Channel::Red => self.r,
            Channel::Green => self.g,
            Channel::Blue => self.b,
        })
    }
}

impl Default for AwbGains {
    fn default() -> Self {
        Self::UNITY
    }
}

struct Raw<'a> {
    data: &'a [u8],
    width: usize,
    height: usize,
    cfa: CfaPattern,
    gains: AwbGains,
}

impl Raw<'_> {
    fn reflect(i: isize, n: usize) -> usize {
        let n = n as isize;
        let i = if i < 0 { -i } else if i >= n { 2 * (n - 1) - i } else { i };
        i.clamp(0, n - 1) as usize
    }

    /// Channel at a virtual coordinate, which may lie outside the raster.
    fn channel(&self, x: isize, y: isize) -> Channel {
        self.cfa
            .channel_at(x.rem_euclid(2) as usize, y.rem_euclid(2) as usize)
    }

    /// Gain-corrected sample, saturating at 255.
    fn sample(&self, x: isize, y: isize) -> u32 {
        let (sx, sy) = (
            Self::reflect(x, self.width),
            Self::reflect(y, self.height),
        );
        let raw = u32::from(self.data[sy * self.width + sx]);
        let gain = self.gains.for_channel(self.channel(x, y));
        ((raw * gain) >> 8).min(255)
    }

    fn interpolate(&self, x: isize, y: isize, want: Channel) -> u8 {
        if self.channel(x, y) == want {
            return self.sample(x, y) as u8;
        }
        const EDGES: [(isize, isize); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];
        const CORNERS: [(isize, isize); 4] = [(-1, -1), (1, -1), (-1, 1), (1, 1)];
        for ring in [EDGES, CORNERS] {
            let (sum, n) = ring
                .iter()
                .filter(|(dx, dy)| self.channel(x + dx, y + dy) == want)
                .fold((0, 0), |(sum, n), (dx, dy)| {
                    (sum + self.sample(x + dx, y + dy), n + 1)
                });
            if n > 0 {
                return (sum / n) as u8;
            }
        }
        0
    }

    fn rgb(&self, x: usize, y: usize) -> (u8, u8, u8) {
        let (x, y) = (x as isize, y as isize);
        (
            self.interpolate(x, y, Channel::Red),
            self.interpolate(x, y, Channel::Green),
            self.interpolate(x, y, Channel::Blue),
        )
    }
}

/// Converts a `width` x `height` Bayer image into `format`, writing `dst`.
/// Returns the output length.
pub fn debayer(
    src: &[u8],
    width: usize,
    height: usize,
    cfa: CfaPattern,
    gains: AwbGains,
    format: PixelFormat,
    dst: &mut [u8],
) -> Result<usize, CaptureError> {
    let io = |reason: String| CaptureError::Io {
        stage: "debayer",
        reason,
    };
    if width == 0 || height == 0 || src.len() < width * height {
        return Err(io(format!(
            "{} bytes is not a {}x{} Bayer image",
            src.len(),
            width,
            height
        )));
    }
    let out_len = format.frame_len(width as u32, height as u32);
    if dst.len() < out_len {
        return Err(io(format!("output needs {} bytes, got {}", out_len, dst.len())));
    }

    let raw = Raw {
        data: src,
        width,
        height,
        cfa,
        gains,
    };
    match format {
        PixelFormat::Rgb565 => {
            for (i, px) in dst[..out_len].chunks_exact_mut(2).enumerate() {
                let (r, g, b) = raw.rgb(i % width, i / width);
                px.copy_from_slice(&pack_rgb565(r, g, b).to_le_bytes());
            }
        }
        PixelFormat::Grayscale => {
            for (i, px) in dst[..out_len].iter_mut().enumerate() {
                let (r, g, b) = raw.rgb(i % width, i / width);
                *px = rgb_to_gray(r, g, b);
            }
        }
        PixelFormat::Yuv422 => {
            // YUYV: U sampled on even columns, V on odd ones
            for (i, px) in dst[..out_len].chunks_exact_mut(2).enumerate() {
                let x = i % width;
                let (r, g, b) = raw.rgb(x, i / width);
                let (luma, u, v) = rgb_to_yuv(r, g, b);
                px.copy_from_slice(&[luma, if x % 2 == 0 { u } else { v }]);
            }
        }
        other => return Err(io(format!("cannot debayer into {:?}", other))),
    }
    Ok(out_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rggb_4x4(r: u8, g: u8, b: u8) -> Vec<u8> {
        let cfa = CfaPattern::Rggb;
        (0..16)
            .map(|i| match cfa.channel_at(i % 4, i / 4) {
                Channel::Red => r,
                Channel::Green => g,
                Channel::Blue => b,
            })
            .collect()
    }

    #[test]
    fn unity_gains_reproduce_flat_field() {
        let src = rggb_4x4(200, 100, 50);
        let mut dst = vec![0; 32];
        let len = debayer(
            &src,
            4,
            4,
            CfaPattern::Rggb,
            AwbGains::UNITY,
            PixelFormat::Rgb565,
            &mut dst,
        )
        .unwrap();
        assert_eq!(len, 32);
        for px in dst.chunks_exact(2) {
            assert_eq!(u16::from_le_bytes([px[0], px[1]]), 52006);
        }
    }

    #[test]
    fn gains_saturate() {
        let src = rggb_4x4(200, 100, 50);
        let gains = AwbGains {
            r: 2 * GAIN_ONE,
            g: GAIN_ONE,
            b: GAIN_ONE,
        };
        let mut dst = vec![0; 32];
        debayer(&src, 4, 4, CfaPattern::Rggb, gains, PixelFormat::Rgb565, &mut dst).unwrap();
        let expected = pack_rgb565(255, 100, 50);
        assert!(dst
            .chunks_exact(2)
            .all(|px| u16::from_le_bytes([px[0], px[1]]) == expected));
    }

    #[test]
    fn gray_and_yuv_outputs() {
        let src = rggb_4x4(90, 90, 90);
        let mut gray = vec![0; 16];
        debayer(&src, 4, 4, CfaPattern::Rggb, AwbGains::UNITY, PixelFormat::Grayscale, &mut gray)
            .unwrap();
        assert!(gray.iter().all(|&v| v == rgb_to_gray(90, 90, 90)));

        let mut yuv = vec![0; 32];
        debayer(&src, 4, 4, CfaPattern::Rggb, AwbGains::UNITY, PixelFormat::Yuv422, &mut yuv)
            .unwrap();
        let (y, u, v) = rgb_to_yuv(90, 90, 90);
        assert_eq!(&yuv[..4], &[y, u, y, v]);
    }

    #[test]
    fn rejects_bad_input() {
        let mut dst = vec![0; 32];
        let err = debayer(&[0; 8], 4, 4, CfaPattern::Rggb, AwbGains::UNITY, PixelFormat::Rgb565, &mut dst)
            .unwrap_err();
        assert_eq!(err.kind(), "io");
        let err = debayer(&[0; 16], 4, 4, CfaPattern::Rggb, AwbGains::UNITY, PixelFormat::Jpeg, &mut dst)
            .unwrap_err();
        assert_eq!(err.kind(), "io");
    }

    #[test]
    fn gray_world_gains() {
        let gains = AwbGains::from_stats(&RgbStats {
            r: 50,
            gb: 100,
            gr: 100,
            b: 200,
        });
        assert_eq!(gains, AwbGains { r: 512, g: 256, b: 128 });
        assert_eq!(AwbGains::from_stats(&RgbStats::default()), AwbGains::UNITY);
    }
}
