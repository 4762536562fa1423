//! Per-pixel format helpers

use crate::error::CaptureError;

/// Appends the luma bytes of pixels `x..x + w` of one YUV422 line to `out`.
/// `offset` is 0 for YUYV-style lines and 1 when luma comes second.
pub fn extract_luma_line(
    src: &[u8],
    x: usize,
    w: usize,
    offset: usize,
    out: &mut Vec<u8>,
) -> Option<()> {
    if src.len() < (x + w) * 2 {
        return None;
    }
    out.extend((x..x + w).map(|i| src[i * 2 + offset]));
    Some(())
}

/// Packs the luma of `pixels` YUV422 pixels into the front of `buf`.
pub fn luma_in_place(buf: &mut [u8], pixels: usize, offset: usize) -> Result<usize, CaptureError> {
    if buf.len() < pixels * 2 {
        return Err(CaptureError::Io {
            stage: "luma",
            reason: format!("{} bytes cannot hold {} YUV pixels", buf.len(), pixels),
        });
    }
    for i in 0..pixels {
        buf[i] = buf[i * 2 + offset];
    }
    Ok(pixels)
}

#[inline]
pub fn pack_rgb565(r: u8, g: u8, b: u8) -> u16 {
    (u16::from(r) >> 3) << 11 | (u16::from(g) >> 2) << 5 | u16::from(b) >> 3
}

#[inline]
pub fn rgb_to_gray(r: u8, g: u8, b: u8) -> u8 {
    ((u32::from(r) * 38 + u32::from(g) * 75 + u32::from(b) * 15) >> 7) as u8
}

/// BT.601 studio-swing conversion.
#[inline]
pub fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (i32::from(r), i32::from(g), i32::from(b));
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (clamp_u8(y), clamp_u8(u), clamp_u8(v))
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}
