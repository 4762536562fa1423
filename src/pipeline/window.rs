use crate::error::CaptureError;
use crate::geometry::{Resolution, Window};

/// Cuts `window` out of a row-major `raster` image held in `buf`, in place.
///
/// Rows move towards the start of the buffer, so each copy reads from at
/// or after the position it writes. Returns the cropped length.
pub fn crop_in_place(
    buf: &mut [u8],
    raster: Resolution,
    window: Window,
    bpp: usize,
) -> Result<usize, CaptureError> {
    window.validate(raster)?;
    let src_len = raster.pixels() * bpp;
    if buf.len() < src_len {
        return Err(CaptureError::Io {
            stage: "crop",
            reason: format!("buffer holds {} of {} bytes", buf.len(), src_len),
        });
    }

    let row_len = window.w as usize * bpp;
    if window.is_full(raster) {
        return Ok(src_len);
    }

    let stride = raster.width as usize * bpp;
    let x = window.x as usize * bpp;
    for row in 0..window.h as usize {
        let src = (window.y as usize + row) * stride + x;
        buf.copy_within(src..src + row_len, row * row_len);
    }
    Ok(row_len * window.h as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crops_rows_in_place() {
        // 4x3 raster, 2 bytes per pixel, byte = row * 10 + column byte
        let raster = Resolution::new(4, 3);
        let mut buf: Vec<u8> = (0..3u8)
            .flat_map(|r| (0..8u8).map(move |c| r * 10 + c))
            .collect();
        let len = crop_in_place(&mut buf, raster, Window::new(1, 1, 2, 2), 2).unwrap();
        assert_eq!(len, 8);
        assert_eq!(&buf[..8], &[12, 13, 14, 15, 22, 23, 24, 25]);
    }

    #[test]
    fn full_window_is_untouched() {
        let raster = Resolution::new(2, 2);
        let mut buf = vec![1, 2, 3, 4];
        assert_eq!(crop_in_place(&mut buf, raster, Window::full(raster), 1), Ok(4));
        assert_eq!(buf, vec![1, 2, 3, 4]);
    }

    #[test]
    fn short_buffer_is_an_io_error() {
        let raster = Resolution::new(4, 4);
        let mut buf = vec![0; 8];
        let err = crop_in_place(&mut buf, raster, Window::new(0, 0, 2, 2), 1).unwrap_err();
        assert_eq!(err.kind(), "io");
    }
}
