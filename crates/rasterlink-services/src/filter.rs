//! Post-transfer smoothing.

use crate::raster::Raster;

/// 3×3 median filter. Neighbours outside the image are clamped to the
/// nearest edge pixel, so output dimensions equal input dimensions.
pub fn median_filter(input: &Raster) -> Raster {
    let (width, height) = (input.width(), input.height());
    let mut out = Vec::with_capacity(input.pixels().len());
    let mut window = [0u8; 9];

    for y in 0..height {
        for x in 0..width {
            let mut n = 0;
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let sx = (i64::from(x) + dx).clamp(0, i64::from(width) - 1) as u32;
                    let sy = (i64::from(y) + dy).clamp(0, i64::from(height) - 1) as u32;
                    window[n] = input.get(sx, sy);
                    n += 1;
                }
            }
            window.sort_unstable();
            out.push(window[4]);
        }
    }

    input.with_pixels(out)
}
