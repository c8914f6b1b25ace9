//! RGB quicklook rendering.

use std::io::Cursor;

use image::{ImageFormat, Rgb, RgbImage};
use ndarray::Array2;

/// Percentile bounds used to stretch each band to the display range.
const STRETCH_LOW: f64 = 0.02;
const STRETCH_HIGH: f64 = 0.98;

fn percentile(sorted: &[i16], fraction: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * fraction).round() as usize;
    f64::from(sorted[idx])
}

/// Scale one band to `0..=255` using a 2–98 percentile stretch over its valid
/// pixels. Nodata pixels render black.
fn stretch_band(band: &Array2<i16>, nodata: i16) -> Array2<u8> {
    let mut valid: Vec<i16> = band.iter().copied().filter(|&v| v != nodata).collect();
    valid.sort_unstable();

    let low = percentile(&valid, STRETCH_LOW);
    let high = percentile(&valid, STRETCH_HIGH);
    let span = if high > low { high - low } else { 1.0 };

    band.mapv(|v| {
        if v == nodata {
            0
        } else {
            (((f64::from(v) - low) / span) * 255.0).clamp(0.0, 255.0) as u8
        }
    })
}

/// Compose three co-registered bands into an RGB quicklook.
pub fn render(
    red: &Array2<i16>,
    green: &Array2<i16>,
    blue: &Array2<i16>,
    nodata: i16,
) -> anyhow::Result<RgbImage> {
    let dim = red.dim();
    anyhow::ensure!(
        green.dim() == dim && blue.dim() == dim,
        "quicklook bands must share one grid"
    );

    let r = stretch_band(red, nodata);
    let g = stretch_band(green, nodata);
    let b = stretch_band(blue, nodata);

    let (height, width) = dim;
    let mut image = RgbImage::new(width as u32, height as u32);
    for ((row, col), &rv) in r.indexed_iter() {
        image.put_pixel(col as u32, row as u32, Rgb([rv, g[[row, col]], b[[row, col]]]));
    }
    Ok(image)
}

pub fn encode_png(image: &RgbImage) -> anyhow::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn stretch_maps_extremes_to_display_range() {
        let band = Array2::from_shape_fn((10, 10), |(r, c)| (r * 10 + c) as i16 * 100);
        let out = stretch_band(&band, -9999);
        // The lowest percentile clamps to 0, the highest to 255.
        assert_eq!(out[[0, 0]], 0);
        assert_eq!(out[[9, 9]], 255);
        // Monotonic in between.
        assert!(out[[5, 0]] < out[[9, 0]]);
    }

    #[test]
    fn nodata_renders_black() {
        let band = array![[-9999i16, 500], [1000, 2000]];
        let out = stretch_band(&band, -9999);
        assert_eq!(out[[0, 0]], 0);
        assert!(out[[1, 1]] > out[[1, 0]]);
    }

    #[test]
    fn constant_band_does_not_divide_by_zero() {
        let band = Array2::from_elem((4, 4), 1200i16);
        let out = stretch_band(&band, -9999);
        assert!(out.iter().all(|&v| v == 0));
    }

    #[test]
    fn renders_png_bytes() {
        let band = Array2::from_shape_fn((8, 8), |(r, _)| r as i16 * 100);
        let image = render(&band, &band, &band, -9999).unwrap();
        let png = encode_png(&image).unwrap();
        assert_eq!(&png[1..4], b"PNG");
    }

    #[test]
    fn mismatched_grids_error() {
        let a = Array2::from_elem((4, 4), 0i16);
        let b = Array2::from_elem((4, 5), 0i16);
        assert!(render(&a, &a, &b, -9999).is_err());
    }
}
