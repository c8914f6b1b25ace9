//! Grid-to-grid resampling.
//!
//! Source scenes are mapped onto the tile grid through their affine
//! transforms; both grids are expected to live in the cube's projected CRS
//! (datum-level reprojection happens upstream of the builder).

use ndarray::{Array2, ArrayView2};

use super::{GeoTransform, Sample};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resampling {
    /// Used for the quality band so categories never get interpolated.
    Nearest,
    Bilinear,
}

/// Resample `src` onto a `dst_shape` grid described by `dst_transform`.
///
/// Pixels falling outside the source, or sampling only `src_nodata`, receive
/// `dst_nodata`.
pub fn reproject<T: Sample>(
    src: ArrayView2<'_, T>,
    src_transform: GeoTransform,
    dst_shape: (usize, usize),
    dst_transform: GeoTransform,
    src_nodata: T,
    dst_nodata: T,
    resampling: Resampling,
) -> Array2<T> {
    let (src_h, src_w) = src.dim();
    let mut dst = Array2::from_elem(dst_shape, dst_nodata);

    for row in 0..dst_shape.0 {
        for col in 0..dst_shape.1 {
            let (x, y) = dst_transform.pixel_center(row, col);
            let (src_row, src_col) = src_transform.world_to_pixel(x, y);

            let value = match resampling {
                Resampling::Nearest => {
                    sample_nearest(&src, src_h, src_w, src_row, src_col, src_nodata)
                }
                Resampling::Bilinear => {
                    sample_bilinear(&src, src_h, src_w, src_row, src_col, src_nodata)
                }
            };

            if let Some(v) = value {
                dst[[row, col]] = v;
            }
        }
    }

    dst
}

fn sample_nearest<T: Sample>(
    src: &ArrayView2<'_, T>,
    src_h: usize,
    src_w: usize,
    row: f64,
    col: f64,
    src_nodata: T,
) -> Option<T> {
    let r = row.round();
    let c = col.round();
    if r < 0.0 || c < 0.0 || r >= src_h as f64 || c >= src_w as f64 {
        return None;
    }
    let v = src[[r as usize, c as usize]];
    (v != src_nodata).then_some(v)
}

fn sample_bilinear<T: Sample>(
    src: &ArrayView2<'_, T>,
    src_h: usize,
    src_w: usize,
    row: f64,
    col: f64,
    src_nodata: T,
) -> Option<T> {
    if row < -0.5 || col < -0.5 || row > src_h as f64 - 0.5 || col > src_w as f64 - 0.5 {
        return None;
    }

    let r0 = row.floor().max(0.0) as usize;
    let c0 = col.floor().max(0.0) as usize;
    let r1 = (r0 + 1).min(src_h - 1);
    let c1 = (c0 + 1).min(src_w - 1);
    let fr = (row - r0 as f64).clamp(0.0, 1.0);
    let fc = (col - c0 as f64).clamp(0.0, 1.0);

    let corners = [
        (src[[r0, c0]], (1.0 - fr) * (1.0 - fc)),
        (src[[r0, c1]], (1.0 - fr) * fc),
        (src[[r1, c0]], fr * (1.0 - fc)),
        (src[[r1, c1]], fr * fc),
    ];

    let mut acc = 0.0;
    let mut weight = 0.0;
    for (v, w) in corners {
        if v != src_nodata && w > 0.0 {
            acc += v.to_f64() * w;
            weight += w;
        }
    }

    if weight == 0.0 {
        return None;
    }
    Some(T::from_f64(acc / weight))
}
