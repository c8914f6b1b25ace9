//! Quality-band statistics and classification.

use ndarray::{Array2, ArrayView2};

use crate::models::MaskDescriptor;

/// Efficacy and cloud ratio of a quality raster, in percent.
///
/// Valid pixels are those not equal to the mask nodata; efficacy is the clear
/// share of valid pixels, cloud ratio the not-clear share. An all-nodata
/// raster scores zero efficacy and full cloud ratio.
pub fn qa_statistics(values: ArrayView2<'_, u16>, mask: &MaskDescriptor) -> (f64, f64) {
    let mut valid = 0u64;
    let mut clear = 0u64;
    let mut not_clear = 0u64;

    for &v in values.iter() {
        if v == mask.nodata {
            continue;
        }
        valid += 1;
        if mask.is_clear(v) {
            clear += 1;
        } else if mask.is_not_clear(v) || mask.is_saturated(v) {
            not_clear += 1;
        }
    }

    if valid == 0 {
        return (0.0, 100.0);
    }

    let efficacy = 100.0 * clear as f64 / valid as f64;
    let cloudratio = 100.0 * not_clear as f64 / valid as f64;
    (efficacy, cloudratio)
}

/// Normalize a merged quality raster to its stored `u8` form and compute its
/// statistics. Category values are preserved; values beyond the `u8` range
/// collapse to the mask nodata.
pub fn classify(values: &Array2<u16>, mask: &MaskDescriptor) -> (Array2<u8>, f64, f64) {
    let (efficacy, cloudratio) = qa_statistics(values.view(), mask);
    let nodata = mask.nodata.min(u16::from(u8::MAX)) as u8;
    let classified = values.mapv(|v| if v > u16::from(u8::MAX) { nodata } else { v as u8 });
    (classified, efficacy, cloudratio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn fmask() -> MaskDescriptor {
        MaskDescriptor {
            nodata: 255,
            clear_data: vec![0, 1],
            not_clear_data: vec![2, 3, 4],
            saturated_data: vec![],
        }
    }

    #[test]
    fn statistics_over_valid_pixels_only() {
        // 4 valid pixels: 2 clear, 1 cloud, 1 shadow; 2 nodata.
        let values = array![[0u16, 1, 255], [2, 4, 255]];
        let (efficacy, cloudratio) = qa_statistics(values.view(), &fmask());
        assert_eq!(efficacy, 50.0);
        assert_eq!(cloudratio, 50.0);
    }

    #[test]
    fn all_nodata_scores_zero() {
        let values = Array2::from_elem((3, 3), 255u16);
        let (efficacy, cloudratio) = qa_statistics(values.view(), &fmask());
        assert_eq!(efficacy, 0.0);
        assert_eq!(cloudratio, 100.0);
    }

    #[test]
    fn saturated_counts_as_not_clear() {
        let mask = MaskDescriptor {
            nodata: 0,
            clear_data: vec![127],
            not_clear_data: vec![200],
            saturated_data: vec![255],
        };
        let values = array![[127u16, 255, 200, 0]];
        let (efficacy, cloudratio) = qa_statistics(values.view(), &mask);
        assert!((efficacy - 100.0 / 3.0).abs() < 1e-9);
        assert!((cloudratio - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn classify_keeps_categories_and_stats() {
        let values = array![[0u16, 4], [255, 1]];
        let (classified, efficacy, cloudratio) = classify(&values, &fmask());
        assert_eq!(classified, array![[0u8, 4], [255, 1]]);
        assert!((efficacy - 200.0 / 3.0).abs() < 1e-9);
        assert!((cloudratio - 100.0 / 3.0).abs() < 1e-9);
    }
}
