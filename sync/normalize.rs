//! Per-vertex standardization of a `Time x Vertices` signal.
//!
//! Missing samples are a numerical convention here, not a statistical claim:
//! non-finite entries become zero before centering, and a column whose norm is
//! exactly zero is divided by [`NORM_FLOOR`] instead, which leaves it at zero.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// Norm substituted for constant or all-missing columns.
pub const NORM_FLOOR: f64 = 1e-116;

/// Output of [`normalize_data`].
#[derive(Clone, Debug)]
pub struct NormalizedSignal {
    /// Zero-mean, unit-norm columns.
    pub data: Array2<f64>,
    /// Per-vertex mean removed from the signal.
    pub mean: Array1<f64>,
    /// Per-vertex norm after centering (floored at [`NORM_FLOOR`]).
    pub norm: Array1<f64>,
}

pub fn normalize_data(raw: ArrayView2<f64>) -> NormalizedSignal {
    let mut data = raw.to_owned();
    let mut replaced = 0usize;
    data.mapv_inplace(|value| {
        if value.is_finite() {
            value
        } else {
            replaced += 1;
            0.0
        }
    });
    if replaced > 0 {
        log::debug!("Replaced {} non-finite samples with zero", replaced);
    }

    let time_points = data.nrows();
    let mut mean = Array1::zeros(data.ncols());
    let mut norm = Array1::zeros(data.ncols());

    for ((mut column, mean_slot), norm_slot) in data
        .axis_iter_mut(Axis(1))
        .zip(mean.iter_mut())
        .zip(norm.iter_mut())
    {
        let column_mean = if time_points > 0 {
            column.sum() / time_points as f64
        } else {
            0.0
        };
        column.mapv_inplace(|value| value - column_mean);
        let mut column_norm = column.dot(&column).sqrt();
        if column_norm == 0.0 {
            column_norm = NORM_FLOOR;
        }
        column.mapv_inplace(|value| value / column_norm);
        *mean_slot = column_mean;
        *norm_slot = column_norm;
    }

    NormalizedSignal { data, mean, norm }
}

/// Centers a vector and scales it to unit norm, with the same floor as
/// [`normalize_data`].
pub fn normalize_vector(values: ArrayView1<f64>) -> Array1<f64> {
    let column = values.insert_axis(Axis(1));
    normalize_data(column).data.remove_axis(Axis(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn columns_have_zero_mean_and_unit_norm() {
        let raw = array![[1.0, 10.0, -3.0], [2.0, 20.0, 4.0], [6.0, 5.0, 0.5], [3.0, 1.0, 2.0]];
        let out = normalize_data(raw.view());
        for column in out.data.columns() {
            assert_abs_diff_eq!(column.sum(), 0.0, epsilon = 1e-12);
            assert_abs_diff_eq!(column.dot(&column), 1.0, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(out.mean[0], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out.mean[1], 9.0, epsilon = 1e-12);
    }

    #[test]
    fn reconstructs_the_input() {
        let raw = array![[1.0, -2.0], [0.5, 4.0], [3.0, 1.0]];
        let out = normalize_data(raw.view());
        let rebuilt = &out.data * &out.norm + &out.mean;
        assert!(rebuilt.abs_diff_eq(&raw, 1e-12));
    }

    #[test]
    fn constant_column_takes_the_norm_floor() {
        let raw = array![[2.0, 1.0], [2.0, 2.0], [2.0, 4.0]];
        let out = normalize_data(raw.view());
        assert_eq!(out.norm[0], NORM_FLOOR);
        assert!(out.data.column(0).iter().all(|&v| v == 0.0));
        assert_abs_diff_eq!(out.data.column(1).dot(&out.data.column(1)), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn missing_values_become_zero() {
        let raw = array![[f64::NAN, 1.0], [0.0, f64::NAN], [0.0, 3.0]];
        let out = normalize_data(raw.view());
        assert!(out.data.iter().all(|v| v.is_finite()));
        assert_eq!(out.norm[0], NORM_FLOOR);
        assert_abs_diff_eq!(out.mean[1], 4.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn vector_normalization_matches_matrix_path() {
        let v = array![1.0, 4.0, 9.0, 16.0];
        let n = normalize_vector(v.view());
        assert_abs_diff_eq!(n.sum(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(n.dot(&n), 1.0, epsilon = 1e-12);
    }
}
