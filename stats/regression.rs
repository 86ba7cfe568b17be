//! Correlation of atlas distances with a main variable after removing nuisance
//! covariates.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, concatenate};
use ndarray_linalg::LeastSquaresSvd;

use super::fdr::rejections;
use super::mask::LabelMask;
use super::pearson::pearson_fdr;
use super::{StatsError, ensure_len};

/// Significance level used for the logged vertex counts.
pub const REPORT_LEVEL: f64 = 0.05;

#[derive(Clone, Debug)]
pub struct NuisanceCorrelation {
    pub r: Array1<f64>,
    pub pval: Array1<f64>,
    pub pval_fdr: Array1<f64>,
    /// In-mask vertices with raw p below [`REPORT_LEVEL`].
    pub significant_raw: usize,
    /// In-mask vertices with FDR-corrected p below [`REPORT_LEVEL`].
    pub significant_fdr: usize,
}

/// Removes an intercept and the `nuisance` columns from every row of
/// `field` (`Vertices x Subjects`) by least squares.
pub fn residualize(
    field: ArrayView2<f64>,
    nuisance: ArrayView2<f64>,
) -> Result<Array2<f64>, StatsError> {
    let n = field.ncols();
    ensure_len("nuisance rows", n, nuisance.nrows())?;
    let intercept = Array2::ones((n, 1));
    let design = concatenate(Axis(1), &[intercept.view(), nuisance.view()])
        .map_err(|e| StatsError::InvalidOption(e.to_string()))?;
    let response = field.t().to_owned();
    let fit = design.least_squares(&response)?;
    let residual = &response - &design.dot(&fit.solution);
    Ok(residual.reversed_axes())
}

pub fn regress_nuisance_correlation(
    field: ArrayView2<f64>,
    main: ArrayView1<f64>,
    nuisance: ArrayView2<f64>,
    mask: &LabelMask,
) -> Result<NuisanceCorrelation, StatsError> {
    let n = field.ncols();
    ensure_len("main variable", n, main.len())?;
    if nuisance.ncols() > 2 {
        return Err(StatsError::InvalidOption(format!(
            "at most two nuisance covariates are supported, got {}",
            nuisance.ncols()
        )));
    }
    let required = nuisance.ncols() + 3;
    if n < required {
        return Err(StatsError::TooFew {
            what: "subjects for nuisance regression",
            found: n,
            required,
        });
    }

    let residual = residualize(field, nuisance)?;
    let correlation = pearson_fdr(residual.view(), main, mask)?;

    // Out-of-mask vertices read 0.5 and never count.
    let significant_raw = rejections(correlation.pval.view(), REPORT_LEVEL).len();
    let significant_fdr = rejections(correlation.pval_fdr.view(), REPORT_LEVEL).len();
    log::info!(
        "{} vertices significant at p < {} before FDR, {} after",
        significant_raw,
        REPORT_LEVEL,
        significant_fdr
    );

    Ok(NuisanceCorrelation {
        r: correlation.r,
        pval: correlation.pval,
        pval_fdr: correlation.pval_fdr,
        significant_raw,
        significant_fdr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn residuals_are_orthogonal_to_the_design() {
        let field = array![[1.0, 3.0, 2.0, 5.0, 4.0], [2.0, 2.5, 0.0, 1.0, 3.0]];
        let nuisance = array![[0.0], [1.0], [0.0], [1.0], [1.0]];
        let residual = residualize(field.view(), nuisance.view()).unwrap();
        assert_eq!(residual.dim(), (2, 5));
        for row in residual.rows() {
            assert_abs_diff_eq!(row.sum(), 0.0, epsilon = 1e-10);
            assert_abs_diff_eq!(row.dot(&nuisance.column(0)), 0.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn nuisance_driven_signal_is_removed() {
        let mut rng = StdRng::seed_from_u64(31);
        let n = 40;
        let main: Array1<f64> = (0..n).map(|_| rng.gen_range(0.0..1.0)).collect();
        let age: Array1<f64> = (0..n).map(|_| rng.gen_range(20.0..60.0)).collect();
        let noise: Vec<f64> = (0..2 * n).map(|_| rng.gen_range(-0.01..0.01)).collect();

        let mut field = Array2::zeros((2, n));
        for s in 0..n {
            // Vertex 0 follows the main variable, vertex 1 only age.
            field[[0, s]] = 3.0 * main[s] + 0.1 * age[s] + noise[s];
            field[[1, s]] = 0.1 * age[s] + noise[n + s];
        }
        let nuisance = age.clone().insert_axis(Axis(1));
        let out =
            regress_nuisance_correlation(field.view(), main.view(), nuisance.view(), &LabelMask::all(2))
                .unwrap();
        assert!(out.r[0] > 0.9);
        assert!(out.pval_fdr[0] < 1e-6);
        assert!(out.r[1].abs() < 0.5);
        assert!(out.significant_fdr >= 1);
    }

    #[test]
    fn too_many_nuisance_columns() {
        let field = Array2::<f64>::zeros((1, 6));
        let nuisance = Array2::<f64>::zeros((6, 3));
        assert!(matches!(
            regress_nuisance_correlation(
                field.view(),
                Array1::zeros(6).view(),
                nuisance.view(),
                &LabelMask::all(1)
            ),
            Err(StatsError::InvalidOption(_))
        ));
    }
}
