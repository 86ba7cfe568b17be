//! Vertex-wise Pearson correlation with two-sided Student-t p-values.

use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use statrs::distribution::{ContinuousCDF, StudentsT};

use super::fdr::benjamini_hochberg_masked;
use super::mask::LabelMask;
use super::{StatsError, ensure_len};

/// Sample correlation of `x` and `y`; NaN when either has zero variance.
pub fn pearson_r(x: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
    let n = x.len() as f64;
    let mean_x = x.sum() / n;
    let mean_y = y.sum() / n;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (&a, &b) in x.iter().zip(y.iter()) {
        let dx = a - mean_x;
        let dy = b - mean_y;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx == 0.0 || syy == 0.0 {
        return f64::NAN;
    }
    (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0)
}

/// Two-sided p-value of a correlation from `n` observations.
pub struct CorrelationTest {
    dist: StudentsT,
    dof: f64,
}

impl CorrelationTest {
    pub fn new(n: usize) -> Result<Self, StatsError> {
        if n < 3 {
            return Err(StatsError::TooFew {
                what: "observations for a correlation test",
                found: n,
                required: 3,
            });
        }
        let dof = (n - 2) as f64;
        let dist =
            StudentsT::new(0.0, 1.0, dof).map_err(|e| StatsError::Distribution(e.to_string()))?;
        Ok(Self { dist, dof })
    }

    pub fn p_value(&self, r: f64) -> f64 {
        if r.is_nan() {
            return f64::NAN;
        }
        let denom = 1.0 - r * r;
        if denom <= 0.0 {
            return 0.0;
        }
        let t = r * (self.dof / denom).sqrt();
        (2.0 * self.dist.sf(t.abs())).min(1.0)
    }
}

#[derive(Clone, Debug)]
pub struct CorrelationField {
    pub r: Array1<f64>,
    /// Raw p-values; NaN correlations and out-of-mask vertices read 0.5.
    pub pval: Array1<f64>,
    pub pval_fdr: Array1<f64>,
}

/// Correlates every row of `rows` (`Vertices x Observations`) with `y`.
pub fn pearson_fdr(
    rows: ArrayView2<f64>,
    y: ArrayView1<f64>,
    mask: &LabelMask,
) -> Result<CorrelationField, StatsError> {
    ensure_len("correlation target", rows.ncols(), y.len())?;
    mask.ensure_vertices(rows.nrows())?;
    let test = CorrelationTest::new(y.len())?;

    let r: Array1<f64> = rows.axis_iter(Axis(0)).map(|row| pearson_r(row, y)).collect();
    let nan_count = r.iter().filter(|v| v.is_nan()).count();
    if nan_count > 0 {
        log::debug!("{} vertices have an undefined correlation", nan_count);
    }
    let pval = mask.neutralize(r.mapv(|value| test.p_value(value)));
    let pval_fdr = benjamini_hochberg_masked(pval.view(), mask);
    Ok(CorrelationField { r, pval, pval_fdr })
}
