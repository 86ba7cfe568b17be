//! Wilcoxon rank-sum test, normal approximation.

use statrs::distribution::{ContinuousCDF, Normal};
use std::cmp::Ordering;

use super::StatsError;

/// Ranks (1-based, ties averaged) of the concatenation `first ++ second`,
/// summed over `first`.
fn rank_sum_of_first(first: &[f64], second: &[f64]) -> f64 {
    let mut pooled: Vec<(f64, bool)> = first
        .iter()
        .map(|&v| (v, true))
        .chain(second.iter().map(|&v| (v, false)))
        .collect();
    pooled.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

    let mut sum = 0.0;
    let mut start = 0;
    while start < pooled.len() {
        let mut end = start + 1;
        while end < pooled.len() && pooled[end].0 == pooled[start].0 {
            end += 1;
        }
        // Positions start..end share the mean of ranks start+1..=end.
        let rank = (start + 1 + end) as f64 / 2.0;
        sum += rank * pooled[start..end].iter().filter(|e| e.1).count() as f64;
        start = end;
    }
    sum
}

/// Two-sample rank-sum test.
pub struct RankSumTest {
    normal: Normal,
}

impl RankSumTest {
    pub fn new() -> Result<Self, StatsError> {
        let normal = Normal::new(0.0, 1.0).map_err(|e| StatsError::Distribution(e.to_string()))?;
        Ok(Self { normal })
    }

    /// Standardized rank-sum statistic of `first` against `second`.
    ///
    /// Positive when `first` tends to be larger. NaN when either sample is
    /// empty or any value is NaN.
    pub fn z(&self, first: &[f64], second: &[f64]) -> f64 {
        if first.is_empty()
            || second.is_empty()
            || first.iter().chain(second).any(|v| v.is_nan())
        {
            return f64::NAN;
        }
        let n1 = first.len() as f64;
        let n2 = second.len() as f64;
        let expected = n1 * (n1 + n2 + 1.0) / 2.0;
        let sd = (n1 * n2 * (n1 + n2 + 1.0) / 12.0).sqrt();
        (rank_sum_of_first(first, second) - expected) / sd
    }

    /// Returns `(z, two-sided p)`.
    pub fn test(&self, first: &[f64], second: &[f64]) -> (f64, f64) {
        let z = self.z(first, second);
        if z.is_nan() {
            return (z, f64::NAN);
        }
        (z, (2.0 * self.normal.sf(z.abs())).min(1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn ties_get_average_ranks() {
        // Pooled [1, 2, 2, 3]: ranks 1, 2.5, 2.5, 4.
        assert_abs_diff_eq!(rank_sum_of_first(&[2.0, 3.0], &[1.0, 2.0]), 6.5);
        assert_abs_diff_eq!(rank_sum_of_first(&[1.0], &[2.0, 2.0, 3.0]), 1.0);
    }

    #[test]
    fn matches_reference_value() {
        // first = [4, 5, 6], second = [1, 2, 3]: W = 15, E = 10.5, sd = 2.2913.
        let test = RankSumTest::new().unwrap();
        let (z, p) = test.test(&[4.0, 5.0, 6.0], &[1.0, 2.0, 3.0]);
        assert_abs_diff_eq!(z, 1.963961, epsilon = 1e-5);
        assert_abs_diff_eq!(p, 0.049535, epsilon = 1e-5);
    }

    #[test]
    fn symmetric_samples_are_not_significant() {
        let test = RankSumTest::new().unwrap();
        let (z, p) = test.test(&[1.0, 3.0, 5.0], &[2.0, 4.0, 6.0, 0.0]);
        assert!(z.abs() < 0.5);
        assert!(p > 0.5);
    }

    #[test]
    fn empty_sample_is_undefined() {
        let test = RankSumTest::new().unwrap();
        let (z, p) = test.test(&[], &[1.0]);
        assert!(z.is_nan() && p.is_nan());
    }
}
