//! Per-vertex label mask.
//!
//! Vertices outside the mask still appear in every output field, with p-values
//! pinned to [`NEUTRAL_P`]. That value is a placeholder that keeps array shapes
//! fixed, not a statistical result.

use ndarray::Array1;

use super::{StatsError, ensure_len};

/// Fill value for p-values that carry no information.
pub const NEUTRAL_P: f64 = 0.5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelMask {
    inside: Vec<bool>,
}

impl LabelMask {
    /// Every vertex inside.
    pub fn all(vertices: usize) -> Self {
        Self {
            inside: vec![true; vertices],
        }
    }

    /// A vertex is inside when its label is finite and positive.
    pub fn from_labels(labels: &[f64]) -> Self {
        Self {
            inside: labels.iter().map(|&l| l.is_finite() && l > 0.0).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.inside.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inside.is_empty()
    }

    pub fn contains(&self, vertex: usize) -> bool {
        self.inside[vertex]
    }

    pub fn count_inside(&self) -> usize {
        self.inside.iter().filter(|&&v| v).count()
    }

    pub fn ensure_vertices(&self, vertices: usize) -> Result<(), StatsError> {
        ensure_len("label mask", vertices, self.len())
    }

    /// Sets out-of-mask entries to [`NEUTRAL_P`] and NaN entries everywhere
    /// to [`NEUTRAL_P`].
    pub fn neutralize(&self, mut values: Array1<f64>) -> Array1<f64> {
        for (value, &inside) in values.iter_mut().zip(&self.inside) {
            if !inside || value.is_nan() {
                *value = NEUTRAL_P;
            }
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn nan_and_non_positive_labels_are_outside() {
        let mask = LabelMask::from_labels(&[1.0, 0.0, f64::NAN, -2.0, 7.0]);
        assert_eq!(mask.count_inside(), 2);
        assert!(mask.contains(0));
        assert!(!mask.contains(2));
        assert!(mask.contains(4));
    }

    #[test]
    fn neutralize_pins_outside_and_nan() {
        let mask = LabelMask::from_labels(&[1.0, 0.0, 1.0]);
        let out = mask.neutralize(array![0.01, 0.02, f64::NAN]);
        assert_eq!(out, array![0.01, NEUTRAL_P, NEUTRAL_P]);
    }

    #[test]
    fn length_is_checked() {
        assert!(LabelMask::all(3).ensure_vertices(3).is_ok());
        assert!(matches!(
            LabelMask::all(3).ensure_vertices(4),
            Err(StatsError::LengthMismatch {
                expected: 4,
                found: 3,
                ..
            })
        ));
    }
}
