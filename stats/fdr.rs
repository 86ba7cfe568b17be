//! Benjamini–Hochberg false discovery rate correction.

use ndarray::{Array1, ArrayView1};
use std::cmp::Ordering;

use super::mask::{LabelMask, NEUTRAL_P};

/// Adjusted p-values in input order.
///
/// NaN inputs sort last and come back as 1.
pub fn benjamini_hochberg(pvalues: &[f64]) -> Vec<f64> {
    let m = pvalues.len();
    if m == 0 {
        return Vec::new();
    }
    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&i, &j| {
        pvalues[i]
            .partial_cmp(&pvalues[j])
            .unwrap_or_else(|| pvalues[i].is_nan().cmp(&pvalues[j].is_nan()))
            .then(i.cmp(&j))
    });

    let mut adjusted = vec![1.0; m];
    let mut running = 1.0_f64;
    for (rank0, &idx) in order.iter().enumerate().rev() {
        let p = pvalues[idx];
        if p.is_nan() {
            continue;
        }
        let scaled = (p * m as f64 / (rank0 + 1) as f64).min(1.0);
        running = running.min(scaled);
        adjusted[idx] = running;
    }
    adjusted
}

/// Adjusts only in-mask vertices; the rest are set to [`NEUTRAL_P`].
pub fn benjamini_hochberg_masked(pvalues: ArrayView1<f64>, mask: &LabelMask) -> Array1<f64> {
    let inside: Vec<usize> = (0..pvalues.len()).filter(|&v| mask.contains(v)).collect();
    let selected: Vec<f64> = inside.iter().map(|&v| pvalues[v]).collect();
    let adjusted = benjamini_hochberg(&selected);

    let mut out = Array1::from_elem(pvalues.len(), NEUTRAL_P);
    for (&v, q) in inside.iter().zip(adjusted) {
        out[v] = q;
    }
    out
}

/// Vertices whose adjusted p-value is below `level`.
pub fn rejections(adjusted: ArrayView1<f64>, level: f64) -> Vec<usize> {
    adjusted
        .iter()
        .enumerate()
        .filter(|&(_, &q)| q.partial_cmp(&level) == Some(Ordering::Less))
        .map(|(v, _)| v)
        .collect()
}
