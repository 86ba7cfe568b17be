//! Closed-form orthogonal alignment of one subject onto a reference.
//!
//! For a reference `X` and a subject `Y` (both `Time x Vertices`) the rotation
//! `R = U Vᵀ`, with `U S Vᵀ = X Yᵀ`, minimizes `‖R Y − X‖²_F` over all
//! orthogonal `Time x Time` matrices.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_linalg::SVD;

use crate::types::{SyncError, ensure_shape, ensure_time_by_vertices};

/// A subject aligned onto a reference.
#[derive(Clone, Debug)]
pub struct Synchronized {
    /// The subject after rotation, `R · Y`.
    pub aligned: Array2<f64>,
    /// Orthogonal `Time x Time` rotation.
    pub rotation: Array2<f64>,
}

/// Orthogonal factor `U Vᵀ` of the polar decomposition of `cross`.
pub fn procrustes_rotation(cross: ArrayView2<f64>) -> Result<Array2<f64>, SyncError> {
    let (u, _, vt) = cross.svd(true, true)?;
    let u = u.ok_or(SyncError::MissingSingularVectors)?;
    let vt = vt.ok_or(SyncError::MissingSingularVectors)?;
    Ok(u.dot(&vt))
}

/// Aligns `subject` onto `reference`.
///
/// Both matrices must share their shape, and must not have more time points
/// than vertices; the latter almost always means the caller passed a
/// `Vertices x Time` matrix.
pub fn brain_sync(
    reference: ArrayView2<f64>,
    subject: ArrayView2<f64>,
) -> Result<Synchronized, SyncError> {
    ensure_shape("pairwise synchronization", reference.dim(), subject.dim())?;
    ensure_time_by_vertices(reference)?;

    let cross = reference.dot(&subject.t());
    let rotation = procrustes_rotation(cross.view())?;
    let aligned = rotation.dot(&subject);
    Ok(Synchronized { aligned, rotation })
}

/// Per-vertex sum over time of `(aligned − reference)²`.
pub fn squared_residual(aligned: ArrayView2<f64>, reference: ArrayView2<f64>) -> Array1<f64> {
    let diff = &aligned - &reference;
    diff.mapv(|v| v * v).sum_axis(Axis(0))
}

pub fn frobenius_distance(a: ArrayView2<f64>, b: ArrayView2<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}
