//! Random orthogonal matrices and seed derivation.

use ndarray::{Array2, ArrayView2};
use ndarray_linalg::QR;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::types::SyncError;

/// Draws an `n x n` orthogonal matrix from the Haar measure.
///
/// A standard-normal matrix is QR-factorized and each column of `Q` is
/// multiplied by the sign of the matching diagonal entry of `R`, which makes
/// the factorization unique and the distribution of `Q` uniform.
pub fn haar_orthogonal<R: Rng>(n: usize, rng: &mut R) -> Result<Array2<f64>, SyncError> {
    let gaussian = Array2::from_shape_simple_fn((n, n), || rng.sample::<f64, _>(StandardNormal));
    let (mut q, r) = gaussian.qr()?;
    for (k, mut column) in q.columns_mut().into_iter().enumerate() {
        if r[[k, k]] < 0.0 {
            column.mapv_inplace(|v| -v);
        }
    }
    Ok(q)
}

/// Largest absolute entry of `Mᵀ M − I`.
pub fn max_orthogonality_error(matrix: ArrayView2<f64>) -> f64 {
    let gram = matrix.t().dot(&matrix);
    gram.indexed_iter()
        .map(|((i, j), &v)| {
            let target = if i == j { 1.0 } else { 0.0 };
            (v - target).abs()
        })
        .fold(0.0, f64::max)
}

/// SplitMix64 finalizer over `base + counter`.
///
/// Gives each job of a parallel loop its own well-mixed seed so a job's random
/// stream depends only on its index, never on which thread ran it.
pub fn counter_rng_seed(base: u64, counter: u64) -> u64 {
    let mut z = base.wrapping_add(counter.wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn haar_samples_are_orthogonal() {
        let mut rng = StdRng::seed_from_u64(42);
        for n in [1, 2, 3, 7, 20] {
            let q = haar_orthogonal(n, &mut rng).unwrap();
            assert_eq!(q.dim(), (n, n));
            assert!(max_orthogonality_error(q.view()) < 1e-10);
        }
    }

    #[test]
    fn haar_samples_depend_on_seed_only() {
        let a = haar_orthogonal(4, &mut StdRng::seed_from_u64(1)).unwrap();
        let b = haar_orthogonal(4, &mut StdRng::seed_from_u64(1)).unwrap();
        let c = haar_orthogonal(4, &mut StdRng::seed_from_u64(2)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn both_determinant_signs_occur() {
        // A Haar sample over O(n) is a reflection half of the time.
        let mut rng = StdRng::seed_from_u64(7);
        let mut reflections = 0;
        for _ in 0..200 {
            let q = haar_orthogonal(2, &mut rng).unwrap();
            let det = q[[0, 0]] * q[[1, 1]] - q[[0, 1]] * q[[1, 0]];
            if det < 0.0 {
                reflections += 1;
            }
        }
        assert!((60..=140).contains(&reflections), "{}", reflections);
    }

    #[test]
    fn counter_seeds_are_distinct() {
        let seeds: Vec<u64> = (0..1000).map(|i| counter_rng_seed(99, i)).collect();
        let mut sorted = seeds.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), seeds.len());
        assert_eq!(counter_rng_seed(5, 3), counter_rng_seed(5, 3));
    }
}
