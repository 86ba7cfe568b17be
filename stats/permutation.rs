//! Max-statistic permutation test over pair dissimilarities.
//!
//! Imaging dissimilarities (per vertex) and covariate dissimilarities are both
//! standardized across pairs, so their inner product is a correlation. The null
//! distribution comes from permuting covariate labels across subjects while the
//! pair list and the imaging data stay fixed: each permutation draws a random
//! relabelling `π` and recomputes `(c_π(i) − c_π(j))²` for every pair. This
//! tests exchangeability of the covariate with respect to the synchronized
//! distances.
//!
//! Permutation `k` is driven by its own generator seeded from `(seed, k)`, so
//! the null is identical for any number of workers.

use ndarray::{Array1, Array2, ArrayView1};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::fdr::{benjamini_hochberg_masked, rejections};
use super::mask::LabelMask;
use super::pairs::{PairDissimilarities, SubjectPair};
use super::{StatsError, ensure_len};
use crate::normalize::{normalize_data, normalize_vector};
use crate::orthogonal::counter_rng_seed;
use crate::parallel::ExecutionContext;
use crate::progress::SyncProgressStage;

const PERMUTATIONS_PER_JOB: usize = 32;

/// Vertex-wise test used by the pairwise regression engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermutationMethod {
    /// Label permutation with max-statistic family-wise correction.
    #[default]
    MaxStatistic,
    /// Pearson correlation with Benjamini–Hochberg correction.
    PearsonFdr,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermutationOptions {
    /// Number of sampled subject pairs; zero uses every pair.
    pub num_pairs: usize,
    pub permutations: usize,
    pub seed: u64,
    pub method: PermutationMethod,
}

impl Default for PermutationOptions {
    fn default() -> Self {
        Self {
            num_pairs: 2000,
            permutations: 1000,
            seed: 0x5EED,
            method: PermutationMethod::MaxStatistic,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PermutationResult {
    /// Observed correlation per vertex.
    pub rho_obs: Array1<f64>,
    /// Maximum over vertices of each permutation's correlation, in
    /// permutation order.
    pub max_null: Vec<f64>,
    /// Family-wise corrected p-value per vertex.
    pub pval_max: Array1<f64>,
    /// Exceedance count over the number of permutations.
    pub pval_perm: Array1<f64>,
    pub pval_fdr: Array1<f64>,
    pub permutations: usize,
}

/// `(c_i − c_j)²` for every pair under the relabelling `labels`.
fn relabelled_dissimilarity(
    pairs: &[SubjectPair],
    covariate: ArrayView1<f64>,
    labels: &[usize],
) -> Array1<f64> {
    pairs
        .iter()
        .map(|&(i, j)| {
            let d = covariate[labels[i]] - covariate[labels[j]];
            d * d
        })
        .collect()
}

struct NullChunk {
    maxima: Vec<f64>,
    exceedances: Vec<u32>,
}

/// Runs the label-permutation test.
///
/// `covariate` holds one value per subject; `dissimilarities` must have been
/// computed from the same subjects.
pub fn permutation_test(
    dissimilarities: &PairDissimilarities,
    covariate: ArrayView1<f64>,
    mask: &LabelMask,
    permutations: usize,
    seed: u64,
    ctx: ExecutionContext<'_>,
) -> Result<PermutationResult, StatsError> {
    let n_pairs = dissimilarities.n_pairs();
    let vertices = dissimilarities.n_vertices();
    let n_subjects = covariate.len();
    mask.ensure_vertices(vertices)?;
    ensure_len("pair covariate vector", n_pairs, dissimilarities.covariate.len())?;
    if permutations == 0 {
        return Err(StatsError::InvalidOption(
            "the number of permutations must be positive".into(),
        ));
    }
    if n_pairs < 2 {
        return Err(StatsError::TooFew {
            what: "subject pairs",
            found: n_pairs,
            required: 2,
        });
    }
    if let Some(&(i, j)) = dissimilarities
        .pairs
        .iter()
        .find(|&&(i, j)| i >= n_subjects || j >= n_subjects)
    {
        return Err(StatsError::LengthMismatch {
            context: "covariate vector",
            expected: i.max(j) + 1,
            found: n_subjects,
        });
    }

    // Pairs x Vertices, each column standardized across pairs.
    let imaging: Array2<f64> = normalize_data(dissimilarities.imaging.t()).data;
    let observed_covariate = normalize_vector(dissimilarities.covariate.view());
    let rho_obs = imaging.t().dot(&observed_covariate);

    let chunks: Vec<(usize, usize)> = (0..permutations)
        .step_by(PERMUTATIONS_PER_JOB)
        .map(|start| (start, (start + PERMUTATIONS_PER_JOB).min(permutations)))
        .collect();
    log::info!(
        "Running {} label permutations over {} pairs and {} vertices",
        permutations,
        n_pairs,
        vertices
    );

    let null_chunks = ctx.map(&chunks, SyncProgressStage::Permutations, |_, &(start, end)| {
        let mut maxima = Vec::with_capacity(end - start);
        let mut exceedances = vec![0u32; vertices];
        let mut labels: Vec<usize> = (0..n_subjects).collect();
        for k in start..end {
            let mut rng = StdRng::seed_from_u64(counter_rng_seed(seed, k as u64));
            labels.sort_unstable();
            labels.shuffle(&mut rng);
            let permuted = normalize_vector(
                relabelled_dissimilarity(&dissimilarities.pairs, covariate, &labels).view(),
            );
            let rho = imaging.t().dot(&permuted);
            maxima.push(rho.iter().copied().fold(f64::NEG_INFINITY, f64::max));
            for ((count, &r), &obs) in exceedances.iter_mut().zip(rho.iter()).zip(rho_obs.iter()) {
                if r >= obs {
                    *count += 1;
                }
            }
        }
        Ok::<_, StatsError>(NullChunk {
            maxima,
            exceedances,
        })
    })?;

    let mut max_null = Vec::with_capacity(permutations);
    let mut exceedances = vec![0u64; vertices];
    for chunk in null_chunks {
        max_null.extend(chunk.maxima);
        for (total, count) in exceedances.iter_mut().zip(chunk.exceedances) {
            *total += u64::from(count);
        }
    }

    let mut sorted_null = max_null.clone();
    sorted_null.sort_by(f64::total_cmp);
    let total = permutations as f64;
    let pval_max: Array1<f64> = rho_obs
        .iter()
        .map(|&obs| {
            if obs.is_nan() {
                f64::NAN
            } else {
                let below = sorted_null.partition_point(|&m| m < obs);
                (sorted_null.len() - below) as f64 / total
            }
        })
        .collect();
    let pval_perm: Array1<f64> = exceedances.iter().map(|&c| c as f64 / total).collect();

    let pval_max = mask.neutralize(pval_max);
    let pval_perm = mask.neutralize(pval_perm);
    let pval_fdr = benjamini_hochberg_masked(pval_perm.view(), mask);

    log::info!(
        "{} vertices significant by max statistic, {} after FDR at 0.05",
        rejections(pval_max.view(), 0.05).len(),
        rejections(pval_fdr.view(), 0.05).len()
    );

    Ok(PermutationResult {
        rho_obs,
        max_null,
        pval_max,
        pval_perm,
        pval_fdr,
        permutations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::parallel::WorkerPool;
    use crate::progress::NoopProgress;
    use crate::progress::recording::CancelAfter;
    use crate::types::SyncError;
    use crate::stats::mask::NEUTRAL_P;
    use crate::stats::pairs::enumerate_pairs;
    use ndarray::Axis;
    use rand::Rng;

    fn synthetic(seed: u64, n_subjects: usize, vertices: usize) -> (PairDissimilarities, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let covariate: Array1<f64> = (0..n_subjects).map(|_| rng.gen_range(0.0..1.0)).collect();
        let pairs = enumerate_pairs(n_subjects);
        let pair_covariate: Array1<f64> = pairs
            .iter()
            .map(|&(i, j)| (covariate[i] - covariate[j]).powi(2))
            .collect();
        let mut imaging = Array2::from_shape_fn((vertices, pairs.len()), |_| rng.gen_range(0.0..1.0));
        // Vertex 0 tracks the covariate exactly.
        imaging.row_mut(0).assign(&pair_covariate);
        (
            PairDissimilarities {
                pairs,
                imaging,
                covariate: pair_covariate,
            },
            covariate,
        )
    }

    fn run(
        d: &PairDissimilarities,
        c: &Array1<f64>,
        mask: &LabelMask,
        workers: usize,
    ) -> PermutationResult {
        let pool = WorkerPool::new(workers).unwrap();
        let cancel = CancellationToken::new();
        permutation_test(
            d,
            c.view(),
            mask,
            200,
            17,
            ExecutionContext::new(&pool, &cancel, &NoopProgress),
        )
        .unwrap()
    }

    #[test]
    fn planted_vertex_is_detected() {
        let (d, c) = synthetic(1, 12, 30);
        let result = run(&d, &c, &LabelMask::all(30), 2);
        assert!((result.rho_obs[0] - 1.0).abs() < 1e-9);
        assert_eq!(result.pval_perm[0], 0.0);
        assert_eq!(result.pval_max[0], 0.0);
        assert!(result.pval_fdr[0] < 0.05);
        assert_eq!(result.max_null.len(), 200);
    }

    #[test]
    fn p_values_are_ordered_and_bounded() {
        let (d, c) = synthetic(2, 10, 25);
        let result = run(&d, &c, &LabelMask::all(25), 3);
        for v in 0..25 {
            assert!((0.0..=1.0).contains(&result.pval_perm[v]));
            assert!(result.pval_max[v] >= result.pval_perm[v]);
            assert!(result.pval_fdr[v] >= result.pval_perm[v]);
        }
    }

    #[test]
    fn worker_count_does_not_change_results() {
        let (d, c) = synthetic(3, 11, 20);
        let mask = LabelMask::all(20);
        let one = run(&d, &c, &mask, 1);
        let many = run(&d, &c, &mask, 4);
        assert_eq!(one.max_null, many.max_null);
        assert_eq!(one.pval_max, many.pval_max);
        assert_eq!(one.pval_perm, many.pval_perm);
        assert_eq!(one.pval_fdr, many.pval_fdr);
    }

    #[test]
    fn masked_vertices_are_neutral() {
        let (d, c) = synthetic(4, 9, 6);
        let mask = LabelMask::from_labels(&[0.0, 1.0, 1.0, f64::NAN, 1.0, 1.0]);
        let result = run(&d, &c, &mask, 2);
        assert_eq!(result.pval_max[0], NEUTRAL_P);
        assert_eq!(result.pval_perm[0], NEUTRAL_P);
        assert_eq!(result.pval_fdr[0], NEUTRAL_P);
        assert_eq!(result.pval_fdr[3], NEUTRAL_P);
    }

    #[test]
    fn constant_covariate_never_rejects() {
        let (mut d, _) = synthetic(5, 8, 10);
        let flat = Array1::from_elem(8, 3.0);
        d.covariate.fill(0.0);
        let result = run(&d, &flat, &LabelMask::all(10), 2);
        assert!(result.pval_perm.iter().all(|&p| p == 1.0));
        assert!(result.rho_obs.iter().all(|r| r.is_finite()));
    }

    #[test]
    fn rejects_degenerate_inputs() {
        let (d, c) = synthetic(6, 6, 4);
        let pool = WorkerPool::sequential();
        let cancel = CancellationToken::new();
        let ctx = ExecutionContext::new(&pool, &cancel, &NoopProgress);
        assert!(matches!(
            permutation_test(&d, c.view(), &LabelMask::all(4), 0, 1, ctx),
            Err(StatsError::InvalidOption(_))
        ));
        assert!(matches!(
            permutation_test(&d, c.view(), &LabelMask::all(5), 10, 1, ctx),
            Err(StatsError::LengthMismatch { .. })
        ));
        let short = c.slice(ndarray::s![..4]).to_owned();
        assert!(matches!(
            permutation_test(&d, short.view(), &LabelMask::all(4), 10, 1, ctx),
            Err(StatsError::LengthMismatch { .. })
        ));
        let single = PairDissimilarities {
            pairs: vec![(0, 1)],
            imaging: d.imaging.select(Axis(1), &[0]),
            covariate: d.covariate.slice(ndarray::s![..1]).to_owned(),
        };
        assert!(matches!(
            permutation_test(&single, c.view(), &LabelMask::all(4), 10, 1, ctx),
            Err(StatsError::TooFew { .. })
        ));
    }

    #[test]
    fn cancelling_mid_run_returns_no_result() {
        let (d, c) = synthetic(7, 10, 15);
        let mask = LabelMask::all(15);
        let permutations = 100 * PERMUTATIONS_PER_JOB;
        for pool in [WorkerPool::sequential(), WorkerPool::new(2).unwrap()] {
            let token = CancellationToken::new();
            let observer = CancelAfter::new(SyncProgressStage::Permutations, 2, token.clone());
            let ctx = ExecutionContext::new(&pool, &token, &observer);
            let outcome = permutation_test(&d, c.view(), &mask, permutations, 5, ctx);
            assert!(token.is_cancelled());
            assert!(matches!(outcome, Err(StatsError::Sync(SyncError::Cancelled))));
        }
    }
}
