//! Subject pairs and their synchronized dissimilarities.

use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use super::{StatsError, ensure_len};
use crate::pairwise::{brain_sync, squared_residual};
use crate::parallel::ExecutionContext;
use crate::progress::SyncProgressStage;
use crate::types::{SubjectSource, SyncError};

/// Unordered pair `(first, second)` with `first < second`.
pub type SubjectPair = (usize, usize);

/// Every unordered pair of `n` subjects in lexicographic order.
pub fn enumerate_pairs(n: usize) -> Vec<SubjectPair> {
    (0..n).tuple_combinations().collect()
}

/// All pairs, or a uniformly random subset of `target` of them.
///
/// A `target` of zero, or one at least the number of pairs, keeps every pair
/// in lexicographic order. Otherwise the pair list is shuffled with `seed` and
/// truncated.
pub fn sample_pairs(n: usize, target: usize, seed: u64) -> Vec<SubjectPair> {
    let mut pairs = enumerate_pairs(n);
    if target == 0 || target >= pairs.len() {
        return pairs;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    pairs.shuffle(&mut rng);
    pairs.truncate(target);
    pairs
}

/// Pair-indexed imaging and covariate dissimilarities.
#[derive(Clone, Debug)]
pub struct PairDissimilarities {
    pub pairs: Vec<SubjectPair>,
    /// `Vertices x Pairs`: per-vertex squared residual after syncing the
    /// second subject onto the first.
    pub imaging: Array2<f64>,
    /// `(c_first − c_second)²` per pair.
    pub covariate: Array1<f64>,
}

impl PairDissimilarities {
    pub fn n_pairs(&self) -> usize {
        self.pairs.len()
    }

    pub fn n_vertices(&self) -> usize {
        self.imaging.nrows()
    }
}

/// Imaging dissimilarity of one pair: `second` is synchronized onto `first`.
pub fn pair_distance<S: SubjectSource + ?Sized>(
    source: &S,
    pair: SubjectPair,
) -> Result<Array1<f64>, SyncError> {
    let first = source.load(pair.0)?;
    let second = source.load(pair.1)?;
    let synced = brain_sync(first.view(), second.view())?;
    Ok(squared_residual(synced.aligned.view(), first.view()))
}

/// Runs the per-pair job over `pairs` and gathers the results by pair index.
pub fn compute_pair_dissimilarities<S: SubjectSource + ?Sized>(
    source: &S,
    covariate: ArrayView1<f64>,
    pairs: Vec<SubjectPair>,
    ctx: ExecutionContext<'_>,
) -> Result<PairDissimilarities, StatsError> {
    ensure_len("covariate vector", source.n_subjects(), covariate.len())?;
    let vertices = source.dims().1;

    let columns = ctx.map(&pairs, SyncProgressStage::PairDistances, |_, &pair| {
        pair_distance(source, pair)
    })?;

    let mut imaging = Array2::zeros((vertices, pairs.len()));
    for (mut column, values) in imaging.axis_iter_mut(Axis(1)).zip(&columns) {
        column.assign(values);
    }
    let covariate = pairs
        .iter()
        .map(|&(i, j)| {
            let d = covariate[i] - covariate[j];
            d * d
        })
        .collect();

    log::info!(
        "Computed synchronized distances for {} pairs over {} vertices",
        pairs.len(),
        vertices
    );
    Ok(PairDissimilarities {
        pairs,
        imaging,
        covariate,
    })
}
