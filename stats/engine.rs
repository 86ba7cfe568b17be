//! Entry points of the pairwise regression and group-difference analyses.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use super::fdr::benjamini_hochberg_masked;
use super::mask::LabelMask;
use super::pairs::{compute_pair_dissimilarities, sample_pairs};
use super::pearson::pearson_fdr;
use super::permutation::{PermutationMethod, PermutationOptions, permutation_test};
use super::ranksum::RankSumTest;
use super::{StatsError, ensure_len};
use crate::pairwise::{brain_sync, squared_residual};
use crate::parallel::ExecutionContext;
use crate::progress::SyncProgressStage;
use crate::types::{SubjectSource, SyncError, ensure_shape};

/// Vertex-wise association between synchronized distances and a covariate.
#[derive(Clone, Debug)]
pub struct AssociationField {
    pub method: PermutationMethod,
    /// Correlation across pairs per vertex.
    pub statistic: Array1<f64>,
    pub pval: Array1<f64>,
    pub pval_fdr: Array1<f64>,
    /// Family-wise corrected p-values; only produced by the max-statistic test.
    pub pval_max: Option<Array1<f64>>,
    pub n_pairs: usize,
    pub permutations: usize,
}

/// Tests every vertex for association between pairwise synchronized
/// distances and pairwise covariate differences.
pub fn pairwise_regression<S: SubjectSource + ?Sized>(
    source: &S,
    covariate: ArrayView1<f64>,
    mask: &LabelMask,
    options: &PermutationOptions,
    ctx: ExecutionContext<'_>,
) -> Result<AssociationField, StatsError> {
    let n = source.n_subjects();
    ensure_len("covariate vector", n, covariate.len())?;
    if n < 3 {
        return Err(StatsError::TooFew {
            what: "subjects for pairwise regression",
            found: n,
            required: 3,
        });
    }
    mask.ensure_vertices(source.dims().1)?;

    let pairs = sample_pairs(n, options.num_pairs, options.seed);
    log::info!(
        "Pairwise regression over {} of {} possible pairs ({:?})",
        pairs.len(),
        n * (n - 1) / 2,
        options.method
    );
    let dissimilarities = compute_pair_dissimilarities(source, covariate, pairs, ctx)?;
    let n_pairs = dissimilarities.n_pairs();

    match options.method {
        PermutationMethod::MaxStatistic => {
            let result = permutation_test(
                &dissimilarities,
                covariate,
                mask,
                options.permutations,
                options.seed,
                ctx,
            )?;
            Ok(AssociationField {
                method: options.method,
                statistic: result.rho_obs,
                pval: result.pval_perm,
                pval_fdr: result.pval_fdr,
                pval_max: Some(result.pval_max),
                n_pairs,
                permutations: result.permutations,
            })
        }
        PermutationMethod::PearsonFdr => {
            let field = pearson_fdr(
                dissimilarities.imaging.view(),
                dissimilarities.covariate.view(),
                mask,
            )?;
            Ok(AssociationField {
                method: options.method,
                statistic: field.r,
                pval: field.pval,
                pval_fdr: field.pval_fdr,
                pval_max: None,
                n_pairs,
                permutations: 0,
            })
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompareOptions {
    /// Control pairs sampled for the null distribution; zero uses every pair.
    pub num_pairs: usize,
    pub seed: u64,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            num_pairs: 1000,
            seed: 0x5EED,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SubjectComparison {
    /// Rank-sum z per vertex; positive when the subject is farther from the
    /// controls than controls are from each other.
    pub statistic: Array1<f64>,
    pub pval: Array1<f64>,
    pub pval_fdr: Array1<f64>,
    pub n_null_pairs: usize,
}

/// Compares one subject against a control group.
///
/// The null sample at each vertex is the synchronized distance of sampled
/// control pairs; the test sample is the distance from the subject to every
/// control, each control synchronized onto the subject.
pub fn compare_subject_to_controls<S: SubjectSource + ?Sized>(
    subject: ArrayView2<f64>,
    controls: &S,
    mask: &LabelMask,
    options: &CompareOptions,
    ctx: ExecutionContext<'_>,
) -> Result<SubjectComparison, StatsError> {
    let n_controls = controls.n_subjects();
    if n_controls < 2 {
        return Err(SyncError::InsufficientSubjects {
            found: n_controls,
            required: 2,
        }
        .into());
    }
    ensure_shape("subject against controls", controls.dims(), subject.dim())?;
    let vertices = subject.ncols();
    mask.ensure_vertices(vertices)?;

    let pairs = sample_pairs(n_controls, options.num_pairs, options.seed);
    let null = compute_pair_dissimilarities(
        controls,
        Array1::zeros(n_controls).view(),
        pairs,
        ctx,
    )?;

    let indices: Vec<usize> = (0..n_controls).collect();
    let to_controls = ctx.map(&indices, SyncProgressStage::PairDistances, |_, &control| {
        let matrix = controls.load(control)?;
        let synced = brain_sync(subject, matrix.view())?;
        Ok::<_, SyncError>(squared_residual(synced.aligned.view(), subject))
    })?;
    let mut observed = Array2::zeros((vertices, n_controls));
    for (mut column, values) in observed.axis_iter_mut(Axis(1)).zip(&to_controls) {
        column.assign(values);
    }

    let test = RankSumTest::new()?;
    let mut statistic = Array1::zeros(vertices);
    let mut pval = Array1::zeros(vertices);
    for (v, (first, second)) in observed
        .axis_iter(Axis(0))
        .zip(null.imaging.axis_iter(Axis(0)))
        .enumerate()
    {
        let first = first.to_vec();
        let second = second.to_vec();
        let (z, p) = test.test(&first, &second);
        statistic[v] = z;
        pval[v] = p;
    }
    let pval = mask.neutralize(pval);
    let pval_fdr = benjamini_hochberg_masked(pval.view(), mask);

    log::info!(
        "Compared subject with {} controls using {} control pairs",
        n_controls,
        null.n_pairs()
    );
    Ok(SubjectComparison {
        statistic,
        pval,
        pval_fdr,
        n_null_pairs: null.n_pairs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::orthogonal::haar_orthogonal;
    use crate::parallel::WorkerPool;
    use crate::progress::NoopProgress;
    use crate::stats::mask::NEUTRAL_P;
    use crate::types::SubjectCohort;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn rotated_cohort(seed: u64, n: usize, time_points: usize, vertices: usize) -> (Array2<f64>, SubjectCohort) {
        let mut rng = StdRng::seed_from_u64(seed);
        let raw = Array2::from_shape_simple_fn((time_points, vertices), || rng.sample::<f64, _>(StandardNormal));
        let base = crate::normalize::normalize_data(raw.view()).data;
        let subjects = (0..n)
            .map(|_| {
                let q = haar_orthogonal(time_points, &mut rng).unwrap();
                let noise = Array2::from_shape_simple_fn((time_points, vertices), || {
                    0.05 * rng.sample::<f64, _>(StandardNormal)
                });
                q.dot(&base) + noise
            })
            .collect();
        (base, SubjectCohort::new(subjects).unwrap())
    }

    #[test]
    fn both_methods_report_one_value_per_vertex() {
        let (_, cohort) = rotated_cohort(11, 6, 5, 12);
        let covariate = ndarray::array![0.1, 0.5, 0.9, 0.3, 0.7, 0.2];
        let pool = WorkerPool::new(2).unwrap();
        let cancel = CancellationToken::new();
        let ctx = ExecutionContext::new(&pool, &cancel, &NoopProgress);
        for method in [PermutationMethod::MaxStatistic, PermutationMethod::PearsonFdr] {
            let options = PermutationOptions {
                num_pairs: 0,
                permutations: 50,
                seed: 3,
                method,
            };
            let field =
                pairwise_regression(&cohort, covariate.view(), &LabelMask::all(12), &options, ctx)
                    .unwrap();
            assert_eq!(field.statistic.len(), 12);
            assert_eq!(field.n_pairs, 15);
            assert_eq!(field.pval_max.is_some(), method == PermutationMethod::MaxStatistic);
            assert!(field.pval.iter().all(|p| (0.0..=1.0).contains(p)));
            assert!(field.pval_fdr.iter().zip(&field.pval).all(|(q, p)| q >= p));
        }
    }

    #[test]
    fn regression_needs_three_subjects() {
        let (_, cohort) = rotated_cohort(12, 2, 4, 6);
        let pool = WorkerPool::sequential();
        let cancel = CancellationToken::new();
        let result = pairwise_regression(
            &cohort,
            ndarray::array![1.0, 2.0].view(),
            &LabelMask::all(6),
            &PermutationOptions::default(),
            ExecutionContext::new(&pool, &cancel, &NoopProgress),
        );
        assert!(matches!(result, Err(StatsError::TooFew { found: 2, .. })));
    }

    #[test]
    fn deviant_vertices_stand_out_against_controls() {
        let (base, controls) = rotated_cohort(13, 8, 6, 20);
        let mut rng = StdRng::seed_from_u64(99);
        let mut patient = base.clone();
        // Vertices 0..4 carry an unrelated signal in the patient.
        for v in 0..4 {
            for t in 0..base.nrows() {
                patient[[t, v]] = rng.sample::<f64, _>(StandardNormal);
            }
        }
        let patient = crate::normalize::normalize_data(patient.view()).data;

        let pool = WorkerPool::new(3).unwrap();
        let cancel = CancellationToken::new();
        let mut labels = vec![1.0; 20];
        labels[19] = 0.0;
        let mask = LabelMask::from_labels(&labels);
        let out = compare_subject_to_controls(
            patient.view(),
            &controls,
            &mask,
            &CompareOptions {
                num_pairs: 0,
                seed: 5,
            },
            ExecutionContext::new(&pool, &cancel, &NoopProgress),
        )
        .unwrap();
        assert_eq!(out.n_null_pairs, 28);
        for v in 0..4 {
            assert!(out.statistic[v] > 0.0);
            assert!(out.pval[v] < 0.01);
        }
        assert_eq!(out.pval[19], NEUTRAL_P);
        assert_eq!(out.pval_fdr[19], NEUTRAL_P);
    }

    #[test]
    fn comparison_checks_shapes() {
        let (_, controls) = rotated_cohort(14, 3, 4, 6);
        let pool = WorkerPool::sequential();
        let cancel = CancellationToken::new();
        let wrong = Array2::<f64>::zeros((4, 5));
        let result = compare_subject_to_controls(
            wrong.view(),
            &controls,
            &LabelMask::all(5),
            &CompareOptions::default(),
            ExecutionContext::new(&pool, &cancel, &NoopProgress),
        );
        assert!(matches!(
            result,
            Err(StatsError::Sync(SyncError::DimensionMismatch { .. }))
        ));
    }
}
