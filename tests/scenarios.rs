use ndarray::{Array1, Array2, array};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use brainsync::orthogonal::{haar_orthogonal, max_orthogonality_error};
use brainsync::pairwise::{frobenius_distance, procrustes_rotation};
use brainsync::stats::{LabelMask, PermutationMethod, PermutationOptions, pairwise_regression};
use brainsync::{
    CancellationToken, ExecutionContext, GroupSyncOptions, NoopProgress, SubjectCohort,
    WorkerPool, brain_sync, group_brain_sync, normalize_data,
};

fn gaussian(rng: &mut StdRng, rows: usize, cols: usize, scale: f64) -> Array2<f64> {
    Array2::from_shape_simple_fn((rows, cols), || scale * rng.sample::<f64, _>(StandardNormal))
}

#[test]
fn rotation_of_a_small_matrix_is_recovered_exactly() {
    let x = array![
        [1.0, -0.5, 2.0, 0.3],
        [0.2, 1.5, -1.0, 0.8],
        [-0.7, 0.4, 0.9, -1.2]
    ];
    let mut rng = StdRng::seed_from_u64(2024);
    let q = haar_orthogonal(3, &mut rng).unwrap();
    let y = q.dot(&x);

    let synced = brain_sync(x.view(), y.view()).unwrap();
    let inverse = q.t().to_owned();
    assert!(frobenius_distance(synced.rotation.view(), inverse.view()) < 1e-10);
    assert!(frobenius_distance(synced.aligned.view(), x.view()) < 1e-10);
    assert!(max_orthogonality_error(synced.rotation.view()) < 1e-8);
}

#[test]
fn rotated_copies_share_one_atlas() {
    let mut rng = StdRng::seed_from_u64(7);
    let base = normalize_data(gaussian(&mut rng, 3, 20, 1.0).view()).data;
    let subjects: Vec<Array2<f64>> = (0..5)
        .map(|_| haar_orthogonal(3, &mut rng).unwrap().dot(&base))
        .collect();
    let cohort = SubjectCohort::new(subjects).unwrap();

    let options = GroupSyncOptions {
        max_sweeps: 50,
        ..GroupSyncOptions::default()
    };
    let result = group_brain_sync(&cohort, &options, &CancellationToken::new(), &NoopProgress)
        .unwrap();
    assert!(result.sweeps <= 50);
    assert!(result.total_error <= 1e-3 * result.initial_error);

    // The atlas is the base up to a single orthogonal transform.
    let global = procrustes_rotation(base.dot(&result.atlas.t()).view()).unwrap();
    let recovered = global.dot(&result.atlas);
    let relative = frobenius_distance(recovered.view(), base.view())
        / base.iter().map(|v| v * v).sum::<f64>().sqrt();
    assert!(relative < 0.05, "relative atlas error {relative}");

    for pair in result.error_trace.windows(2) {
        assert!(pair[1] <= pair[0] + 1e-9);
    }
}

#[test]
fn planted_covariate_effect_is_found_at_its_vertices() {
    let n_subjects = 20;
    let time_points = 10;
    let vertices = 100;
    let planted = [3, 17, 42, 66, 91];

    let mut rng = StdRng::seed_from_u64(314);
    let base = normalize_data(gaussian(&mut rng, time_points, vertices, 1.0).view()).data;
    let direction = {
        let raw = gaussian(&mut rng, time_points, 1, 1.0);
        let norm = raw.iter().map(|v| v * v).sum::<f64>().sqrt();
        raw / norm
    };
    let covariate: Array1<f64> = (0..n_subjects).map(|_| rng.gen_range(0.0..1.0)).collect();

    let subjects: Vec<Array2<f64>> = (0..n_subjects)
        .map(|s| {
            let mut signal = base.clone();
            for &v in &planted {
                let mut column = signal.column_mut(v);
                column.scaled_add(0.5 * covariate[s], &direction.column(0));
            }
            signal += &gaussian(&mut rng, time_points, vertices, 0.02);
            haar_orthogonal(time_points, &mut rng).unwrap().dot(&signal)
        })
        .collect();
    let cohort = SubjectCohort::new(subjects).unwrap();

    let pool = WorkerPool::new(4).unwrap();
    let cancel = CancellationToken::new();
    let options = PermutationOptions {
        num_pairs: 0,
        permutations: 2000,
        seed: 11,
        method: PermutationMethod::MaxStatistic,
    };
    let field = pairwise_regression(
        &cohort,
        covariate.view(),
        &LabelMask::all(vertices),
        &options,
        ExecutionContext::new(&pool, &cancel, &NoopProgress),
    )
    .unwrap();

    assert_eq!(field.n_pairs, n_subjects * (n_subjects - 1) / 2);
    for &v in &planted {
        assert!(field.pval_fdr[v] < 0.05, "vertex {v}: {}", field.pval_fdr[v]);
        assert!(field.statistic[v] > 0.5);
    }
    let false_hits = (0..vertices)
        .filter(|v| !planted.contains(v))
        .filter(|&v| field.pval_fdr[v] < 0.05)
        .count();
    assert!(false_hits <= 10, "{false_hits} unplanted vertices rejected");

    let pval_max = field.pval_max.as_ref().unwrap();
    for &v in &planted {
        assert!(pval_max[v] < 0.01);
    }
}
