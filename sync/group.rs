//! Joint alignment of a cohort onto a simultaneously estimated atlas.
//!
//! Minimizes `Σᵢ ‖Rᵢ Sᵢ − X̄‖²_F` with `X̄` the mean of the rotated subjects by
//! coordinate descent: each `Rᵢ` in turn is replaced by the Procrustes
//! rotation of `Sᵢ` onto the leave-one-out mean of the others. Every update
//! is the exact minimizer over its block, so the cost never increases, but the
//! problem is non-convex and the limit is only a local optimum.
//!
//! Sweeps stop when the change in cost relative to the initial cost drops
//! below the tolerance. A run that hits `max_sweeps` or its time limit first
//! is reported as an error rather than returned as if it had converged.

use ndarray::{Array2, ArrayView2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::cancel::CancellationToken;
use crate::orthogonal::haar_orthogonal;
use crate::pairwise::procrustes_rotation;
use crate::progress::{SyncProgressObserver, SyncProgressStage};
use crate::types::{SubjectCohort, SyncError, ensure_time_by_vertices};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupSyncOptions {
    /// Convergence threshold on `|Error − PreviousError| / |InitialError|`.
    pub tolerance: f64,
    pub max_sweeps: usize,
    /// Seed for the random initial rotations.
    pub seed: u64,
    /// Wall-clock limit checked after every sweep.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_limit_secs: Option<f64>,
}

impl Default for GroupSyncOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_sweeps: 1000,
            seed: 0x5EED,
            time_limit_secs: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GroupSyncResult {
    /// Mean of the rotated subjects.
    pub atlas: Array2<f64>,
    /// One `Time x Time` rotation per subject, in cohort order.
    pub rotations: Vec<Array2<f64>>,
    /// Cost decrease achieved by each sweep.
    pub cost_decrease: Vec<f64>,
    /// Total cost after each sweep.
    pub error_trace: Vec<f64>,
    pub initial_error: f64,
    pub total_error: f64,
    pub sweeps: usize,
}

fn mean_of(sum: &Array2<f64>, count: usize) -> Array2<f64> {
    sum / count as f64
}

fn sum_of(rotated: &[Array2<f64>]) -> Array2<f64> {
    let mut sum = Array2::zeros(rotated[0].raw_dim());
    for matrix in rotated {
        sum += matrix;
    }
    sum
}

fn total_error(rotated: &[Array2<f64>], atlas: ArrayView2<f64>) -> f64 {
    rotated
        .iter()
        .map(|matrix| {
            matrix
                .iter()
                .zip(atlas.iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f64>()
        })
        .sum()
}

pub fn group_brain_sync(
    cohort: &SubjectCohort,
    options: &GroupSyncOptions,
    cancel: &CancellationToken,
    progress: &dyn SyncProgressObserver,
) -> Result<GroupSyncResult, SyncError> {
    cohort.require_at_least(2)?;
    ensure_time_by_vertices(cohort.subject(0))?;

    let n_subjects = cohort.len();
    let time_points = cohort.time_points();
    let started = Instant::now();

    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut rotations = Vec::with_capacity(n_subjects);
    for _ in 0..n_subjects {
        rotations.push(haar_orthogonal(time_points, &mut rng)?);
    }
    let mut rotated: Vec<Array2<f64>> = rotations
        .iter()
        .zip(cohort.subjects())
        .map(|(rotation, subject)| rotation.dot(subject))
        .collect();

    let mut sum = sum_of(&rotated);
    let initial_error = total_error(&rotated, mean_of(&sum, n_subjects).view());
    log::info!(
        "Group synchronization of {} subjects ({} x {}), initial error {:.6e}",
        n_subjects,
        time_points,
        cohort.vertices(),
        initial_error
    );

    let mut previous_error = initial_error;
    let mut cost_decrease = Vec::new();
    let mut error_trace = Vec::new();
    let loo_scale = 1.0 / (n_subjects - 1) as f64;

    progress.on_stage_start(SyncProgressStage::GroupSweeps, options.max_sweeps);

    for sweep in 1..=options.max_sweeps {
        cancel.check()?;

        for (i, subject) in cohort.subjects().iter().enumerate() {
            let leave_one_out = (&sum - &rotated[i]) * loo_scale;
            let cross = leave_one_out.dot(&subject.t());
            let rotation = procrustes_rotation(cross.view())?;
            let updated = rotation.dot(subject);
            sum = sum - &rotated[i] + &updated;
            rotated[i] = updated;
            rotations[i] = rotation;
        }

        // Rebuild the running sum so rounding does not accumulate across sweeps.
        sum = sum_of(&rotated);
        let error = total_error(&rotated, mean_of(&sum, n_subjects).view());
        cost_decrease.push(previous_error - error);
        error_trace.push(error);

        let relative_change = if initial_error == 0.0 {
            0.0
        } else {
            (error - previous_error).abs() / initial_error.abs()
        };
        log::debug!(
            "Sweep {}: error {:.6e}, relative change {:.3e}",
            sweep,
            error,
            relative_change
        );
        progress.on_stage_advance(SyncProgressStage::GroupSweeps, sweep);
        previous_error = error;

        if relative_change < options.tolerance {
            progress.on_stage_finish(SyncProgressStage::GroupSweeps);
            log::info!(
                "Group synchronization converged after {} sweeps, error {:.6e}",
                sweep,
                error
            );
            return Ok(GroupSyncResult {
                atlas: mean_of(&sum, n_subjects),
                rotations,
                cost_decrease,
                error_trace,
                initial_error,
                total_error: error,
                sweeps: sweep,
            });
        }

        if let Some(limit_secs) = options.time_limit_secs {
            if started.elapsed().as_secs_f64() > limit_secs {
                progress.on_stage_finish(SyncProgressStage::GroupSweeps);
                log::warn!("Group synchronization stopped by its time limit");
                return Err(SyncError::GroupSyncTimedOut {
                    limit_secs,
                    sweeps: sweep,
                    relative_change,
                });
            }
        }
    }

    progress.on_stage_finish(SyncProgressStage::GroupSweeps);
    let relative_change = match (error_trace.len(), initial_error) {
        (0, _) => f64::INFINITY,
        (_, e) if e == 0.0 => 0.0,
        (len, e) => cost_decrease[len - 1].abs() / e.abs(),
    };
    log::warn!(
        "Group synchronization did not converge within {} sweeps",
        options.max_sweeps
    );
    Err(SyncError::GroupSyncDidNotConverge {
        sweeps: options.max_sweeps,
        relative_change,
    })
}
