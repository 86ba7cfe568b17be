//! Ordered parallel map over a fixed-size worker pool.
//!
//! Results are gathered by input index, so the output never depends on the
//! number of workers or on scheduling. When jobs fail, the error of the job
//! with the lowest index is returned; jobs with a higher index than a known
//! failure are skipped.

use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cancel::CancellationToken;
use crate::progress::{SyncProgressObserver, SyncProgressStage};
use crate::types::SyncError;

pub struct WorkerPool {
    pool: Option<rayon::ThreadPool>,
    workers: usize,
}

impl WorkerPool {
    /// Builds a pool of `workers` threads; zero means one per logical CPU.
    /// A single worker runs jobs inline on the calling thread.
    pub fn new(workers: usize) -> Result<Self, SyncError> {
        let workers = if workers == 0 {
            num_cpus::get().max(1)
        } else {
            workers
        };
        let pool = if workers == 1 {
            None
        } else {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(workers)
                    .thread_name(|i| format!("brainsync-worker-{i}"))
                    .build()?,
            )
        };
        log::debug!("Worker pool ready with {} worker(s)", workers);
        Ok(Self { pool, workers })
    }

    pub fn sequential() -> Self {
        Self {
            pool: None,
            workers: 1,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Applies `job` to every input and returns the outputs in input order.
    ///
    /// `job` receives the input index alongside the input. Cancellation is
    /// checked before each job starts.
    pub fn parallel_map<I, T, E, F>(
        &self,
        inputs: &[I],
        cancel: &CancellationToken,
        progress: &dyn SyncProgressObserver,
        stage: SyncProgressStage,
        job: F,
    ) -> Result<Vec<T>, E>
    where
        I: Sync,
        T: Send,
        E: Send + From<SyncError>,
        F: Fn(usize, &I) -> Result<T, E> + Sync,
    {
        progress.on_stage_start(stage, inputs.len());
        let completed = AtomicUsize::new(0);
        let run_one = |index: usize, input: &I| -> Result<T, E> {
            cancel.check()?;
            let output = job(index, input)?;
            let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
            progress.on_stage_advance(stage, done);
            Ok(output)
        };

        let outputs = match &self.pool {
            None => inputs
                .iter()
                .enumerate()
                .map(|(index, input)| run_one(index, input))
                .collect::<Result<Vec<T>, E>>()?,
            Some(pool) => {
                let first_failure = AtomicUsize::new(usize::MAX);
                let slots: Vec<Option<Result<T, E>>> = pool.install(|| {
                    inputs
                        .par_iter()
                        .enumerate()
                        .map(|(index, input)| {
                            if index > first_failure.load(Ordering::Relaxed) {
                                return None;
                            }
                            let outcome = run_one(index, input);
                            if outcome.is_err() {
                                first_failure.fetch_min(index, Ordering::Relaxed);
                            }
                            Some(outcome)
                        })
                        .collect()
                });
                gather_in_order(slots)?
            }
        };

        progress.on_stage_finish(stage);
        Ok(outputs)
    }
}

/// Pool, cancellation token and progress observer shared by one analysis run.
#[derive(Clone, Copy)]
pub struct ExecutionContext<'a> {
    pub pool: &'a WorkerPool,
    pub cancel: &'a CancellationToken,
    pub progress: &'a dyn SyncProgressObserver,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(
        pool: &'a WorkerPool,
        cancel: &'a CancellationToken,
        progress: &'a dyn SyncProgressObserver,
    ) -> Self {
        Self {
            pool,
            cancel,
            progress,
        }
    }

    pub fn map<I, T, E, F>(&self, inputs: &[I], stage: SyncProgressStage, job: F) -> Result<Vec<T>, E>
    where
        I: Sync,
        T: Send,
        E: Send + From<SyncError>,
        F: Fn(usize, &I) -> Result<T, E> + Sync,
    {
        self.pool
            .parallel_map(inputs, self.cancel, self.progress, stage, job)
    }
}

/// Unwraps the slots in index order. The lowest failing index always ran, so
/// its error is reached before any skipped slot.
fn gather_in_order<T, E: From<SyncError>>(slots: Vec<Option<Result<T, E>>>) -> Result<Vec<T>, E> {
    let mut outputs = Vec::with_capacity(slots.len());
    for slot in slots {
        match slot {
            Some(result) => outputs.push(result?),
            None => return Err(E::from(SyncError::Cancelled)),
        }
    }
    Ok(outputs)
}
