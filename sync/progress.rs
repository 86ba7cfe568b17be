use std::fmt;

/// Stages reported by long-running synchronization and statistics loops.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncProgressStage {
    GroupSweeps,
    AtlasSync,
    PairDistances,
    Permutations,
    RepresentativeSearch,
}

impl SyncProgressStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::GroupSweeps => "group synchronization sweeps",
            Self::AtlasSync => "synchronization to atlas",
            Self::PairDistances => "pairwise synchronized distances",
            Self::Permutations => "label permutations",
            Self::RepresentativeSearch => "representative subject search",
        }
    }
}

impl fmt::Display for SyncProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for incremental progress.
///
/// Methods take `&self` because parallel stages report from worker threads;
/// implementations synchronize internally.
pub trait SyncProgressObserver: Send + Sync {
    fn on_stage_start(&self, stage: SyncProgressStage, total: usize) {
        let _ = (stage, total);
    }
    fn on_stage_advance(&self, stage: SyncProgressStage, completed: usize) {
        let _ = (stage, completed);
    }
    fn on_stage_finish(&self, stage: SyncProgressStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl SyncProgressObserver for NoopProgress {}
