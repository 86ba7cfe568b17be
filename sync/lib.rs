#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod atlas;
pub mod cancel;
pub mod config;
pub mod group;
pub mod io;
pub mod normalize;
pub mod orthogonal;
pub mod pairwise;
pub mod parallel;
pub mod progress;
pub mod types;

#[path = "../stats/mod.rs"]
pub mod stats;

pub use atlas::{
    AtlasBuild, AtlasStrategy, build_atlas, dist_to_atlas, external_atlas, sync_to_atlas,
};
pub use cancel::CancellationToken;
pub use config::{AnalysisConfig, ConfigError};
pub use group::{GroupSyncOptions, GroupSyncResult, group_brain_sync};
pub use normalize::{NORM_FLOOR, NormalizedSignal, normalize_data};
pub use pairwise::{Synchronized, brain_sync};
pub use parallel::{ExecutionContext, WorkerPool};
pub use progress::{NoopProgress, SyncProgressObserver, SyncProgressStage};
pub use types::{SubjectCohort, SubjectSource, SyncError};
