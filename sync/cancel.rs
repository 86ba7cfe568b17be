use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::types::SyncError;

/// Shared flag for stopping a long run from another thread.
///
/// Clones observe the same flag. Long loops poll it between units of work
/// (sweeps, pair jobs, permutations), so cancellation is prompt but never
/// interrupts a decomposition halfway.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<(), SyncError> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }
}
