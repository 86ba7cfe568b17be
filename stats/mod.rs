//! Vertex-wise statistics over synchronized distances.

pub mod covariates;
pub mod engine;
pub mod fdr;
pub mod mask;
pub mod pairs;
pub mod pearson;
pub mod permutation;
pub mod ranksum;
pub mod regression;

use ndarray_linalg::error::LinalgError;
use thiserror::Error;

use crate::types::SyncError;
use covariates::CovariateError;

pub use engine::{AssociationField, CompareOptions, SubjectComparison, compare_subject_to_controls, pairwise_regression};
pub use mask::{LabelMask, NEUTRAL_P};
pub use permutation::{PermutationMethod, PermutationOptions};

#[derive(Error, Debug)]
pub enum StatsError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Least-squares solve failed: {0}")]
    Linalg(#[from] LinalgError),

    #[error(transparent)]
    Covariate(#[from] CovariateError),

    #[error("Length mismatch for {context}: expected {expected} but found {found}.")]
    LengthMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("At least {required} {what} are required, but only {found} are available.")]
    TooFew {
        what: &'static str,
        found: usize,
        required: usize,
    },

    #[error("Invalid distribution parameters: {0}")]
    Distribution(String),

    #[error("Invalid option: {0}")]
    InvalidOption(String),
}

pub(crate) fn ensure_len(context: &'static str, expected: usize, found: usize) -> Result<(), StatsError> {
    if expected != found {
        return Err(StatsError::LengthMismatch {
            context,
            expected,
            found,
        });
    }
    Ok(())
}
