//! Shared data model for the synchronization core.
//!
//! A cohort is an ordered set of `Time x Vertices` matrices that all share the
//! same shape. Every entry point that takes more than one matrix validates the
//! shapes up front and fails with [`SyncError::DimensionMismatch`] rather than
//! truncating.

use ndarray::{Array2, ArrayView2};
use ndarray_linalg::error::LinalgError;
use std::borrow::Cow;
use thiserror::Error;

use crate::normalize::normalize_data;

/// Error type for normalization, synchronization and the worker pool.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(
        "Dimension mismatch in {context}: expected {expected:?} (time x vertices) but found {found:?}."
    )]
    DimensionMismatch {
        context: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error(
        "Input has {time_points} time points but only {vertices} vertices and is probably transposed. Matrices must be laid out as time x vertices."
    )]
    LikelyTransposed { time_points: usize, vertices: usize },

    #[error("At least {required} subjects are required, but {found} were supplied.")]
    InsufficientSubjects { found: usize, required: usize },

    #[error("Subject {subject} has {found} time points, fewer than the {required} requested.")]
    InsufficientTimePoints {
        subject: usize,
        found: usize,
        required: usize,
    },

    #[error("Singular value decomposition failed: {0}")]
    LinalgError(#[from] LinalgError),

    #[error("Singular value decomposition returned no singular vectors.")]
    MissingSingularVectors,

    #[error(
        "Group synchronization did not converge within {sweeps} sweeps. Last relative cost change was {relative_change:.6e}."
    )]
    GroupSyncDidNotConverge { sweeps: usize, relative_change: f64 },

    #[error(
        "Group synchronization exceeded its time limit of {limit_secs} s after {sweeps} sweeps. Last relative cost change was {relative_change:.6e}."
    )]
    GroupSyncTimedOut {
        limit_secs: f64,
        sweeps: usize,
        relative_change: f64,
    },

    #[error(
        "A cohort of {subjects} subjects with {time_points} time points and {vertices} vertices needs {required_bytes} bytes, exceeding the memory budget of {budget_bytes} bytes."
    )]
    MemoryBudgetExceeded {
        subjects: usize,
        time_points: usize,
        vertices: usize,
        required_bytes: usize,
        budget_bytes: usize,
    },

    #[error("The external atlas strategy was selected but no atlas matrix was supplied.")]
    MissingExternalAtlas,

    #[error("The operation was cancelled.")]
    Cancelled,

    #[error("Could not read subject {subject}: {message}")]
    Source { subject: usize, message: String },

    #[error("Could not build the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Checks that `found` has the shape `expected`.
pub(crate) fn ensure_shape(
    context: &'static str,
    expected: (usize, usize),
    found: (usize, usize),
) -> Result<(), SyncError> {
    if expected != found {
        return Err(SyncError::DimensionMismatch {
            context,
            expected,
            found,
        });
    }
    Ok(())
}

/// Rejects matrices with more time points than vertices.
pub(crate) fn ensure_time_by_vertices(matrix: ArrayView2<f64>) -> Result<(), SyncError> {
    let (time_points, vertices) = matrix.dim();
    if time_points > vertices {
        return Err(SyncError::LikelyTransposed {
            time_points,
            vertices,
        });
    }
    Ok(())
}

/// Bytes needed to hold `subjects` dense `time_points x vertices` matrices.
pub fn cohort_memory_bytes(subjects: usize, time_points: usize, vertices: usize) -> Option<usize> {
    subjects
        .checked_mul(time_points)?
        .checked_mul(vertices)?
        .checked_mul(core::mem::size_of::<f64>())
}

/// Memory currently available to the process, as reported by the operating system.
pub fn available_memory_bytes() -> usize {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    usize::try_from(system.available_memory()).unwrap_or(usize::MAX)
}

/// Fails when a cohort of the given shape does not fit in `budget_bytes`.
pub fn check_memory_budget(
    subjects: usize,
    time_points: usize,
    vertices: usize,
    budget_bytes: usize,
) -> Result<(), SyncError> {
    let required = cohort_memory_bytes(subjects, time_points, vertices).unwrap_or(usize::MAX);
    if required > budget_bytes {
        return Err(SyncError::MemoryBudgetExceeded {
            subjects,
            time_points,
            vertices,
            required_bytes: required,
            budget_bytes,
        });
    }
    log::debug!(
        "Cohort footprint {} bytes within budget of {} bytes",
        required,
        budget_bytes
    );
    Ok(())
}

/// An ordered collection of equally shaped `Time x Vertices` matrices.
#[derive(Clone, Debug)]
pub struct SubjectCohort {
    subjects: Vec<Array2<f64>>,
    time_points: usize,
    vertices: usize,
}

impl SubjectCohort {
    /// Wraps already prepared matrices, validating that all shapes agree.
    pub fn new(subjects: Vec<Array2<f64>>) -> Result<Self, SyncError> {
        let Some(first) = subjects.first() else {
            return Err(SyncError::InsufficientSubjects {
                found: 0,
                required: 1,
            });
        };
        let expected = first.dim();
        for subject in &subjects {
            ensure_shape("cohort construction", expected, subject.dim())?;
        }
        Ok(Self {
            subjects,
            time_points: expected.0,
            vertices: expected.1,
        })
    }

    /// Normalizes raw matrices, keeping the first `time_points` rows of each
    /// when a length is given.
    pub fn from_raw(raw: Vec<Array2<f64>>, time_points: Option<usize>) -> Result<Self, SyncError> {
        let mut normalized = Vec::with_capacity(raw.len());
        for (subject, matrix) in raw.into_iter().enumerate() {
            let view = match time_points {
                Some(required) => {
                    if matrix.nrows() < required {
                        return Err(SyncError::InsufficientTimePoints {
                            subject,
                            found: matrix.nrows(),
                            required,
                        });
                    }
                    matrix.slice(ndarray::s![..required, ..]).to_owned()
                }
                None => matrix,
            };
            normalized.push(normalize_data(view.view()).data);
        }
        Self::new(normalized)
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    pub fn time_points(&self) -> usize {
        self.time_points
    }

    pub fn vertices(&self) -> usize {
        self.vertices
    }

    pub fn dim(&self) -> (usize, usize) {
        (self.time_points, self.vertices)
    }

    pub fn subject(&self, index: usize) -> ArrayView2<'_, f64> {
        self.subjects[index].view()
    }

    pub fn subjects(&self) -> &[Array2<f64>] {
        &self.subjects
    }

    pub(crate) fn require_at_least(&self, required: usize) -> Result<(), SyncError> {
        if self.len() < required {
            return Err(SyncError::InsufficientSubjects {
                found: self.len(),
                required,
            });
        }
        Ok(())
    }
}

/// Random access to normalized subject matrices.
///
/// The per-pair jobs of the permutation engine only see subjects through this
/// trait, so an in-memory cohort and a lazily read directory of files are
/// interchangeable.
pub trait SubjectSource: Sync {
    fn n_subjects(&self) -> usize;

    /// `(time_points, vertices)` shared by every subject.
    fn dims(&self) -> (usize, usize);

    fn load(&self, index: usize) -> Result<Cow<'_, Array2<f64>>, SyncError>;
}

impl SubjectSource for SubjectCohort {
    fn n_subjects(&self) -> usize {
        self.len()
    }

    fn dims(&self) -> (usize, usize) {
        self.dim()
    }

    fn load(&self, index: usize) -> Result<Cow<'_, Array2<f64>>, SyncError> {
        self.subjects
            .get(index)
            .map(Cow::Borrowed)
            .ok_or_else(|| SyncError::Source {
                subject: index,
                message: format!("index out of range for a cohort of {}", self.len()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn cohort_rejects_mismatched_shapes() {
        let a = Array2::<f64>::zeros((3, 5));
        let b = Array2::<f64>::zeros((3, 4));
        match SubjectCohort::new(vec![a, b]).unwrap_err() {
            SyncError::DimensionMismatch {
                expected, found, ..
            } => {
                assert_eq!(expected, (3, 5));
                assert_eq!(found, (3, 4));
            }
            other => panic!("Expected DimensionMismatch, got {:?}", other),
        }
    }

    #[test]
    fn empty_cohort_is_rejected() {
        assert!(matches!(
            SubjectCohort::new(Vec::new()),
            Err(SyncError::InsufficientSubjects { found: 0, .. })
        ));
    }

    #[test]
    fn from_raw_truncates_and_normalizes() {
        let raw = array![[1.0, 2.0], [3.0, 5.0], [4.0, 1.0]];
        let cohort = SubjectCohort::from_raw(vec![raw.clone(), raw], Some(2)).unwrap();
        assert_eq!(cohort.dim(), (2, 2));
        for column in cohort.subject(0).columns() {
            assert!(column.sum().abs() < 1e-12);
            assert!((column.dot(&column) - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn from_raw_rejects_short_subjects() {
        let raw = Array2::<f64>::ones((2, 4));
        match SubjectCohort::from_raw(vec![raw], Some(3)).unwrap_err() {
            SyncError::InsufficientTimePoints {
                subject,
                found,
                required,
            } => {
                assert_eq!((subject, found, required), (0, 2, 3));
            }
            other => panic!("Expected InsufficientTimePoints, got {:?}", other),
        }
    }

    #[test]
    fn memory_budget_is_enforced() {
        assert_eq!(cohort_memory_bytes(2, 3, 4), Some(2 * 3 * 4 * 8));
        assert!(check_memory_budget(2, 3, 4, 192).is_ok());
        assert!(matches!(
            check_memory_budget(2, 3, 4, 191),
            Err(SyncError::MemoryBudgetExceeded {
                required_bytes: 192,
                ..
            })
        ));
    }
}
