//! Atlas construction and per-vertex distances to an atlas.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::group::{GroupSyncOptions, GroupSyncResult, group_brain_sync};
use crate::pairwise::{brain_sync, frobenius_distance, squared_residual};
use crate::parallel::ExecutionContext;
use crate::progress::SyncProgressStage;
use crate::types::{SubjectCohort, SubjectSource, SyncError, ensure_shape};

/// How the reference atlas of a run is obtained.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtlasStrategy {
    /// Jointly estimated by the group synchronizer.
    #[default]
    GroupSync,
    /// Average of the cohort synchronized onto its most central subject.
    RepresentativeAverage,
    /// Supplied by the caller.
    External,
}

/// Synchronizes every subject of `source` onto `atlas`, in subject order.
pub fn sync_to_atlas<S: SubjectSource + ?Sized>(
    atlas: ArrayView2<f64>,
    source: &S,
    ctx: ExecutionContext<'_>,
) -> Result<SubjectCohort, SyncError> {
    ensure_shape("synchronization to atlas", source.dims(), atlas.dim())?;
    let indices: Vec<usize> = (0..source.n_subjects()).collect();
    let aligned = ctx.map(&indices, SyncProgressStage::AtlasSync, |_, &subject| {
        let matrix = source.load(subject)?;
        Ok::<_, SyncError>(brain_sync(atlas, matrix.view())?.aligned)
    })?;
    SubjectCohort::new(aligned)
}

/// `Vertices x Subjects` field of per-vertex squared residuals to the atlas.
pub fn dist_to_atlas(
    atlas: ArrayView2<f64>,
    synchronized: &SubjectCohort,
) -> Result<Array2<f64>, SyncError> {
    ensure_shape("distance to atlas", atlas.dim(), synchronized.dim())?;
    let mut field = Array2::zeros((synchronized.vertices(), synchronized.len()));
    for (mut column, subject) in field
        .axis_iter_mut(Axis(1))
        .zip(synchronized.subjects())
    {
        column.assign(&squared_residual(subject.view(), atlas));
    }
    Ok(field)
}

/// Subject whose synchronized distance to the rest of the cohort is smallest.
#[derive(Clone, Debug)]
pub struct RepresentativeSubject {
    pub index: usize,
    /// `distances[[i, j]] = ‖Sᵢ − sync(Sᵢ, Sⱼ)‖_F`; zero on the diagonal.
    pub distances: Array2<f64>,
}

pub fn select_representative(
    cohort: &SubjectCohort,
    ctx: ExecutionContext<'_>,
) -> Result<RepresentativeSubject, SyncError> {
    cohort.require_at_least(1)?;
    let n = cohort.len();
    let pairs: Vec<(usize, usize)> = (0..n)
        .flat_map(|i| (0..n).filter(move |&j| j != i).map(move |j| (i, j)))
        .collect();

    let values = ctx.map(
        &pairs,
        SyncProgressStage::RepresentativeSearch,
        |_, &(i, j)| {
            let synced = brain_sync(cohort.subject(i), cohort.subject(j))?;
            Ok::<_, SyncError>(frobenius_distance(cohort.subject(i), synced.aligned.view()))
        },
    )?;

    let mut distances = Array2::zeros((n, n));
    for (&(i, j), value) in pairs.iter().zip(values) {
        distances[[i, j]] = value;
    }

    let row_sums: Array1<f64> = distances.sum_axis(Axis(1));
    let index = row_sums
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |best, (i, &total)| {
            if total < best.1 { (i, total) } else { best }
        })
        .0;
    log::info!(
        "Representative subject is {} with total synchronized distance {:.6e}",
        index,
        row_sums[index]
    );
    Ok(RepresentativeSubject { index, distances })
}

/// Mean of the cohort synchronized onto `reference`.
pub fn average_atlas(
    reference: ArrayView2<f64>,
    cohort: &SubjectCohort,
    ctx: ExecutionContext<'_>,
) -> Result<Array2<f64>, SyncError> {
    let synchronized = sync_to_atlas(reference, cohort, ctx)?;
    let mut atlas = Array2::zeros(cohort.dim());
    for subject in synchronized.subjects() {
        atlas += subject;
    }
    atlas /= synchronized.len() as f64;
    Ok(atlas)
}

#[derive(Clone, Debug)]
pub struct AtlasBuild {
    pub atlas: Array2<f64>,
    /// Set by [`AtlasStrategy::RepresentativeAverage`].
    pub representative: Option<usize>,
    /// Set by [`AtlasStrategy::GroupSync`].
    pub group: Option<GroupSyncResult>,
}

/// Produces the reference atlas for `cohort` with the chosen strategy.
///
/// `external` is required for [`AtlasStrategy::External`] and ignored otherwise.
pub fn build_atlas(
    cohort: &SubjectCohort,
    strategy: AtlasStrategy,
    external: Option<ArrayView2<f64>>,
    group_options: &GroupSyncOptions,
    ctx: ExecutionContext<'_>,
) -> Result<AtlasBuild, SyncError> {
    log::info!("Building atlas from {} subjects ({:?})", cohort.len(), strategy);
    match strategy {
        AtlasStrategy::GroupSync => {
            let group = group_brain_sync(cohort, group_options, ctx.cancel, ctx.progress)?;
            Ok(AtlasBuild {
                atlas: group.atlas.clone(),
                representative: None,
                group: Some(group),
            })
        }
        AtlasStrategy::RepresentativeAverage => {
            let representative = select_representative(cohort, ctx)?;
            let atlas = average_atlas(cohort.subject(representative.index), cohort, ctx)?;
            Ok(AtlasBuild {
                atlas,
                representative: Some(representative.index),
                group: None,
            })
        }
        AtlasStrategy::External => {
            let atlas = external.ok_or(SyncError::MissingExternalAtlas)?;
            external_atlas(atlas, cohort.dim())
        }
    }
}

/// Accepts a precomputed atlas for data of shape `dims` without loading any
/// atlas subjects.
pub fn external_atlas(
    atlas: ArrayView2<f64>,
    dims: (usize, usize),
) -> Result<AtlasBuild, SyncError> {
    ensure_shape("external atlas", dims, atlas.dim())?;
    Ok(AtlasBuild {
        atlas: atlas.to_owned(),
        representative: None,
        group: None,
    })
}
