//! Removal of the time-mean inflow profile ("forcing field") from snapshot series.
//!
//! Snapshots of a boundary-layer flow are dominated by the mean vertical profile
//! imposed at the inflow. Subtracting it leaves the fluctuations,
//! which is what the modal basis is built from.
//! The points are grouped into vertical columns by their (x, y) position;
//! the profile is the mean over the columns inside the inflow region
//! and over all time samples, and it is subtracted from every column of every sample.
//!
//! Samples are split between ranks with [`scatter_partition`]
//! and the time mean is computed with an [`Aggregator`],
//! so the profile is the same on every rank and for every worker count.

use std::path::{Path, PathBuf};

use fixedbitset as fb;
use nalgebra as na;
use tracing::info;

use crate::{
    field::{SnapshotReadError, SnapshotSink, SnapshotSource},
    partition::{scatter_partition, Aggregator},
    table::{self, TableError},
    BoundingBox, FieldSpec, PointCloud, RuntimeContext,
};

/// Error in computing or removing a forcing field.
#[derive(thiserror::Error, Debug)]
pub enum ForcingError {
    /// A snapshot could not be read.
    #[error(transparent)]
    Snapshot(#[from] SnapshotReadError),
    /// A fluctuation snapshot could not be written.
    #[error("Writing the fluctuation of {field} at time {time} failed")]
    Write {
        /// Name of the field.
        field: String,
        /// Time of the snapshot.
        time: f64,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A profile file could not be read or written.
    #[error("Accessing profile file {path:?} failed")]
    Io {
        /// Path of the file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A profile file was malformed.
    #[error("Invalid profile file {path:?}")]
    Table {
        /// Path of the file.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: TableError,
    },
    /// No points lie inside the inflow region.
    #[error("No points inside the inflow region")]
    EmptyRegion,
    /// Columns of the point set have different numbers of points.
    #[error("Column at ({x}, {y}) has {found} points, expected {expected}")]
    RaggedColumns {
        /// x coordinate of the offending column.
        x: f64,
        /// y coordinate of the offending column.
        y: f64,
        /// Height of the first column.
        expected: usize,
        /// Height of the offending column.
        found: usize,
    },
    /// The profile doesn't fit the columns it's applied to.
    #[error("Profile has {profile_height} levels and {profile_components} components, columns have {column_height} levels and the field {components}")]
    ProfileShape {
        /// Number of levels in the profile.
        profile_height: usize,
        /// Number of components in the profile.
        profile_components: usize,
        /// Number of points per column.
        column_height: usize,
        /// Number of components of the field.
        components: usize,
    },
    /// There were no time samples to average over.
    #[error("No time samples given")]
    NoSamples,
    /// Another rank failed, so this one gave up before the next collective step.
    #[error("{0} other rank(s) failed")]
    PeerFailed(usize),
}

/// Points grouped into vertical columns by their (x, y) position.
///
/// Columns are ordered by (x, y) ascending;
/// the point indices within a column keep the order of the point set,
/// which for structured sampling grids is bottom to top.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnGrouping {
    columns: Vec<Vec<usize>>,
    positions: Vec<(f64, f64)>,
}

impl ColumnGrouping {
    /// Group all points of a set.
    pub fn new(points: &PointCloud) -> Self {
        Self::from_indices(points, 0..points.len())
    }

    /// Group only the points in `subset`.
    /// Column entries are still indices into the full set.
    pub fn of_subset(points: &PointCloud, subset: &fb::FixedBitSet) -> Self {
        Self::from_indices(points, subset.ones().filter(|&idx| idx < points.len()))
    }

    fn from_indices(points: &PointCloud, indices: impl Iterator<Item = usize>) -> Self {
        let mut sorted: Vec<usize> = indices.collect();
        // stable sort keeps point order within a column
        sorted.sort_by(|&a, &b| {
            let (pa, pb) = (points[a], points[b]);
            pa.x.total_cmp(&pb.x).then(pa.y.total_cmp(&pb.y))
        });

        let mut columns: Vec<Vec<usize>> = Vec::new();
        let mut positions: Vec<(f64, f64)> = Vec::new();
        for idx in sorted {
            let xy = (points[idx].x, points[idx].y);
            if positions.last() == Some(&xy) {
                if let Some(column) = columns.last_mut() {
                    column.push(idx);
                }
            } else {
                positions.push(xy);
                columns.push(vec![idx]);
            }
        }

        Self { columns, positions }
    }

    /// The columns, each a list of point indices.
    #[inline]
    pub fn columns(&self) -> &[Vec<usize>] {
        &self.columns
    }

    /// The (x, y) position of each column.
    #[inline]
    pub fn positions(&self) -> &[(f64, f64)] {
        &self.positions
    }

    /// Number of columns.
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check whether there are no columns.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// The common number of points per column.
    ///
    /// Fails if the columns have different heights.
    pub fn height(&self) -> Result<usize, ForcingError> {
        let Some(first) = self.columns.first() else {
            return Ok(0);
        };
        let expected = first.len();
        for (column, &(x, y)) in self.columns.iter().zip(&self.positions) {
            if column.len() != expected {
                return Err(ForcingError::RaggedColumns {
                    x,
                    y,
                    expected,
                    found: column.len(),
                });
            }
        }
        Ok(expected)
    }
}

/// A vertical profile of a field: one row per level, one column per component.
#[derive(Clone, Debug, PartialEq)]
pub struct MeanProfile {
    values: na::DMatrix<f64>,
}

impl MeanProfile {
    /// Create a profile from a (levels x components) matrix.
    pub fn new(values: na::DMatrix<f64>) -> Self {
        Self { values }
    }

    /// Mean over the given columns of one component-major field snapshot.
    pub fn column_mean(
        values: &na::DVector<f64>,
        points: usize,
        components: usize,
        columns: &ColumnGrouping,
    ) -> Result<Self, ForcingError> {
        let height = columns.height()?;
        let mut profile = na::DMatrix::zeros(height, components);
        for column in columns.columns() {
            for (level, &point) in column.iter().enumerate() {
                for comp in 0..components {
                    profile[(level, comp)] += values[comp * points + point];
                }
            }
        }
        if !columns.is_empty() {
            profile /= columns.len() as f64;
        }
        Ok(Self::new(profile))
    }

    /// The profile values, one row per level.
    #[inline]
    pub fn values(&self) -> &na::DMatrix<f64> {
        &self.values
    }

    /// Number of levels.
    #[inline]
    pub fn height(&self) -> usize {
        self.values.nrows()
    }

    /// Number of components.
    #[inline]
    pub fn components(&self) -> usize {
        self.values.ncols()
    }

    /// Subtract the profile from every column of a component-major field snapshot.
    pub fn remove_from(
        &self,
        values: &mut na::DVector<f64>,
        points: usize,
        columns: &ColumnGrouping,
    ) -> Result<(), ForcingError> {
        let height = columns.height()?;
        let components = values.len() / points.max(1);
        if height != self.height() || components != self.components() {
            return Err(ForcingError::ProfileShape {
                profile_height: self.height(),
                profile_components: self.components(),
                column_height: height,
                components,
            });
        }

        for column in columns.columns() {
            for (level, &point) in column.iter().enumerate() {
                for comp in 0..components {
                    values[comp * points + point] -= self.values[(level, comp)];
                }
            }
        }
        Ok(())
    }

    /// Write the profile as a tab-separated table, one level per line.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ForcingError> {
        let path = path.as_ref();
        let io_err = |source| ForcingError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(io_err)?;
        }

        let mut text = String::new();
        for row in self.values.row_iter() {
            let row: Vec<String> = row.iter().map(|v| format!("{}", v)).collect();
            text.push_str(&row.join("\t"));
            text.push('\n');
        }
        std::fs::write(path, text).map_err(io_err)
    }

    /// Read a profile written by [`save`][Self::save].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ForcingError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ForcingError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let table = table::parse(&text).map_err(|source| ForcingError::Table {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(na::DMatrix::from_row_slice(
            table.rows(),
            table.columns,
            &table.values,
        )))
    }
}

/// Time-mean profile over the inflow columns and all `times`,
/// with the samples split across the ranks of `ctx`.
///
/// This is a collective operation; every rank gets the same profile.
/// Returns the profile together with the snapshots this rank loaded,
/// keyed by their index in `times`.
fn mean_inflow_profile(
    ctx: &RuntimeContext,
    points: &PointCloud,
    inflow: &ColumnGrouping,
    field: &FieldSpec,
    times: &[f64],
    source: &dyn SnapshotSource,
) -> Result<(MeanProfile, Vec<(usize, na::DVector<f64>)>), ForcingError> {
    let components = field.kind.components();
    let height = inflow.height()?;
    let local = scatter_partition(ctx, times.len());

    let mut aggregator = Aggregator::new(height * components);
    let mut snapshots = Vec::with_capacity(local.len());
    let local_result = local.clone().try_for_each(|sample| {
        let values = source.load(times[sample], field, points.len())?;
        let profile = MeanProfile::column_mean(&values, points.len(), components, inflow)?;
        aggregator.push(sample, profile.values().as_slice());
        snapshots.push((sample, values));
        Ok::<(), ForcingError>(())
    });
    agree_on_failure(ctx, local_result)?;

    let sum = aggregator.all_reduce(ctx);
    let mean = na::DMatrix::from_column_slice(height, components, &sum) / times.len() as f64;
    Ok((MeanProfile::new(mean), snapshots))
}

/// Make every rank fail if any rank failed,
/// so that no rank enters a collective the others will never reach.
fn agree_on_failure(
    ctx: &RuntimeContext,
    local_result: Result<(), ForcingError>,
) -> Result<(), ForcingError> {
    let failed = ctx
        .comm()
        .all_reduce_sum(&[if local_result.is_err() { 1. } else { 0. }])[0] as usize;
    match local_result {
        Err(err) => Err(err),
        Ok(()) if failed > 0 => Err(ForcingError::PeerFailed(failed)),
        Ok(()) => Ok(()),
    }
}

fn subtract_and_store(
    points: &PointCloud,
    columns: &ColumnGrouping,
    profile: &MeanProfile,
    field: &FieldSpec,
    times: &[f64],
    snapshots: Vec<(usize, na::DVector<f64>)>,
    sink: &dyn SnapshotSink,
) -> Result<(), ForcingError> {
    for (sample, mut values) in snapshots {
        profile.remove_from(&mut values, points.len(), columns)?;
        let time = times[sample];
        sink.store(time, field, &values)
            .map_err(|source| ForcingError::Write {
                field: field.name.clone(),
                time,
                source,
            })?;
    }
    Ok(())
}

/// Compute the time-mean inflow profile of `field` over `times`,
/// subtract it from every snapshot and write the fluctuations to `sink`.
///
/// Each rank processes its own block of `times` and writes only those samples,
/// so the sink sees disjoint keys from different ranks.
/// Returns the profile, identical on every rank.
pub fn remove_forcing_field(
    ctx: &RuntimeContext,
    points: &PointCloud,
    inflow_region: &BoundingBox<3>,
    field: &FieldSpec,
    times: &[f64],
    source: &dyn SnapshotSource,
    sink: &dyn SnapshotSink,
) -> Result<MeanProfile, ForcingError> {
    if times.is_empty() {
        return Err(ForcingError::NoSamples);
    }

    let all_columns = ColumnGrouping::new(points);
    let inflow = ColumnGrouping::of_subset(points, &points.mask(inflow_region));
    if inflow.is_empty() {
        return Err(ForcingError::EmptyRegion);
    }
    let (inflow_height, full_height) = (inflow.height()?, all_columns.height()?);
    if inflow_height != full_height {
        return Err(ForcingError::ProfileShape {
            profile_height: inflow_height,
            profile_components: field.kind.components(),
            column_height: full_height,
            components: field.kind.components(),
        });
    }
    info!(
        "Removing forcing field of {}: {} inflow columns of {} levels, {} samples over {} ranks",
        field.name,
        inflow.len(),
        inflow_height,
        times.len(),
        ctx.size()
    );

    let (profile, snapshots) = mean_inflow_profile(ctx, points, &inflow, field, times, source)?;
    let local_result =
        subtract_and_store(points, &all_columns, &profile, field, times, snapshots, sink);
    agree_on_failure(ctx, local_result)?;
    Ok(profile)
}

/// Subtract a previously computed profile from every snapshot of `field` over `times`
/// and write the fluctuations to `sink`.
///
/// Used for prediction runs that reuse the profile of the training data.
pub fn remove_known_profile(
    ctx: &RuntimeContext,
    points: &PointCloud,
    profile: &MeanProfile,
    field: &FieldSpec,
    times: &[f64],
    source: &dyn SnapshotSource,
    sink: &dyn SnapshotSink,
) -> Result<(), ForcingError> {
    let all_columns = ColumnGrouping::new(points);
    let local = scatter_partition(ctx, times.len());

    let local_result = local
        .map(|sample| {
            source
                .load(times[sample], field, points.len())
                .map(|values| (sample, values))
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(ForcingError::from)
        .and_then(|snapshots| {
            subtract_and_store(points, &all_columns, profile, field, times, snapshots, sink)
        });
    agree_on_failure(ctx, local_result)
}
