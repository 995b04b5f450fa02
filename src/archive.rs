//! Persistent record of the modal coefficients computed during a run.
//!
//! One record exists per (field, time) pair.
//! Records are written only for coupling steps the transport has accepted,
//! so an archive never contains coefficients of a rolled-back iteration.

use std::path::{Path, PathBuf};

use nalgebra as na;

use crate::{field::time_label, table, ModalBasis, TableError};

/// Error in storing or retrieving archived coefficients.
#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    /// A record file could not be read or written.
    #[error("Accessing coefficient record {path:?} failed")]
    Io {
        /// Path of the record.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A record file was malformed.
    #[error("Invalid coefficient record {path:?}")]
    Table {
        /// Path of the record.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: TableError,
    },
    /// No record exists for the requested field and time.
    #[error("No coefficients archived for field {field} at time {time}")]
    Missing {
        /// Name of the field.
        field: String,
        /// Requested time.
        time: f64,
    },
    /// Archived coefficients didn't fit the basis they were applied to.
    #[error(transparent)]
    Projection(#[from] crate::basis::ProjectionError),
}

/// Storage for modal coefficients keyed by field and time.
pub trait CoefficientArchive {
    /// Store the coefficients of `field` at `time`, replacing any existing record.
    fn store(
        &mut self,
        time: f64,
        field: &str,
        coefficients: &na::DVector<f64>,
    ) -> Result<(), ArchiveError>;

    /// Retrieve the coefficients of `field` at `time`.
    fn load(&self, time: f64, field: &str) -> Result<na::DVector<f64>, ArchiveError>;
}

/// Coefficients stored as text files, `<root>/<time label>/<field>`,
/// one coefficient per line.
///
/// Time directories are labeled the same way as snapshot directories,
/// so records of different times never collide.
#[derive(Clone, Debug)]
pub struct ChronosArchive {
    root: PathBuf,
}

impl ChronosArchive {
    /// Create an archive rooted at the given directory.
    /// The directory is created lazily on the first store.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory containing the time directories.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the record of a field at a time.
    pub fn path(&self, time: f64, field: &str) -> PathBuf {
        self.root.join(time_label(time)).join(field)
    }
}

impl CoefficientArchive for ChronosArchive {
    fn store(
        &mut self,
        time: f64,
        field: &str,
        coefficients: &na::DVector<f64>,
    ) -> Result<(), ArchiveError> {
        let path = self.path(time, field);
        let io_err = |source| ArchiveError::Io {
            path: path.clone(),
            source,
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(io_err)?;
        }

        let text: String = coefficients.iter().map(|c| format!("{}\n", c)).collect();
        std::fs::write(&path, text).map_err(io_err)
    }

    fn load(&self, time: f64, field: &str) -> Result<na::DVector<f64>, ArchiveError> {
        let path = self.path(time, field);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArchiveError::Missing {
                    field: field.to_string(),
                    time,
                })
            }
            Err(source) => return Err(ArchiveError::Io { path, source }),
        };
        let table = table::parse(&text).map_err(|source| ArchiveError::Table {
            path: path.clone(),
            source,
        })?;
        Ok(na::DVector::from_vec(table.values))
    }
}

/// A single archived coefficient record.
#[derive(Clone, Debug, PartialEq)]
pub struct ArchiveRecord {
    /// Coupling time of the record.
    pub time: f64,
    /// Name of the field.
    pub field: String,
    /// The coefficients.
    pub coefficients: na::DVector<f64>,
}

/// An in-memory archive keeping records in the order they were stored.
#[derive(Clone, Debug, Default)]
pub struct MemoryArchive {
    records: Vec<ArchiveRecord>,
}

impl MemoryArchive {
    /// Create an empty archive.
    pub fn new() -> Self {
        Self::default()
    }

    /// All records in storage order.
    #[inline]
    pub fn records(&self) -> &[ArchiveRecord] {
        &self.records
    }

    /// Records of a single field in storage order.
    pub fn records_for<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a ArchiveRecord> {
        self.records.iter().filter(move |r| r.field == field)
    }

    /// Total number of records.
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check whether the archive is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl CoefficientArchive for MemoryArchive {
    fn store(
        &mut self,
        time: f64,
        field: &str,
        coefficients: &na::DVector<f64>,
    ) -> Result<(), ArchiveError> {
        match self
            .records
            .iter_mut()
            .find(|r| r.time == time && r.field == field)
        {
            Some(existing) => existing.coefficients = coefficients.clone(),
            None => self.records.push(ArchiveRecord {
                time,
                field: field.to_string(),
                coefficients: coefficients.clone(),
            }),
        }
        Ok(())
    }

    fn load(&self, time: f64, field: &str) -> Result<na::DVector<f64>, ArchiveError> {
        self.records
            .iter()
            .find(|r| r.time == time && r.field == field)
            .map(|r| r.coefficients.clone())
            .ok_or_else(|| ArchiveError::Missing {
                field: field.to_string(),
                time,
            })
    }
}

/// Rebuild a full field from the coefficients archived for it at `time`.
pub fn reconstruct_archived(
    basis: &ModalBasis,
    archive: &dyn CoefficientArchive,
    time: f64,
) -> Result<na::DVector<f64>, ArchiveError> {
    let coefficients = archive.load(time, basis.field())?;
    Ok(basis.reconstruct(&coefficients)?)
}
