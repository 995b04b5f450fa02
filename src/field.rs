//! Physical fields: their shape, memory layout and the snapshot files they come from.
//!
//! Field buffers are flat and component-major:
//! for a vector field on `n` points, entries `0..n` are the x-components,
//! `n..2n` the y-components and `2n..3n` the z-components.
//! This is the layout of the modal basis on disk,
//! so every buffer is converted to it as soon as it's read.

use std::path::{Path, PathBuf};

use nalgebra as na;
use serde::{Deserialize, Serialize};

use crate::table::{self, TableError};
use crate::PointCloud;

/// The tensor rank of a field, carrying its component count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    /// One component per point.
    #[serde(rename = "scalar")]
    Scalar,
    /// Three components per point.
    #[serde(rename = "vector")]
    Vector3,
    /// Six components per point (a symmetric 3x3 tensor).
    #[serde(rename = "tensor")]
    Tensor6,
}

impl FieldKind {
    /// Number of scalar components per point.
    #[inline]
    pub const fn components(self) -> usize {
        match self {
            FieldKind::Scalar => 1,
            FieldKind::Vector3 => 3,
            FieldKind::Tensor6 => 6,
        }
    }

    /// Guess the kind of a field from its conventional (OpenFOAM) name.
    pub fn infer(name: &str) -> Option<Self> {
        match name {
            "p" | "p_rgh" | "T" | "Tprime" | "k" | "kSGS" | "kSGSmean" | "kappat" | "nuSgs"
            | "nuSGSmean" | "nut" | "omega" => Some(FieldKind::Scalar),
            "U" | "Uprime" => Some(FieldKind::Vector3),
            "Rmean" => Some(FieldKind::Tensor6),
            _ => None,
        }
    }
}

/// A field taking part in a coupled run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldSpec {
    /// Name of the field, used for file lookups.
    pub name: String,
    /// Shape of the field.
    pub kind: FieldKind,
    /// Name of the transport data channel the field's predictions are written to,
    /// if any. Fields without a channel are still projected and archived.
    pub channel: Option<String>,
}

impl FieldSpec {
    /// Create a field spec with no transport channel.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            channel: None,
        }
    }

    /// Set the transport channel of the field.
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }
}

/// Render a time value the way time directories are named,
/// i.e. like C's `%.12g`: 12 significant digits, trailing zeros removed.
pub fn time_label(time: f64) -> String {
    const SIGNIFICANT: i32 = 12;

    if time == 0.0 {
        return "0".to_string();
    }
    if !time.is_finite() {
        return format!("{}", time);
    }

    // round to the significant digits first;
    // the exponent may change in the process (e.g. 9.99...9 -> 10)
    let sci = format!("{:.*e}", (SIGNIFICANT - 1) as usize, time);
    let (mantissa, exponent) = sci.split_once('e').unwrap_or((&sci, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= SIGNIFICANT {
        let sign = if exponent < 0 { '-' } else { '+' };
        return format!(
            "{}e{}{:02}",
            trim_fraction(mantissa),
            sign,
            exponent.abs()
        );
    }

    let decimals = (SIGNIFICANT - 1 - exponent).max(0) as usize;
    trim_fraction(&format!("{:.*}", decimals, time)).to_string()
}

fn trim_fraction(number: &str) -> &str {
    if number.contains('.') {
        number.trim_end_matches('0').trim_end_matches('.')
    } else {
        number
    }
}

/// Convert a component-major buffer into a point-interleaved one
/// (`x0 y0 z0 x1 y1 z1 ...`), the layout of transport vector data.
pub fn interleave(values: &[f64], components: usize) -> Vec<f64> {
    let points = values.len() / components.max(1);
    let mut out = Vec::with_capacity(values.len());
    for point in 0..points {
        for comp in 0..components {
            out.push(values[comp * points + point]);
        }
    }
    out
}

/// Convert a point-interleaved buffer into a component-major one.
pub fn deinterleave(values: &[f64], components: usize) -> Vec<f64> {
    let points = values.len() / components.max(1);
    let mut out = vec![0.; points * components];
    for (idx, value) in values.iter().take(points * components).enumerate() {
        let (point, comp) = (idx / components, idx % components);
        out[comp * points + point] = *value;
    }
    out
}

//
// snapshot files
//

/// Error in reading a field snapshot.
#[derive(thiserror::Error, Debug)]
pub enum SnapshotReadError {
    /// The snapshot file could not be read.
    #[error("Reading snapshot {path:?} failed")]
    Io {
        /// Path of the file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The snapshot file could not be parsed.
    #[error("Invalid snapshot data in {path:?}")]
    Table {
        /// Path of the file.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: TableError,
    },
    /// The snapshot had the wrong number of rows or columns for the field.
    #[error(
        "Snapshot {path:?} has {rows} rows of {columns} columns, \
        expected {expected_rows} rows of {components} (or {components} + 3) columns"
    )]
    Shape {
        /// Path of the file.
        path: PathBuf,
        /// Number of points expected.
        expected_rows: usize,
        /// Number of components of the field.
        components: usize,
        /// Rows found in the file.
        rows: usize,
        /// Columns found in the file.
        columns: usize,
    },
    /// Coordinates were requested from a snapshot that doesn't store them.
    #[error("Snapshot {path:?} contains no coordinate columns")]
    NoCoordinates {
        /// Path of the file.
        path: PathBuf,
    },
}

/// Source of high-fidelity field snapshots, addressed by time and field.
pub trait SnapshotSource {
    /// Load a snapshot as a flat component-major buffer
    /// of `points * field.kind.components()` values.
    fn load(
        &self,
        time: f64,
        field: &FieldSpec,
        points: usize,
    ) -> Result<na::DVector<f64>, SnapshotReadError>;
}

/// Destination for derived snapshots, in the same addressing as [`SnapshotSource`].
pub trait SnapshotSink {
    /// Store a flat component-major buffer as the snapshot of `field` at `time`.
    fn store(&self, time: f64, field: &FieldSpec, values: &na::DVector<f64>)
        -> std::io::Result<()>;
}

/// Snapshots stored as point-cloud text files,
/// `<root>/<time label>/cloud_<field>.xy`.
///
/// Each file has one row per point,
/// containing either just the field components
/// or three coordinates followed by the field components.
#[derive(Clone, Debug)]
pub struct CloudSnapshots {
    root: PathBuf,
}

impl CloudSnapshots {
    /// Create a snapshot store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory containing the time directories.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the snapshot file of a field at a time.
    pub fn path(&self, time: f64, field: &str) -> PathBuf {
        self.root
            .join(time_label(time))
            .join(format!("cloud_{}.xy", field))
    }

    fn read_table(&self, path: &Path) -> Result<table::Table, SnapshotReadError> {
        let text = std::fs::read_to_string(path).map_err(|source| SnapshotReadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        table::parse(&text).map_err(|source| SnapshotReadError::Table {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read the sample coordinates stored in a snapshot file.
    ///
    /// Used to obtain the query point set when it isn't given separately.
    pub fn load_points(&self, time: f64, field: &FieldSpec) -> Result<PointCloud, SnapshotReadError> {
        let path = self.path(time, &field.name);
        let table = self.read_table(&path)?;
        if table.columns != field.kind.components() + 3 {
            return Err(SnapshotReadError::NoCoordinates { path });
        }
        PointCloud::from_table(&table, 0).map_err(|_| SnapshotReadError::NoCoordinates { path })
    }
}

impl SnapshotSource for CloudSnapshots {
    fn load(
        &self,
        time: f64,
        field: &FieldSpec,
        points: usize,
    ) -> Result<na::DVector<f64>, SnapshotReadError> {
        let path = self.path(time, &field.name);
        let table = self.read_table(&path)?;

        let components = field.kind.components();
        let first_column = match table.columns {
            cols if cols == components => Some(0),
            cols if cols == components + 3 => Some(3),
            _ => None,
        };
        let Some(first_column) = first_column.filter(|_| table.rows() == points) else {
            return Err(SnapshotReadError::Shape {
                path,
                expected_rows: points,
                components,
                rows: table.rows(),
                columns: table.columns,
            });
        };

        let mut values = na::DVector::zeros(points * components);
        for point in 0..points {
            let row = &table.row(point)[first_column..];
            for (comp, value) in row.iter().enumerate() {
                values[comp * points + point] = *value;
            }
        }
        Ok(values)
    }
}

impl SnapshotSink for CloudSnapshots {
    fn store(
        &self,
        time: f64,
        field: &FieldSpec,
        values: &na::DVector<f64>,
    ) -> std::io::Result<()> {
        let path = self.path(time, &field.name);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let components = field.kind.components();
        let mut text = String::new();
        for row in interleave(values.as_slice(), components).chunks_exact(components) {
            let row: Vec<String> = row.iter().map(|v| format!("{}", v)).collect();
            text.push_str(&row.join("\t"));
            text.push('\n');
        }
        std::fs::write(path, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(FieldKind::infer("p"), Some(FieldKind::Scalar));
        assert_eq!(FieldKind::infer("omega"), Some(FieldKind::Scalar));
        assert_eq!(FieldKind::infer("U"), Some(FieldKind::Vector3));
        assert_eq!(FieldKind::infer("Rmean"), Some(FieldKind::Tensor6));
        assert_eq!(FieldKind::infer("mystery"), None);
        assert_eq!(FieldKind::Tensor6.components(), 6);
    }

    #[test]
    fn time_labels() {
        assert_eq!(time_label(100.), "100");
        assert_eq!(time_label(0.), "0");
        assert_eq!(time_label(100.01), "100.01");
        assert_eq!(time_label(100. + 1. * 0.001), "100.001");
        // accumulated float error disappears at 12 significant digits
        assert_eq!(time_label(0.1 + 0.2), "0.3");
        assert_eq!(time_label(-2.5), "-2.5");
        assert_eq!(time_label(1.5e-7), "1.5e-07");
        assert_eq!(time_label(2e13), "2e+13");
    }

    #[test]
    fn interleaving() {
        let component_major = [1., 2., 10., 20., 100., 200.];
        let interleaved = interleave(&component_major, 3);
        assert_eq!(interleaved, vec![1., 10., 100., 2., 20., 200.]);
        assert_eq!(deinterleave(&interleaved, 3), component_major.to_vec());
    }

    #[test]
    fn cloud_files() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let snapshots = CloudSnapshots::new(dir.path());
        let velocity = FieldSpec::new("U", FieldKind::Vector3);
        let pressure = FieldSpec::new("p", FieldKind::Scalar);

        let time_dir = dir.path().join("100.001");
        std::fs::create_dir_all(&time_dir).unwrap();
        std::fs::write(
            time_dir.join("cloud_U.xy"),
            "0 0 0\t1 2 3\n1 0 0\t4 5 6\n",
        )
        .unwrap();
        std::fs::write(time_dir.join("cloud_p.xy"), "7\n8\n").unwrap();

        let u = snapshots.load(100.001, &velocity, 2).expect("failed to load U");
        assert_eq!(u.as_slice(), &[1., 4., 2., 5., 3., 6.]);
        let p = snapshots.load(100.001, &pressure, 2).expect("failed to load p");
        assert_eq!(p.as_slice(), &[7., 8.]);

        let points = snapshots
            .load_points(100.001, &velocity)
            .expect("failed to load coordinates");
        assert_eq!(points[1], na::Vector3::new(1., 0., 0.));
        assert!(matches!(
            snapshots.load_points(100.001, &pressure),
            Err(SnapshotReadError::NoCoordinates { .. })
        ));

        assert!(matches!(
            snapshots.load(100.001, &pressure, 3),
            Err(SnapshotReadError::Shape { rows: 2, .. })
        ));
        // neither bare components nor coordinates plus components
        std::fs::write(time_dir.join("cloud_k.xy"), "1 2\n3 4\n").unwrap();
        assert!(matches!(
            snapshots.load(100.001, &FieldSpec::new("k", FieldKind::Scalar), 2),
            Err(SnapshotReadError::Shape { columns: 2, .. })
        ));
        assert!(matches!(
            snapshots.load(100.002, &pressure, 2),
            Err(SnapshotReadError::Io { .. })
        ));

        // written snapshots read back identically
        snapshots.store(100.5, &velocity, &u).expect("failed to store");
        let u_back = snapshots.load(100.5, &velocity, 2).expect("failed to reload");
        assert_eq!(u, u_back);
    }
}
