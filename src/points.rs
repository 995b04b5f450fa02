//! Point sets: the sample locations of high-fidelity snapshots
//! and the vertices of the low-fidelity mesh.

use fixedbitset as fb;
use itertools::izip;
use nalgebra as na;
use std::path::Path;

use crate::table::{self, TableError};

/// Error in loading a point set.
#[derive(thiserror::Error, Debug)]
pub enum PointSetError {
    /// The file could not be read.
    #[error("Reading point set {path:?} failed")]
    Io {
        /// Path of the file.
        path: std::path::PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file could not be parsed as a numeric table.
    #[error("Invalid point data in {path:?}")]
    Table {
        /// Path of the file.
        path: std::path::PathBuf,
        /// Underlying parse error.
        #[source]
        source: TableError,
    },
    /// The table didn't have enough columns for the coordinates.
    #[error("Expected at least {expected} columns of point data, found {found}")]
    MissingColumns {
        /// Number of columns required.
        expected: usize,
        /// Number of columns present.
        found: usize,
    },
    /// The file contained no points.
    #[error("Point set contains no points")]
    Empty,
    /// The file was a Gmsh mesh that failed to load.
    #[error(transparent)]
    Gmsh(#[from] crate::gmsh::GmshError),
}

/// An ordered set of `DIM`-dimensional points.
///
/// Immutable once loaded; the position of a point in the set is its identity,
/// which is what [`CorrespondenceMap`][crate::CorrespondenceMap]s refer to.
#[derive(Clone, Debug, PartialEq)]
pub struct PointSet<const DIM: usize> {
    points: Vec<na::SVector<f64, DIM>>,
}

/// Type alias for the common case of a 3D point set.
pub type PointCloud = PointSet<3>;

/// An axis-aligned bounding box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox<const DIM: usize> {
    /// The minimum (bottom left in 2D) corner of the box.
    pub min: na::SVector<f64, DIM>,
    /// The maximum (top right in 2D) corner of the box.
    pub max: na::SVector<f64, DIM>,
}

impl<const DIM: usize> BoundingBox<DIM> {
    /// Create a box from its corners.
    #[inline]
    pub fn new(min: na::SVector<f64, DIM>, max: na::SVector<f64, DIM>) -> Self {
        Self { min, max }
    }

    /// Check whether a point is inside the box, boundary included.
    pub fn contains(&self, point: &na::SVector<f64, DIM>) -> bool {
        izip!(point.iter(), self.min.iter(), self.max.iter())
            .all(|(coord, min, max)| min <= coord && coord <= max)
    }
}

impl<const DIM: usize> PointSet<DIM> {
    /// Create a point set from a list of points.
    #[inline]
    pub fn new(points: Vec<na::SVector<f64, DIM>>) -> Self {
        Self { points }
    }

    /// Create a point set from a flat buffer of coordinates,
    /// `DIM` consecutive values per point.
    ///
    /// Trailing values that don't make up a full point are ignored.
    pub fn from_flat(coords: &[f64]) -> Self {
        let points = coords
            .chunks_exact(DIM)
            .map(na::SVector::<f64, DIM>::from_column_slice)
            .collect();
        Self { points }
    }

    /// Get the number of points.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Check whether the set has no points.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Get the points as a slice.
    #[inline]
    pub fn points(&self) -> &[na::SVector<f64, DIM>] {
        &self.points
    }

    /// Iterate over the points in order.
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, na::SVector<f64, DIM>> {
        self.points.iter()
    }

    /// Compute the axis-aligned bounding box of the points.
    ///
    /// For an empty set the box is inverted (min at `f64::MAX`, max at `f64::MIN`).
    pub fn bounds(&self) -> BoundingBox<DIM> {
        let mut bounds = BoundingBox {
            min: na::SVector::from_element(f64::MAX),
            max: na::SVector::from_element(f64::MIN),
        };

        for point in &self.points {
            for (coord, min, max) in izip!(
                point.as_slice(),
                bounds.min.data.as_mut_slice(),
                bounds.max.data.as_mut_slice()
            ) {
                if coord < min {
                    *min = *coord;
                }
                if coord > max {
                    *max = *coord;
                }
            }
        }

        bounds
    }

    /// Get the indices of the points inside a bounding box.
    pub fn mask(&self, region: &BoundingBox<DIM>) -> fb::FixedBitSet {
        let mut bits = fb::FixedBitSet::with_capacity(self.points.len());
        for (idx, point) in self.points.iter().enumerate() {
            if region.contains(point) {
                bits.insert(idx);
            }
        }
        bits
    }

    /// Create a new point set containing only the points whose indices are in `subset`,
    /// in their original order.
    pub fn select(&self, subset: &fb::FixedBitSet) -> Self {
        let points = subset
            .ones()
            .filter_map(|idx| self.points.get(idx).copied())
            .collect();
        Self { points }
    }
}

impl<const DIM: usize> std::ops::Index<usize> for PointSet<DIM> {
    type Output = na::SVector<f64, DIM>;

    fn index(&self, idx: usize) -> &Self::Output {
        &self.points[idx]
    }
}

impl PointCloud {
    /// Load a point cloud from a file.
    ///
    /// Supported formats, chosen by extension:
    /// - `.msh`: Gmsh 4.1 meshes, see [`gmsh::load_point_cloud`][crate::gmsh::load_point_cloud]
    /// - `.dat`: whitespace table with a leading index column, coordinates in columns 1..4
    /// - anything else (typically `.xy`): whitespace table with coordinates in columns 0..3
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PointSetError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| PointSetError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("msh") => {
                let (points, _groups) = crate::gmsh::load_point_cloud(&bytes)?;
                Ok(points)
            }
            ext => {
                let text = String::from_utf8_lossy(&bytes);
                let table = table::parse(&text).map_err(|source| PointSetError::Table {
                    path: path.to_path_buf(),
                    source,
                })?;
                let first_column = if ext == Some("dat") { 1 } else { 0 };
                Self::from_table(&table, first_column)
            }
        }
    }

    /// Build a point cloud from three consecutive columns of a table.
    pub(crate) fn from_table(
        table: &table::Table,
        first_column: usize,
    ) -> Result<Self, PointSetError> {
        if table.rows() == 0 {
            return Err(PointSetError::Empty);
        }
        if table.columns < first_column + 3 {
            return Err(PointSetError::MissingColumns {
                expected: first_column + 3,
                found: table.columns,
            });
        }

        let points = (0..table.rows())
            .map(|row| {
                let row = table.row(row);
                na::Vector3::new(
                    row[first_column],
                    row[first_column + 1],
                    row[first_column + 2],
                )
            })
            .collect();
        Ok(Self { points })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).expect("failed to create file");
        file.write_all(contents.as_bytes()).expect("failed to write");
        (dir, path)
    }

    #[test]
    fn load_xy_and_dat() {
        let (_dir, xy) = write_temp("pointCloud.xy", "0 0 0\n1.5 2 3\n");
        let cloud = PointCloud::load(&xy).expect("failed to load .xy");
        assert_eq!(cloud.len(), 2);
        assert_eq!(cloud[1], na::Vector3::new(1.5, 2., 3.));

        let (_dir, dat) = write_temp("pointCloud.dat", "0 0 0 0\n1 1.5 2 3\n");
        let cloud_dat = PointCloud::load(&dat).expect("failed to load .dat");
        assert_eq!(cloud, cloud_dat);
    }

    #[test]
    fn load_errors() {
        let (_dir, short) = write_temp("short.xy", "1 2\n3 4\n");
        assert!(matches!(
            PointCloud::load(&short),
            Err(PointSetError::MissingColumns {
                expected: 3,
                found: 2
            })
        ));

        let (_dir, empty) = write_temp("empty.xy", "# nothing here\n");
        assert!(matches!(PointCloud::load(&empty), Err(PointSetError::Empty)));

        assert!(matches!(
            PointCloud::load("/definitely/not/here.xy"),
            Err(PointSetError::Io { .. })
        ));
    }

    #[test]
    fn bounds_and_masks() {
        let cloud = PointCloud::from_flat(&[0., 0., 0., 2., 1., 0., 1., 3., -1., 0.5, 0.5, 0.5]);
        let bounds = cloud.bounds();
        assert_eq!(bounds.min, na::Vector3::new(0., 0., -1.));
        assert_eq!(bounds.max, na::Vector3::new(2., 3., 0.5));

        let region = BoundingBox::new(na::Vector3::new(0., 0., 0.), na::Vector3::new(1., 1., 1.));
        let mask = cloud.mask(&region);
        itertools::assert_equal(mask.ones(), [0, 3]);

        let inside = cloud.select(&mask);
        assert_eq!(inside.len(), 2);
        assert_eq!(inside[1], na::Vector3::new(0.5, 0.5, 0.5));
    }
}
