//! Truncated modal (POD) bases: projection of fields onto modal coefficients
//! and reconstruction of fields from them.

use std::path::{Path, PathBuf};

use nalgebra as na;
use nalgebra_sparse as nas;

use crate::{FieldKind, FieldSpec, FlatIndexMap};

/// Singular values of the normal matrix below this fraction of the largest one
/// are treated as zero.
///
/// The normal matrix squares the singular values of the basis,
/// so this corresponds to a basis condition number of about `1e6`.
pub const RANK_TOLERANCE: f64 = 1e-12;

/// Error in loading a modal basis or spectrum from disk.
#[derive(thiserror::Error, Debug)]
pub enum BasisLoadError {
    /// The file could not be read.
    #[error("Reading basis data {path:?} failed")]
    Io {
        /// Path of the file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file didn't contain the expected number of values.
    #[error("Basis data {path:?} has {found} bytes, expected {expected}")]
    Size {
        /// Path of the file, empty if loaded from memory.
        path: PathBuf,
        /// Expected size in bytes.
        expected: usize,
        /// Actual size in bytes.
        found: usize,
    },
}

/// Error in projecting a field onto a basis or reconstructing it.
///
/// Every variant carries the name of the field so that the failing step
/// can be identified from the error alone.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ProjectionError {
    /// The field vector doesn't have one entry per basis row.
    #[error("field {field}: basis has {expected} rows but the field has {found} values")]
    Shape {
        /// Name of the field.
        field: String,
        /// Number of rows in the basis.
        expected: usize,
        /// Length of the field vector.
        found: usize,
    },
    /// The coefficient vector doesn't have one entry per mode.
    #[error("field {field}: basis has {expected} modes but {found} coefficients were given")]
    CoefficientCount {
        /// Name of the field.
        field: String,
        /// Number of modes in the basis.
        expected: usize,
        /// Length of the coefficient vector.
        found: usize,
    },
    /// There are fewer samples than modes, or no modes at all.
    #[error("field {field}: cannot fit {modes} modes to {samples} samples")]
    Underdetermined {
        /// Name of the field.
        field: String,
        /// Number of rows in the basis.
        samples: usize,
        /// Number of modes in the basis.
        modes: usize,
    },
    /// The field contains NaN or infinite values.
    #[error("field {field}: non-finite values in the input")]
    NonFinite {
        /// Name of the field.
        field: String,
    },
    /// The basis columns are (numerically) linearly dependent.
    #[error("field {field}: basis has numerical rank {rank} but {modes} modes")]
    RankDeficient {
        /// Name of the field.
        field: String,
        /// Numerical rank of the normal matrix.
        rank: usize,
        /// Number of modes in the basis.
        modes: usize,
    },
    /// The linear solve itself failed.
    #[error("field {field}: least-squares solve failed: {reason}")]
    Solve {
        /// Name of the field.
        field: String,
        /// Reason reported by the solver.
        reason: String,
    },
    /// A correspondence index points outside the basis.
    #[error("field {field}: restriction index {index} out of range for {len} basis rows")]
    Restriction {
        /// Name of the field.
        field: String,
        /// The offending index.
        index: usize,
        /// Number of rows in the basis.
        len: usize,
    },
}

/// A modal basis for one field: a matrix with one row per
/// (point, component) sample and one column per mode.
#[derive(Clone, Debug, PartialEq)]
pub struct ModalBasis {
    field: String,
    kind: FieldKind,
    modes: na::DMatrix<f64>,
}

impl ModalBasis {
    /// Create a basis from a matrix of modes stored as columns.
    pub fn new(field: impl Into<String>, kind: FieldKind, modes: na::DMatrix<f64>) -> Self {
        Self {
            field: field.into(),
            kind,
            modes,
        }
    }

    /// Create a basis from the raw bytes of a mode file:
    /// `mode_count` modes of `points * components` native-endian `f64`s each,
    /// stored one mode after another.
    pub fn from_mode_bytes(
        field: &FieldSpec,
        bytes: &[u8],
        mode_count: usize,
        points: usize,
    ) -> Result<Self, BasisLoadError> {
        let samples = points * field.kind.components();
        let expected = mode_count * samples * std::mem::size_of::<f64>();
        if bytes.len() != expected {
            return Err(BasisLoadError::Size {
                path: PathBuf::new(),
                expected,
                found: bytes.len(),
            });
        }

        // collect instead of cast to avoid alignment requirements on the byte buffer
        let values: Vec<f64> = bytemuck::pod_collect_to_vec(bytes);
        // mode-major storage is exactly column-major storage of the samples x modes matrix
        let modes = na::DMatrix::from_column_slice(samples, mode_count, &values);
        Ok(Self::new(field.name.clone(), field.kind, modes))
    }

    /// Load the basis of a field from `<dir>/modes.<field>/mode.bin`.
    ///
    /// See [`from_mode_bytes`][Self::from_mode_bytes] for the format.
    pub fn load(
        dir: impl AsRef<Path>,
        field: &FieldSpec,
        mode_count: usize,
        points: usize,
    ) -> Result<Self, BasisLoadError> {
        let path = dir
            .as_ref()
            .join(format!("modes.{}", field.name))
            .join("mode.bin");
        let bytes = std::fs::read(&path).map_err(|source| BasisLoadError::Io {
            path: path.clone(),
            source,
        })?;
        Self::from_mode_bytes(field, &bytes, mode_count, points).map_err(|err| match err {
            BasisLoadError::Size {
                expected, found, ..
            } => BasisLoadError::Size {
                path,
                expected,
                found,
            },
            other => other,
        })
    }

    /// Name of the field this basis represents.
    #[inline]
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Shape of the field this basis represents.
    #[inline]
    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    /// Number of rows, i.e. the length of a field vector.
    #[inline]
    pub fn samples(&self) -> usize {
        self.modes.nrows()
    }

    /// Number of modes, i.e. the length of a coefficient vector.
    #[inline]
    pub fn mode_count(&self) -> usize {
        self.modes.ncols()
    }

    /// The underlying matrix, one mode per column.
    #[inline]
    pub fn matrix(&self) -> &na::DMatrix<f64> {
        &self.modes
    }

    /// Restrict the basis to the rows selected by a flattened correspondence map.
    ///
    /// Rows of unmatched entries are left at zero,
    /// so they take no part in the fit and reconstruct to zero.
    /// The restriction is static and should be done once per session.
    pub fn restrict(&self, map: &FlatIndexMap) -> Result<Self, ProjectionError> {
        if map.source_len() != self.samples() {
            return Err(ProjectionError::Shape {
                field: self.field.clone(),
                expected: self.samples(),
                found: map.source_len(),
            });
        }
        if let Some(&index) = map.indices().iter().flatten().find(|&&i| i >= self.samples()) {
            return Err(ProjectionError::Restriction {
                field: self.field.clone(),
                index,
                len: self.samples(),
            });
        }

        let selection = restriction_operator(map);
        Ok(Self {
            field: self.field.clone(),
            kind: self.kind,
            modes: &selection * &self.modes,
        })
    }

    /// Compute the modal coefficients that best represent a field,
    /// minimizing `|field - basis * coefficients|` in the 2-norm.
    ///
    /// The problem is solved through the normal equations
    /// with an SVD-based solve rather than an explicit inverse.
    pub fn project(&self, values: &na::DVector<f64>) -> Result<na::DVector<f64>, ProjectionError> {
        if values.len() != self.samples() {
            return Err(ProjectionError::Shape {
                field: self.field.clone(),
                expected: self.samples(),
                found: values.len(),
            });
        }
        if self.mode_count() == 0 || self.samples() < self.mode_count() {
            return Err(ProjectionError::Underdetermined {
                field: self.field.clone(),
                samples: self.samples(),
                modes: self.mode_count(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(ProjectionError::NonFinite {
                field: self.field.clone(),
            });
        }

        let gram = self.modes.tr_mul(&self.modes);
        let rhs = self.modes.tr_mul(values);

        let svd = gram.svd(true, true);
        let largest = svd.singular_values.max();
        if !largest.is_finite() || largest <= 0. {
            return Err(ProjectionError::RankDeficient {
                field: self.field.clone(),
                rank: 0,
                modes: self.mode_count(),
            });
        }
        let eps = largest * RANK_TOLERANCE;
        let rank = svd.rank(eps);
        if rank < self.mode_count() {
            return Err(ProjectionError::RankDeficient {
                field: self.field.clone(),
                rank,
                modes: self.mode_count(),
            });
        }

        svd.solve(&rhs, eps)
            .map_err(|reason| ProjectionError::Solve {
                field: self.field.clone(),
                reason: reason.to_string(),
            })
    }

    /// Reconstruct a field from modal coefficients.
    ///
    /// This is an exact matrix-vector product;
    /// all approximation happens in [`project`][Self::project].
    pub fn reconstruct(
        &self,
        coefficients: &na::DVector<f64>,
    ) -> Result<na::DVector<f64>, ProjectionError> {
        if coefficients.len() != self.mode_count() {
            return Err(ProjectionError::CoefficientCount {
                field: self.field.clone(),
                expected: self.mode_count(),
                found: coefficients.len(),
            });
        }
        Ok(&self.modes * coefficients)
    }
}

/// Build the sparse operator that picks the rows of a full field
/// selected by a flattened correspondence map.
///
/// The operator has one row per map entry and one column per full field entry;
/// rows of unmatched entries are empty.
/// Indices are assumed to be in range of `map.source_len()`.
pub fn restriction_operator(map: &FlatIndexMap) -> nas::CsrMatrix<f64> {
    let mut op_matrix = nas::CooMatrix::new(map.len(), map.source_len());
    for (row, col) in map.indices().iter().enumerate() {
        if let Some(col) = col {
            op_matrix.push(row, *col, 1.);
        }
    }
    nas::CsrMatrix::from(&op_matrix)
}

/// Relative RMS error between the pointwise magnitudes of two fields,
/// `sqrt(mean((|pred| - |ref|)^2) / mean(|ref|^2))`.
///
/// For scalar fields the magnitude is the absolute value.
pub fn relative_error(
    reference: &na::DVector<f64>,
    prediction: &na::DVector<f64>,
    kind: FieldKind,
) -> f64 {
    let components = kind.components();
    let points = reference.len().min(prediction.len()) / components;
    let magnitude = |values: &na::DVector<f64>, point: usize| -> f64 {
        (0..components)
            .map(|comp| values[comp * points + point].powi(2))
            .sum::<f64>()
            .sqrt()
    };

    let mut err_sq = 0.;
    let mut ref_sq = 0.;
    for point in 0..points {
        let ref_mag = magnitude(reference, point);
        err_sq += (magnitude(prediction, point) - ref_mag).powi(2);
        ref_sq += ref_mag.powi(2);
    }

    if ref_sq == 0. {
        if err_sq == 0. {
            0.
        } else {
            f64::INFINITY
        }
    } else {
        (err_sq / ref_sq).sqrt()
    }
}

/// Eigenvalues of a POD decomposition, i.e. the energy captured by each mode.
///
/// Used to choose how many modes to keep
/// via the relative information content (RIC).
#[derive(Clone, Debug, PartialEq)]
pub struct EnergySpectrum {
    eigenvalues: Vec<f64>,
}

impl EnergySpectrum {
    /// Create a spectrum from eigenvalues in decreasing order.
    pub fn new(eigenvalues: Vec<f64>) -> Self {
        Self { eigenvalues }
    }

    /// Load a spectrum from a file of native-endian `f64`s.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BasisLoadError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| BasisLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let value_size = std::mem::size_of::<f64>();
        if bytes.len() % value_size != 0 {
            return Err(BasisLoadError::Size {
                path: path.to_path_buf(),
                expected: bytes.len() / value_size * value_size,
                found: bytes.len(),
            });
        }
        Ok(Self::new(bytemuck::pod_collect_to_vec(&bytes)))
    }

    /// Drop the first eigenvalue, which belongs to the mean (base) mode
    /// and shouldn't count towards the fluctuation energy.
    pub fn without_mean_mode(mut self) -> Self {
        if !self.eigenvalues.is_empty() {
            self.eigenvalues.remove(0);
        }
        self
    }

    /// The eigenvalues.
    #[inline]
    pub fn eigenvalues(&self) -> &[f64] {
        &self.eigenvalues
    }

    fn total(&self) -> f64 {
        self.eigenvalues.iter().sum()
    }

    /// Fraction of the total energy captured by the first `modes` modes.
    pub fn ric(&self, modes: usize) -> f64 {
        let captured: f64 = self.eigenvalues.iter().take(modes).sum();
        captured / self.total()
    }

    /// Smallest number of modes whose RIC exceeds `threshold`,
    /// or `None` if even the full spectrum doesn't.
    pub fn modes_for(&self, threshold: f64) -> Option<usize> {
        self.table()
            .into_iter()
            .find(|(_, ric)| *ric > threshold)
            .map(|(modes, _)| modes)
    }

    /// Cumulative RIC for every mode count from 1 to the spectrum length.
    pub fn table(&self) -> Vec<(usize, f64)> {
        let total = self.total();
        self.eigenvalues
            .iter()
            .scan(0., |acc, value| {
                *acc += value;
                Some(*acc / total)
            })
            .enumerate()
            .map(|(idx, ric)| (idx + 1, ric))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CorrespondenceMap;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    /// A random basis with orthogonal columns of varying lengths.
    fn random_basis(rng: &mut StdRng, samples: usize, modes: usize) -> ModalBasis {
        let raw = na::DMatrix::from_fn(samples, modes, |_, _| rng.gen_range(-1.0..1.0));
        let mut q = raw.qr().q();
        for (idx, mut col) in q.column_iter_mut().enumerate() {
            col *= 1. + idx as f64;
        }
        ModalBasis::new("U", FieldKind::Vector3, q)
    }

    fn random_vector(rng: &mut StdRng, len: usize) -> na::DVector<f64> {
        na::DVector::from_fn(len, |_, _| rng.gen_range(-1.0..1.0))
    }

    #[test]
    fn fields_in_span_round_trip() {
        let mut rng = StdRng::seed_from_u64(42);
        for (samples, modes) in [(30, 6), (12, 12), (90, 1)] {
            let basis = random_basis(&mut rng, samples, modes);
            let coefs = random_vector(&mut rng, modes);
            let field = basis.reconstruct(&coefs).expect("reconstruction failed");

            let projected = basis.project(&field).expect("projection failed");
            assert_relative_eq!(projected, coefs, epsilon = 1e-9);
            let rebuilt = basis.reconstruct(&projected).expect("reconstruction failed");
            assert_relative_eq!(rebuilt, field, epsilon = 1e-9);
        }
    }

    #[test]
    fn projection_is_least_squares_optimal() {
        let mut rng = StdRng::seed_from_u64(7);
        let basis = random_basis(&mut rng, 40, 5);
        let field = random_vector(&mut rng, 40);

        let coefs = basis.project(&field).expect("projection failed");
        let residual = &field - basis.matrix() * &coefs;
        // residual of the least-squares solution is orthogonal to the basis
        let normal = basis.matrix().tr_mul(&residual);
        assert!(normal.amax() < 1e-10, "residual not orthogonal: {normal}");

        for _ in 0..20 {
            let perturbed = &coefs + 1e-3 * random_vector(&mut rng, 5);
            let other = &field - basis.matrix() * &perturbed;
            assert!(other.norm() >= residual.norm());
        }
    }

    #[test]
    fn degenerate_bases_fail() {
        let mut rng = StdRng::seed_from_u64(3);
        let good = random_basis(&mut rng, 10, 2);
        let col = good.matrix().column(0).into_owned();
        let duplicated = ModalBasis::new(
            "p",
            FieldKind::Scalar,
            na::DMatrix::from_columns(&[col.clone(), col]),
        );
        let field = random_vector(&mut rng, 10);
        assert!(matches!(
            duplicated.project(&field),
            Err(ProjectionError::RankDeficient { ref field, rank: 1, modes: 2 }) if field == "p"
        ));

        assert_eq!(
            good.project(&random_vector(&mut rng, 9)),
            Err(ProjectionError::Shape {
                field: "U".into(),
                expected: 10,
                found: 9
            })
        );

        let mut nan_field = field.clone();
        nan_field[4] = f64::NAN;
        assert!(matches!(
            good.project(&nan_field),
            Err(ProjectionError::NonFinite { .. })
        ));

        let zero = ModalBasis::new("k", FieldKind::Scalar, na::DMatrix::zeros(10, 2));
        assert!(matches!(
            zero.project(&field),
            Err(ProjectionError::RankDeficient { rank: 0, .. })
        ));

        assert!(matches!(
            good.reconstruct(&random_vector(&mut rng, 3)),
            Err(ProjectionError::CoefficientCount { expected: 2, found: 3, .. })
        ));
    }

    #[test]
    fn mode_file_layout() {
        let field = FieldSpec::new("p", FieldKind::Scalar);
        let values = [1., 2., 3., 4., 5., 6.];
        let bytes: &[u8] = bytemuck::cast_slice(&values);

        let basis = ModalBasis::from_mode_bytes(&field, bytes, 2, 3).expect("failed to load");
        assert_eq!(basis.samples(), 3);
        assert_eq!(basis.mode_count(), 2);
        assert_eq!(basis.matrix().column(0), na::DVector::from_vec(vec![1., 2., 3.]));
        assert_eq!(basis.matrix().column(1), na::DVector::from_vec(vec![4., 5., 6.]));

        assert!(matches!(
            ModalBasis::from_mode_bytes(&field, &bytes[..40], 2, 3),
            Err(BasisLoadError::Size {
                expected: 48,
                found: 40,
                ..
            })
        ));
    }

    #[test]
    fn load_from_directory() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let field = FieldSpec::new("U", FieldKind::Vector3);
        let values: Vec<f64> = (0..12).map(f64::from).collect();
        std::fs::create_dir_all(dir.path().join("modes.U")).unwrap();
        std::fs::write(
            dir.path().join("modes.U").join("mode.bin"),
            bytemuck::cast_slice::<f64, u8>(&values),
        )
        .unwrap();

        let basis = ModalBasis::load(dir.path(), &field, 2, 2).expect("failed to load");
        assert_eq!(basis.samples(), 6);
        assert_eq!(basis.matrix()[(0, 1)], 6.);

        assert!(matches!(
            ModalBasis::load(dir.path(), &field, 3, 2),
            Err(BasisLoadError::Size { ref path, .. }) if path.ends_with("mode.bin")
        ));
        assert!(matches!(
            ModalBasis::load(dir.path(), &FieldSpec::new("p", FieldKind::Scalar), 2, 2),
            Err(BasisLoadError::Io { .. })
        ));
    }

    #[test]
    fn restriction_selects_component_blocks() {
        // 4 mesh points, 3 components, 2 modes; entry (i, j) = 10 * i + j
        let full = ModalBasis::new(
            "U",
            FieldKind::Vector3,
            na::DMatrix::from_fn(12, 2, |i, j| (10 * i + j) as f64),
        );
        let map = CorrespondenceMap::from_entries(vec![Some(2), None, Some(0)], 4);
        let restricted = full.restrict(&map.flattened(3)).expect("restriction failed");

        assert_eq!(restricted.samples(), 9);
        // first component block
        assert_eq!(restricted.matrix().row(0), full.matrix().row(2));
        assert_eq!(restricted.matrix().row(1).amax(), 0.);
        assert_eq!(restricted.matrix().row(2), full.matrix().row(0));
        // second component block is offset by the mesh size
        assert_eq!(restricted.matrix().row(3), full.matrix().row(6));
        assert_eq!(restricted.matrix().row(8), full.matrix().row(8));

        let wrong_mesh = CorrespondenceMap::from_entries(vec![Some(1)], 5);
        assert!(matches!(
            full.restrict(&wrong_mesh.flattened(3)),
            Err(ProjectionError::Shape { .. })
        ));
    }

    #[test]
    fn gaps_do_not_disturb_the_fit() {
        let mut rng = StdRng::seed_from_u64(11);
        let full = random_basis(&mut rng, 8, 2);
        let full = ModalBasis::new("p", FieldKind::Scalar, full.matrix().clone());
        let map = CorrespondenceMap::from_entries(
            vec![Some(0), Some(1), None, Some(3), Some(4), Some(5)],
            8,
        );
        let restricted = full.restrict(&map.flattened(1)).expect("restriction failed");

        let coefs = random_vector(&mut rng, 2);
        let mut field = restricted.reconstruct(&coefs).expect("reconstruction failed");
        // garbage at the gap is ignored by the fit
        field[2] = 1e3;
        let projected = restricted.project(&field).expect("projection failed");
        assert_relative_eq!(projected, coefs, epsilon = 1e-9);
    }

    #[test]
    fn spectrum_ric() {
        let spectrum = EnergySpectrum::new(vec![10., 4., 3., 2., 1.]).without_mean_mode();
        assert_eq!(spectrum.eigenvalues(), &[4., 3., 2., 1.]);
        assert_relative_eq!(spectrum.ric(2), 0.7);
        assert_eq!(spectrum.modes_for(0.65), Some(2));
        assert_eq!(spectrum.modes_for(0.95), Some(4));
        assert_eq!(spectrum.modes_for(1.0), None);

        let table = spectrum.table();
        assert_eq!(table.len(), 4);
        assert_eq!(table[0].0, 1);
        assert_relative_eq!(table[3].1, 1.0);
    }

    #[test]
    fn relative_errors() {
        let reference = na::DVector::from_vec(vec![3., 0., 4., 0.]);
        assert_eq!(relative_error(&reference, &reference, FieldKind::Vector3), 0.);

        let prediction = na::DVector::from_vec(vec![3., 0., 4., 1.]);
        let err = relative_error(&reference, &prediction, FieldKind::Scalar);
        assert_relative_eq!(err, (1.0f64 / 25.).sqrt());
    }
}
