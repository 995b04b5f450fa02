//! Description of a coupled run, read from JSON.
//!
//! ```json
//! {
//!   "participant": "lf",
//!   "mesh": "lf-Mesh",
//!   "tStart": 100,
//!   "dt": 0.001,
//!   "modes": 6,
//!   "targetMesh": "../run.simulation_snapshots/system/sampling/pointCloud.xy",
//!   "snapshots": "../hf/postProcessing/internalField",
//!   "basis": "../pod/pod.np64_p-U_N6",
//!   "fields": [
//!     { "name": "p", "channel": "Pressure" },
//!     { "name": "U", "channel": "Velocity" },
//!     { "name": "k" }
//!   ],
//!   "readData": [{ "name": "PressureGradient" }]
//! }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{FieldKind, FieldSpec};

/// Error in reading or validating a [`CouplingConfig`].
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Reading config file {path:?} failed")]
    Io {
        /// Path of the file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The config was not valid JSON or didn't have the expected structure.
    #[error("Invalid config: {0}")]
    Json(#[from] serde_json::Error),
    /// The time step was not a positive finite number.
    #[error("Time step must be positive and finite, got {0}")]
    InvalidDt(f64),
    /// The start time was not finite.
    #[error("Start time must be finite, got {0}")]
    InvalidStart(f64),
    /// Zero modes were requested.
    #[error("At least one mode is required")]
    NoModes,
    /// No fields were given.
    #[error("At least one field is required")]
    NoFields,
    /// The same field was listed twice.
    #[error("Field {0} is listed more than once")]
    DuplicateField(String),
    /// A field had no explicit kind and its name isn't a known one.
    #[error("Cannot infer the kind of field {0}; give it explicitly")]
    UnknownKind(String),
    /// A tensor field was bound to a transport channel.
    #[error("Field {0} is a tensor and can't be exchanged through the transport")]
    TensorChannel(String),
}

/// A field as listed in the config.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FieldConfig {
    /// Name of the field.
    pub name: String,
    /// Kind of the field; inferred from the name if not given.
    #[serde(default)]
    pub kind: Option<FieldKind>,
    /// Transport data channel to write predictions to.
    #[serde(default)]
    pub channel: Option<String>,
}

/// A transport data channel the surrogate reads from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReadChannel {
    /// Name of the data channel.
    pub name: String,
    /// Whether the data is a 3-vector per vertex rather than a scalar.
    #[serde(default)]
    pub vector: bool,
}

/// Everything needed to set up and run a coupled session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CouplingConfig {
    /// Name of this participant in the coupling.
    #[serde(default = "default_participant")]
    pub participant: String,
    /// Name of the coupling mesh this participant defines.
    #[serde(default = "default_mesh")]
    pub mesh: String,
    /// Coupling time of the first exchange.
    pub t_start: f64,
    /// Proposed time step.
    pub dt: f64,
    /// Number of modes of every basis.
    pub modes: usize,
    /// Decimal places points are rounded to before matching.
    #[serde(default = "default_precision")]
    pub precision: u32,
    /// Whether query points without a counterpart in the target mesh are tolerated.
    #[serde(default)]
    pub allow_unmatched: bool,
    /// Point cloud of the full low-fidelity mesh the bases are defined on.
    pub target_mesh: PathBuf,
    /// Point cloud of the coupling interface.
    /// If not given, it's read from the coordinates of the first snapshot.
    #[serde(default)]
    pub query_points: Option<PathBuf>,
    /// Root of the snapshot time directories.
    pub snapshots: PathBuf,
    /// Directory containing the `modes.<field>` basis directories.
    pub basis: PathBuf,
    /// Root of the coefficient archive.
    #[serde(default = "default_archive")]
    pub archive: PathBuf,
    /// The coupled fields.
    pub fields: Vec<FieldConfig>,
    /// Data channels read from the transport.
    #[serde(default)]
    pub read_data: Vec<ReadChannel>,
}

fn default_participant() -> String {
    "lf".to_string()
}

fn default_mesh() -> String {
    "lf-Mesh".to_string()
}

fn default_precision() -> u32 {
    2
}

fn default_archive() -> PathBuf {
    PathBuf::from("chronos")
}

impl CouplingConfig {
    /// Parse and validate a config from a JSON string.
    ///
    /// Relative paths are kept as they are.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config file.
    ///
    /// Relative paths in the file are resolved against the file's directory.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_json_str(&text)?;
        if let Some(dir) = path.parent() {
            config.resolve_paths(dir);
        }
        Ok(config)
    }

    /// Make every relative path in the config relative to `dir` instead.
    pub fn resolve_paths(&mut self, dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = dir.join(&*p);
            }
        };
        resolve(&mut self.target_mesh);
        if let Some(query) = &mut self.query_points {
            resolve(query);
        }
        resolve(&mut self.snapshots);
        resolve(&mut self.basis);
        resolve(&mut self.archive);
    }

    /// Check the config for values that would make a run meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.dt.is_finite() && self.dt > 0.) {
            return Err(ConfigError::InvalidDt(self.dt));
        }
        if !self.t_start.is_finite() {
            return Err(ConfigError::InvalidStart(self.t_start));
        }
        if self.modes == 0 {
            return Err(ConfigError::NoModes);
        }
        if self.fields.is_empty() {
            return Err(ConfigError::NoFields);
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(ConfigError::DuplicateField(field.name.clone()));
            }
        }
        self.field_specs().map(|_| ())
    }

    /// The fields with their kinds resolved.
    pub fn field_specs(&self) -> Result<Vec<FieldSpec>, ConfigError> {
        self.fields
            .iter()
            .map(|field| {
                let kind = field
                    .kind
                    .or_else(|| FieldKind::infer(&field.name))
                    .ok_or_else(|| ConfigError::UnknownKind(field.name.clone()))?;
                if kind == FieldKind::Tensor6 && field.channel.is_some() {
                    return Err(ConfigError::TensorChannel(field.name.clone()));
                }
                let spec = FieldSpec::new(field.name.clone(), kind);
                Ok(match &field.channel {
                    Some(channel) => spec.with_channel(channel.clone()),
                    None => spec,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "tStart": 100,
        "dt": 0.001,
        "modes": 6,
        "targetMesh": "mesh/pointCloud.xy",
        "snapshots": "/data/internalField",
        "basis": "pod",
        "fields": [
            { "name": "p", "channel": "Pressure" },
            { "name": "U", "channel": "Velocity" },
            { "name": "Rmean" },
            { "name": "custom", "kind": "vector" }
        ],
        "readData": [{ "name": "PressureGradient" }]
    }"#;

    #[test]
    fn defaults_and_kinds() {
        let config = CouplingConfig::from_json_str(MINIMAL).expect("invalid config");
        assert_eq!(config.participant, "lf");
        assert_eq!(config.mesh, "lf-Mesh");
        assert_eq!(config.precision, 2);
        assert!(!config.allow_unmatched);
        assert_eq!(config.archive, PathBuf::from("chronos"));
        assert_eq!(config.query_points, None);
        assert!(!config.read_data[0].vector);

        let fields = config.field_specs().unwrap();
        itertools::assert_equal(
            fields.iter().map(|f| f.kind),
            [
                FieldKind::Scalar,
                FieldKind::Vector3,
                FieldKind::Tensor6,
                FieldKind::Vector3,
            ],
        );
        assert_eq!(fields[1].channel.as_deref(), Some("Velocity"));
        assert_eq!(fields[2].channel, None);
    }

    #[test]
    fn invalid_configs() {
        let with = |from: &str, to: &str| CouplingConfig::from_json_str(&MINIMAL.replace(from, to));

        assert!(matches!(
            with("\"dt\": 0.001", "\"dt\": 0"),
            Err(ConfigError::InvalidDt(_))
        ));
        assert!(matches!(
            with("\"modes\": 6", "\"modes\": 0"),
            Err(ConfigError::NoModes)
        ));
        assert!(matches!(
            with("\"name\": \"custom\", \"kind\": \"vector\"", "\"name\": \"custom\""),
            Err(ConfigError::UnknownKind(name)) if name == "custom"
        ));
        assert!(matches!(
            with("{ \"name\": \"Rmean\" }", "{ \"name\": \"Rmean\", \"channel\": \"R\" }"),
            Err(ConfigError::TensorChannel(_))
        ));
        assert!(matches!(
            with("\"name\": \"Rmean\"", "\"name\": \"p\""),
            Err(ConfigError::DuplicateField(name)) if name == "p"
        ));
        assert!(matches!(
            with("\"modes\": 6", "\"nodes\": 6"),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn paths_resolve_against_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coupling.json");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = CouplingConfig::from_json_file(&path).expect("invalid config");
        assert_eq!(config.target_mesh, dir.path().join("mesh/pointCloud.xy"));
        assert_eq!(config.basis, dir.path().join("pod"));
        assert_eq!(config.archive, dir.path().join("chronos"));
        // absolute paths are left alone
        assert_eq!(config.snapshots, PathBuf::from("/data/internalField"));

        assert!(matches!(
            CouplingConfig::from_json_file(dir.path().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));
    }
}
