//! A reduced-order surrogate participant for partitioned co-simulation.
//!
//! The surrogate represents each physical field as a handful of modal coefficients
//! times a precomputed (POD) basis. During a coupled run it
//! reads high-fidelity snapshots at the coupling interface,
//! projects them onto the basis, reconstructs the predicted interface values
//! and exchanges them with the partner solver through a [`Transport`].
//!
//! The pieces, roughly in the order a session uses them:
//!
//! - [`points`] and [`gmsh`]: point clouds of the sample set and the low-fidelity mesh.
//! - [`correspondence`]: index mapping between two independently generated point sets.
//! - [`basis`]: least-squares projection onto a truncated modal basis and reconstruction.
//! - [`parallel`] and [`partition`]: rank-based splitting of time samples
//!   and reproducible collective reductions.
//! - [`forcing`]: removal of a time-mean inflow profile from snapshot series,
//!   an embarrassingly parallel preprocessing step built on the partitioner.
//! - [`coupling`]: the coupling state machine with implicit-iteration checkpointing.

#![warn(missing_docs)]

pub mod points;
#[doc(inline)]
pub use points::{BoundingBox, PointCloud, PointSet};

pub mod gmsh;

pub mod correspondence;
#[doc(inline)]
pub use correspondence::{resolve, CorrespondenceMap, FlatIndexMap};

pub mod field;
#[doc(inline)]
pub use field::{FieldKind, FieldSpec};

pub mod basis;
#[doc(inline)]
pub use basis::{EnergySpectrum, ModalBasis};

pub mod archive;
#[doc(inline)]
pub use archive::{ChronosArchive, CoefficientArchive, MemoryArchive};

pub mod parallel;
#[doc(inline)]
pub use parallel::{Communicator, LocalCluster, RuntimeContext, SingleProcess};
#[cfg(feature = "mpi")]
pub use parallel::MpiComm;

pub mod partition;
#[doc(inline)]
pub use partition::{aggregate, partition, scatter_partition, Aggregator};

pub mod forcing;

pub mod config;
#[doc(inline)]
pub use config::CouplingConfig;

pub mod coupling;
#[doc(inline)]
pub use coupling::{CouplingLoop, CouplingSetup, RunSummary, SessionParams, Transport};

pub(crate) mod table;
pub use table::TableError;

// nalgebra re-exports of common types for convenience

pub use nalgebra as na;
/// Type alias for a 3D `nalgebra` vector.
pub type Vec3 = na::Vector3<f64>;
/// Type alias for a dynamically sized `nalgebra` column vector,
/// used for field buffers and modal coefficients.
pub type DVec = na::DVector<f64>;
/// Type alias for a dynamically sized `nalgebra` matrix.
pub type DMat = na::DMatrix<f64>;
