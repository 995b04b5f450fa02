//! The coupled session: setup from a config, and the coupling loop
//! that exchanges modal predictions with the partner solver.
//!
//! A session runs through the phases of [`Phase`]:
//! the surrogate registers its interface mesh, optionally writes initial data,
//! and then iterates
//! `save checkpoint? -> exchange -> advance -> restore | converge`
//! until the transport reports the end of the coupling.
//! Coefficients are committed to the archive only once the transport
//! has accepted the step they were computed for,
//! so rejected iterations never leave records behind.

mod state;
#[doc(inline)]
pub use state::{CouplingSession, Phase, StagedField, StagedStep};

mod transport;
#[doc(inline)]
pub use transport::{
    Action, Call, DataId, ScriptedTransport, Transport, TransportError, VertexId, WriteRecord,
};

use nalgebra as na;
use tracing::{debug, info, warn};

use crate::{
    archive::ArchiveError,
    basis::{relative_error, BasisLoadError, ProjectionError},
    config::{ConfigError, ReadChannel},
    correspondence::CorrespondenceError,
    field::{interleave, CloudSnapshots, SnapshotReadError, SnapshotSource},
    points::PointSetError,
    resolve, CoefficientArchive, CorrespondenceMap, CouplingConfig, FieldKind, FieldSpec,
    ModalBasis, PointCloud, RuntimeContext,
};

/// Error that aborts a coupled session.
#[derive(thiserror::Error, Debug)]
pub enum CouplingError {
    /// The transport reported an error.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A snapshot could not be read.
    #[error(transparent)]
    Snapshot(#[from] SnapshotReadError),
    /// A field could not be projected or reconstructed.
    #[error(transparent)]
    Projection(#[from] ProjectionError),
    /// Coefficients could not be archived.
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    /// The session was driven through an illegal phase transition.
    #[error("Illegal coupling transition from {from:?} to {to:?}")]
    Protocol {
        /// Phase the session was in.
        from: Phase,
        /// Phase that was requested.
        to: Phase,
    },
    /// The transport requested a checkpoint restore with no checkpoint saved.
    #[error("Checkpoint restore requested but no checkpoint was saved")]
    MissingCheckpoint,
}

/// Error in preparing a session, before any transport interaction.
#[derive(thiserror::Error, Debug)]
pub enum SetupError {
    /// The config was invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A point set could not be loaded.
    #[error(transparent)]
    Points(#[from] PointSetError),
    /// The snapshot providing the query points could not be read.
    #[error(transparent)]
    Snapshot(#[from] SnapshotReadError),
    /// A basis could not be loaded.
    #[error(transparent)]
    Basis(#[from] BasisLoadError),
    /// A basis could not be restricted to the interface.
    #[error(transparent)]
    Restriction(#[from] ProjectionError),
    /// A basis doesn't have one row per target mesh sample.
    #[error("Basis of {field} has {found} rows, expected {expected} for the target mesh")]
    BasisShape {
        /// Name of the field.
        field: String,
        /// Rows required by the target mesh.
        expected: usize,
        /// Rows in the basis.
        found: usize,
    },
    /// Some query points have no counterpart and gaps are not allowed.
    #[error("{count} interface point(s) not found in the target mesh, first: {first}")]
    Unmatched {
        /// Number of unmatched points.
        count: usize,
        /// The first unmatched point.
        first: CorrespondenceError,
    },
    /// A tensor field was bound to a transport channel.
    #[error("Field {0} is a tensor and can't be exchanged through the transport")]
    TensorChannel(String),
}

/// Parameters of the coupling loop itself.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionParams {
    /// Name of the interface mesh registered with the transport.
    pub mesh: String,
    /// Coupling time of the first exchange.
    pub t_start: f64,
    /// Proposed step size.
    pub dt: f64,
    /// Channels to read from the transport.
    pub read_data: Vec<ReadChannel>,
}

impl SessionParams {
    /// Parameters with no read channels.
    pub fn new(mesh: impl Into<String>, t_start: f64, dt: f64) -> Self {
        Self {
            mesh: mesh.into(),
            t_start,
            dt,
            read_data: Vec::new(),
        }
    }
}

impl From<&CouplingConfig> for SessionParams {
    fn from(config: &CouplingConfig) -> Self {
        Self {
            mesh: config.mesh.clone(),
            t_start: config.t_start,
            dt: config.dt,
            read_data: config.read_data.clone(),
        }
    }
}

/// A coupled field together with its basis restricted to the interface.
#[derive(Clone, Debug)]
pub struct FieldBinding {
    /// The field.
    pub spec: FieldSpec,
    /// Basis with one row per interface sample.
    pub basis: ModalBasis,
}

/// Everything a session needs that is computed once before the coupling starts.
#[derive(Clone, Debug)]
pub struct CouplingSetup {
    /// Loop parameters.
    pub params: SessionParams,
    /// The interface points.
    pub query: PointCloud,
    /// Mapping from interface points to target mesh points.
    pub correspondence: CorrespondenceMap,
    /// The coupled fields.
    pub fields: Vec<FieldBinding>,
}

impl CouplingSetup {
    /// Load the meshes and bases named in a config and prepare a session.
    ///
    /// Every input is read and checked here,
    /// so missing or malformed data aborts the run before the transport is touched.
    pub fn load(ctx: &RuntimeContext, config: &CouplingConfig) -> Result<Self, SetupError> {
        config.validate()?;
        let specs = config.field_specs()?;

        let target = PointCloud::load(&config.target_mesh)?;
        let query = match &config.query_points {
            Some(path) => PointCloud::load(path)?,
            None => {
                let snapshots = CloudSnapshots::new(&config.snapshots);
                // validation guarantees at least one field
                let first = specs.first().ok_or(ConfigError::NoFields)?;
                snapshots.load_points(config.t_start, first)?
            }
        };
        if ctx.is_coordinator() {
            info!(
                "Target mesh has {} points, interface has {}",
                target.len(),
                query.len()
            );
        }

        let bases = specs
            .into_iter()
            .map(|spec| {
                let basis = ModalBasis::load(&config.basis, &spec, config.modes, target.len())?;
                Ok((spec, basis))
            })
            .collect::<Result<Vec<_>, SetupError>>()?;

        Self::from_parts(
            SessionParams::from(config),
            query,
            &target,
            bases,
            config.precision,
            config.allow_unmatched,
        )
    }

    /// Prepare a session from already loaded data.
    ///
    /// `bases` are full bases on the target mesh;
    /// they are restricted to the interface here.
    pub fn from_parts(
        params: SessionParams,
        query: PointCloud,
        target: &PointCloud,
        bases: Vec<(FieldSpec, ModalBasis)>,
        precision: u32,
        allow_unmatched: bool,
    ) -> Result<Self, SetupError> {
        let correspondence = resolve(&query, target, precision);
        if let Some(first) = correspondence.gaps().first() {
            let count = correspondence.gaps().len();
            if !allow_unmatched {
                return Err(SetupError::Unmatched {
                    count,
                    first: first.clone(),
                });
            }
            warn!(
                "Continuing with {} unmatched interface point(s); their values are predicted as zero",
                count
            );
        }

        let fields = bases
            .into_iter()
            .map(|(spec, basis)| {
                let components = spec.kind.components();
                if spec.kind == FieldKind::Tensor6 && spec.channel.is_some() {
                    return Err(SetupError::TensorChannel(spec.name));
                }
                let expected = target.len() * components;
                if basis.samples() != expected {
                    return Err(SetupError::BasisShape {
                        field: spec.name,
                        expected,
                        found: basis.samples(),
                    });
                }
                let basis = basis.restrict(&correspondence.flattened(components))?;
                Ok(FieldBinding { spec, basis })
            })
            .collect::<Result<Vec<_>, SetupError>>()?;

        Ok(Self {
            params,
            query,
            correspondence,
            fields,
        })
    }
}

/// Outcome of a completed coupled session.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    /// Number of accepted steps.
    pub steps: usize,
    /// Number of `advance` calls, accepted or not.
    pub iterations: usize,
    /// Number of checkpoints saved.
    pub checkpoint_saves: usize,
    /// Number of checkpoints restored.
    pub checkpoint_restores: usize,
    /// Coupling time after the last accepted step.
    pub final_time: f64,
    /// Step size in effect at the end.
    pub last_dt: f64,
    /// Whether initial data was written.
    pub initial_data: bool,
    /// The last data read from each channel.
    pub reads: Vec<(String, Vec<f64>)>,
}

/// Drives one coupled session to completion.
pub struct CouplingLoop<'a> {
    setup: &'a CouplingSetup,
    source: &'a dyn SnapshotSource,
    transport: &'a mut dyn Transport,
    archive: &'a mut dyn CoefficientArchive,
}

struct Channels {
    vertices: Vec<VertexId>,
    writes: Vec<Option<DataId>>,
    reads: Vec<(String, bool, DataId)>,
}

impl<'a> CouplingLoop<'a> {
    /// Create a loop over a prepared setup.
    pub fn new(
        setup: &'a CouplingSetup,
        source: &'a dyn SnapshotSource,
        transport: &'a mut dyn Transport,
        archive: &'a mut dyn CoefficientArchive,
    ) -> Self {
        Self {
            setup,
            source,
            transport,
            archive,
        }
    }

    /// Run the session until the transport ends the coupling.
    ///
    /// Any error aborts the session immediately
    /// without finalizing the transport;
    /// a failed step is never retried.
    pub fn run(mut self) -> Result<RunSummary, CouplingError> {
        let params = &self.setup.params;
        let mut session = CouplingSession::new(params.t_start, params.dt);
        let channels = self.register()?;

        // the largest step the transport currently allows
        let mut transport_dt = self.transport.initialize()?;
        info!(
            "Coupling initialized at t = {}, dt = {} (transport allows {})",
            session.time(),
            session.dt(),
            transport_dt
        );
        self.read_available(&mut session, &channels)?;

        let mut initial_data = false;
        if self.transport.is_action_required(Action::WriteInitialData) {
            session.transition(Phase::WriteInitial)?;
            let step = self.compute_step(session.time())?;
            self.write_step(&step, &channels)?;
            session.stage(step);
            session.commit(&mut *self.archive)?;
            self.transport.mark_action_fulfilled(Action::WriteInitialData)?;
            initial_data = true;
            debug!("Wrote initial data at t = {}", session.time());
        }
        self.transport.initialize_data()?;

        let mut iterations = 0;
        while self.transport.is_coupling_ongoing() {
            if self.transport.is_action_required(Action::WriteIterationCheckpoint) {
                session.transition(Phase::CheckpointSave)?;
                session.save_checkpoint()?;
                self.transport.mark_action_fulfilled(Action::WriteIterationCheckpoint)?;
                debug!("Saved checkpoint at t = {}", session.time());
            }

            session.transition(Phase::Exchange)?;
            self.read_available(&mut session, &channels)?;
            if self.transport.is_write_data_required(transport_dt) {
                // all fields are computed before anything is written,
                // so a failing field leaves the transport untouched
                let step = self.compute_step(session.time())?;
                self.write_step(&step, &channels)?;
                session.stage(step);
            }

            session.transition(Phase::Advance)?;
            transport_dt = self.transport.advance(session.dt())?;
            iterations += 1;
            let dt = session.adopt_dt(transport_dt);

            if self.transport.is_action_required(Action::ReadIterationCheckpoint) {
                session.transition(Phase::CheckpointRestore)?;
                session.restore_checkpoint()?;
                self.transport.mark_action_fulfilled(Action::ReadIterationCheckpoint)?;
                debug!("Iteration rejected, restored t = {}", session.time());
            } else {
                session.transition(Phase::Converged)?;
                session.converge(&mut *self.archive)?;
                debug!("Step accepted, t = {} (dt = {})", session.time(), dt);
            }
        }

        session.transition(Phase::Finalized)?;
        self.transport.finalize()?;
        info!(
            "Coupling finalized at t = {} after {} steps ({} checkpoint restores)",
            session.time(),
            session.steps(),
            session.restores()
        );

        Ok(RunSummary {
            steps: session.steps(),
            iterations,
            checkpoint_saves: session.saves(),
            checkpoint_restores: session.restores(),
            final_time: session.time(),
            last_dt: session.dt(),
            initial_data,
            reads: session.read_buffers().to_vec(),
        })
    }

    /// Register the interface mesh and look up every data channel.
    fn register(&mut self) -> Result<Channels, CouplingError> {
        let setup = self.setup;
        let transport = &mut *self.transport;
        let mesh = &setup.params.mesh;
        let positions: Vec<f64> = setup
            .query
            .iter()
            .flat_map(|p| p.iter().copied())
            .collect();
        let vertices = transport.set_mesh_vertices(mesh, &positions)?;

        let mut writes = Vec::with_capacity(setup.fields.len());
        for binding in &setup.fields {
            let id = match &binding.spec.channel {
                Some(channel) => Some(transport.data_id(channel, mesh)?),
                None => None,
            };
            writes.push(id);
        }
        let mut reads = Vec::with_capacity(setup.params.read_data.len());
        for channel in &setup.params.read_data {
            let id = transport.data_id(&channel.name, mesh)?;
            reads.push((channel.name.clone(), channel.vector, id));
        }

        Ok(Channels {
            vertices,
            writes,
            reads,
        })
    }

    /// Read every channel if the transport has new data.
    fn read_available(
        &mut self,
        session: &mut CouplingSession,
        channels: &Channels,
    ) -> Result<(), CouplingError> {
        if !self.transport.is_read_data_available() {
            return Ok(());
        }
        for (name, vector, id) in &channels.reads {
            let values = if *vector {
                self.transport
                    .read_block_vector_data(*id, &channels.vertices)?
            } else {
                self.transport
                    .read_block_scalar_data(*id, &channels.vertices)?
            };
            session.store_read(name, values);
        }
        Ok(())
    }

    /// Project the snapshot of every field at `time` and reconstruct its prediction.
    fn compute_step(&self, time: f64) -> Result<StagedStep, CouplingError> {
        let points = self.setup.query.len();
        let fields = self
            .setup
            .fields
            .iter()
            .map(|binding| {
                let values = self.source.load(time, &binding.spec, points)?;
                let coefficients = binding.basis.project(&values)?;
                let prediction = binding.basis.reconstruct(&coefficients)?;
                debug!(
                    "{} at t = {}: relative projection error {:.3e}",
                    binding.spec.name,
                    time,
                    relative_error(&values, &prediction, binding.spec.kind)
                );
                Ok(StagedField {
                    field: binding.spec.name.clone(),
                    coefficients,
                    prediction,
                })
            })
            .collect::<Result<Vec<_>, CouplingError>>()?;
        Ok(StagedStep { time, fields })
    }

    /// Send the predictions of a step to the transport.
    fn write_step(&mut self, step: &StagedStep, channels: &Channels) -> Result<(), CouplingError> {
        let setup = self.setup;
        for ((binding, staged), id) in setup
            .fields
            .iter()
            .zip(&step.fields)
            .zip(&channels.writes)
        {
            let Some(id) = *id else {
                continue;
            };
            write_prediction(
                &mut *self.transport,
                id,
                &channels.vertices,
                binding.spec.kind,
                &staged.prediction,
            )?;
        }
        Ok(())
    }
}

fn write_prediction(
    transport: &mut dyn Transport,
    id: DataId,
    vertices: &[VertexId],
    kind: FieldKind,
    prediction: &na::DVector<f64>,
) -> Result<(), TransportError> {
    match kind {
        FieldKind::Scalar => transport.write_block_scalar_data(id, vertices, prediction.as_slice()),
        // tensor channels are rejected at setup
        FieldKind::Vector3 | FieldKind::Tensor6 => {
            let values = interleave(prediction.as_slice(), kind.components());
            transport.write_block_vector_data(id, vertices, &values)
        }
    }
}
