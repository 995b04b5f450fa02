//! The interface to the co-simulation library, and a scripted stand-in for it.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

/// Identifier of a vertex registered with the transport.
pub type VertexId = i32;
/// Identifier of a data channel registered with the transport.
pub type DataId = i32;

/// Actions the transport can require of a participant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    /// Write data before the first exchange.
    WriteInitialData,
    /// Save the state so that the coming iteration can be repeated.
    WriteIterationCheckpoint,
    /// The last iteration didn't converge; restore the saved state.
    ReadIterationCheckpoint,
}

/// Error reported by a transport.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// No mesh of this name exists in the coupling setup.
    #[error("Unknown mesh {0}")]
    UnknownMesh(String),
    /// No data channel of this name exists on the mesh.
    #[error("Unknown data {data} on mesh {mesh}")]
    UnknownData {
        /// Name of the data channel.
        data: String,
        /// Name of the mesh.
        mesh: String,
    },
    /// A data id that was never handed out.
    #[error("Unknown data id {0}")]
    UnknownDataId(DataId),
    /// An action was marked fulfilled that wasn't required.
    #[error("Action {0:?} was not required")]
    ActionNotRequired(Action),
    /// A required action was not fulfilled before proceeding.
    #[error("Action {0:?} is required but was not fulfilled")]
    ActionPending(Action),
    /// A data buffer had the wrong size for the given vertices.
    #[error("Data {data} needs {expected} values for the given vertices, got {found}")]
    BufferSize {
        /// The data channel.
        data: DataId,
        /// Number of values required.
        expected: usize,
        /// Number of values given.
        found: usize,
    },
    /// A call that requires an initialized transport came first.
    #[error("Transport is not initialized")]
    NotInitialized,
    /// A call came after the coupling was finalized.
    #[error("Coupling is already finalized")]
    Finalized,
    /// Any other failure of the transport or its partner.
    #[error("Transport failure: {0}")]
    Failure(String),
}

/// A co-simulation transport, as seen from one participant.
///
/// This follows the preCICE participant API:
/// the participant registers its mesh and data channels,
/// initializes, and then repeatedly exchanges data and advances
/// while the transport reports that the coupling is ongoing,
/// fulfilling the checkpoint actions the transport requires along the way.
/// Vector data is interleaved per vertex (`x0 y0 z0 x1 y1 z1 ...`).
pub trait Transport {
    /// Spatial dimension of the coupling.
    fn dimensions(&self) -> usize {
        3
    }

    /// Register the vertices of a mesh, `dimensions()` coordinates per vertex.
    fn set_mesh_vertices(
        &mut self,
        mesh: &str,
        positions: &[f64],
    ) -> Result<Vec<VertexId>, TransportError>;

    /// Look up the id of a data channel on a mesh.
    fn data_id(&mut self, data: &str, mesh: &str) -> Result<DataId, TransportError>;

    /// Initialize the coupling, returning the maximum size of the first time step.
    fn initialize(&mut self) -> Result<f64, TransportError>;

    /// Exchange initial data, after any [`Action::WriteInitialData`] is fulfilled.
    fn initialize_data(&mut self) -> Result<(), TransportError>;

    /// Whether the coupled run continues.
    fn is_coupling_ongoing(&self) -> bool;

    /// Whether the transport requires `action` now.
    fn is_action_required(&self, action: Action) -> bool;

    /// Report that a required action has been performed.
    fn mark_action_fulfilled(&mut self, action: Action) -> Result<(), TransportError>;

    /// Whether new data is available to read.
    fn is_read_data_available(&self) -> bool;

    /// Whether data must be written before advancing by `dt`.
    fn is_write_data_required(&self, dt: f64) -> bool;

    /// Read one scalar per vertex.
    fn read_block_scalar_data(
        &mut self,
        data: DataId,
        vertices: &[VertexId],
    ) -> Result<Vec<f64>, TransportError>;

    /// Read one vector per vertex, interleaved.
    fn read_block_vector_data(
        &mut self,
        data: DataId,
        vertices: &[VertexId],
    ) -> Result<Vec<f64>, TransportError>;

    /// Write one scalar per vertex.
    fn write_block_scalar_data(
        &mut self,
        data: DataId,
        vertices: &[VertexId],
        values: &[f64],
    ) -> Result<(), TransportError>;

    /// Write one vector per vertex, interleaved.
    fn write_block_vector_data(
        &mut self,
        data: DataId,
        vertices: &[VertexId],
        values: &[f64],
    ) -> Result<(), TransportError>;

    /// Advance the coupling by `dt`,
    /// returning the maximum size of the next time step.
    ///
    /// The returned size may be smaller than `dt`,
    /// in which case the participant must continue with the smaller step.
    fn advance(&mut self, dt: f64) -> Result<f64, TransportError>;

    /// Finish the coupling and release its resources.
    fn finalize(&mut self) -> Result<(), TransportError>;
}

/// A call made to a [`ScriptedTransport`], in the order they happened.
#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    /// [`Transport::initialize`]
    Initialize,
    /// [`Transport::initialize_data`]
    InitializeData,
    /// [`Transport::mark_action_fulfilled`]
    Fulfill(Action),
    /// A read of the named channel.
    Read(String),
    /// A write to the named channel.
    Write(String),
    /// [`Transport::advance`] with the proposed and the returned step size.
    Advance {
        /// Step proposed by the participant.
        proposed: f64,
        /// Maximum step returned by the transport.
        returned: f64,
    },
    /// [`Transport::finalize`]
    Finalize,
}

/// A write made to a [`ScriptedTransport`].
#[derive(Clone, Debug, PartialEq)]
pub struct WriteRecord {
    /// Name of the data channel.
    pub data: String,
    /// Index of the time window the write happened in.
    pub window: usize,
    /// Index of the iteration within the window.
    pub iteration: usize,
    /// The written values.
    pub values: Vec<f64>,
}

/// An in-process coupling partner that follows a fixed script.
///
/// It emulates the participant-facing behavior of an explicit or implicit
/// coupling scheme: a fixed number of time windows,
/// a given number of rejected iterations per window,
/// optionally shrinking step sizes and an optional hard failure.
/// Every call is checked against the protocol and recorded,
/// which makes it useful for dry runs and for testing participants.
#[derive(Clone, Debug)]
pub struct ScriptedTransport {
    // script
    windows: usize,
    max_dt: f64,
    implicit: bool,
    rejections: Vec<usize>,
    dt_sequence: Vec<f64>,
    require_initial_data: bool,
    fail_at_advance: Option<usize>,
    read_values: HashMap<String, f64>,
    // state
    meshes: HashMap<String, usize>,
    channels: Vec<(String, String)>,
    initialized: bool,
    finalized: bool,
    window: usize,
    iteration: usize,
    pending: HashSet<Action>,
    advances: usize,
    // records
    calls: Vec<Call>,
    writes: Vec<WriteRecord>,
    write_queries: RefCell<Vec<f64>>,
    finalize_count: usize,
}

impl ScriptedTransport {
    /// An explicit coupling over `windows` time windows of at most `max_dt`.
    pub fn new(windows: usize, max_dt: f64) -> Self {
        Self {
            windows,
            max_dt,
            implicit: false,
            rejections: Vec::new(),
            dt_sequence: Vec::new(),
            require_initial_data: false,
            fail_at_advance: None,
            read_values: HashMap::new(),
            meshes: HashMap::new(),
            channels: Vec::new(),
            initialized: false,
            finalized: false,
            window: 0,
            iteration: 0,
            pending: HashSet::new(),
            advances: 0,
            calls: Vec::new(),
            writes: Vec::new(),
            write_queries: RefCell::new(Vec::new()),
            finalize_count: 0,
        }
    }

    /// Use an implicit scheme, requiring checkpoints.
    pub fn implicit(mut self) -> Self {
        self.implicit = true;
        self
    }

    /// Reject the first `times` iterations of `window` (implicit schemes only).
    pub fn reject(mut self, window: usize, times: usize) -> Self {
        if self.rejections.len() <= window {
            self.rejections.resize(window + 1, 0);
        }
        self.rejections[window] = times;
        self
    }

    /// Return these step sizes from successive `advance` calls,
    /// falling back to the window size once they run out.
    pub fn dt_sequence(mut self, dts: impl Into<Vec<f64>>) -> Self {
        self.dt_sequence = dts.into();
        self
    }

    /// Require initial data to be written before `initialize_data`.
    pub fn require_initial_data(mut self) -> Self {
        self.require_initial_data = true;
        self
    }

    /// Fail the `n`th (0-based) call to `advance`.
    pub fn fail_at_advance(mut self, n: usize) -> Self {
        self.fail_at_advance = Some(n);
        self
    }

    /// Make a data channel available for reading, with a constant value.
    pub fn with_read_data(mut self, data: impl Into<String>, value: f64) -> Self {
        self.read_values.insert(data.into(), value);
        self
    }

    /// Every call made so far.
    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    /// Every write made so far.
    pub fn writes(&self) -> &[WriteRecord] {
        &self.writes
    }

    /// Writes made to one channel.
    pub fn writes_to<'a>(&'a self, data: &'a str) -> impl Iterator<Item = &'a WriteRecord> {
        self.writes.iter().filter(move |w| w.data == data)
    }

    /// The step sizes `is_write_data_required` was asked about, in order.
    pub fn write_queries(&self) -> Vec<f64> {
        self.write_queries.borrow().clone()
    }

    /// Number of times `finalize` was called.
    pub fn finalize_count(&self) -> usize {
        self.finalize_count
    }

    /// Number of fulfilled instances of an action.
    pub fn fulfilled(&self, action: Action) -> usize {
        self.calls
            .iter()
            .filter(|c| **c == Call::Fulfill(action))
            .count()
    }

    /// Index of the current time window.
    pub fn window(&self) -> usize {
        self.window
    }

    fn check_live(&self) -> Result<(), TransportError> {
        if self.finalized {
            Err(TransportError::Finalized)
        } else if !self.initialized {
            Err(TransportError::NotInitialized)
        } else {
            Ok(())
        }
    }

    fn channel(&self, data: DataId) -> Result<&(String, String), TransportError> {
        usize::try_from(data)
            .ok()
            .and_then(|idx| self.channels.get(idx))
            .ok_or(TransportError::UnknownDataId(data))
    }

    fn vertex_count(&self, data: DataId) -> Result<usize, TransportError> {
        let (_, mesh) = self.channel(data)?;
        Ok(self.meshes.get(mesh).copied().unwrap_or(0))
    }

    fn check_vertices(&self, data: DataId, vertices: &[VertexId]) -> Result<(), TransportError> {
        let count = self.vertex_count(data)?;
        match vertices
            .iter()
            .find(|&&v| usize::try_from(v).map_or(true, |v| v >= count))
        {
            Some(&v) => Err(TransportError::Failure(format!(
                "vertex {} out of range for data {}",
                v, data
            ))),
            None => Ok(()),
        }
    }

    fn read(
        &mut self,
        data: DataId,
        vertices: &[VertexId],
        components: usize,
    ) -> Result<Vec<f64>, TransportError> {
        self.check_live()?;
        self.check_vertices(data, vertices)?;
        let name = self.channel(data)?.0.clone();
        let value = self
            .read_values
            .get(&name)
            .copied()
            .ok_or_else(|| TransportError::Failure(format!("{} is not readable", name)))?;
        self.calls.push(Call::Read(name));
        Ok(vec![value; vertices.len() * components])
    }

    fn write(
        &mut self,
        data: DataId,
        vertices: &[VertexId],
        values: &[f64],
        components: usize,
    ) -> Result<(), TransportError> {
        self.check_live()?;
        self.check_vertices(data, vertices)?;
        if values.len() != vertices.len() * components {
            return Err(TransportError::BufferSize {
                data,
                expected: vertices.len() * components,
                found: values.len(),
            });
        }
        let name = self.channel(data)?.0.clone();
        self.calls.push(Call::Write(name.clone()));
        self.writes.push(WriteRecord {
            data: name,
            window: self.window,
            iteration: self.iteration,
            values: values.to_vec(),
        });
        Ok(())
    }

    fn require_fulfilled(&self, action: Action) -> Result<(), TransportError> {
        if self.pending.contains(&action) {
            Err(TransportError::ActionPending(action))
        } else {
            Ok(())
        }
    }
}

impl Transport for ScriptedTransport {
    fn set_mesh_vertices(
        &mut self,
        mesh: &str,
        positions: &[f64],
    ) -> Result<Vec<VertexId>, TransportError> {
        if self.initialized {
            return Err(TransportError::Failure(
                "vertices must be set before initialization".into(),
            ));
        }
        let count = positions.len() / self.dimensions();
        let first = self.meshes.get(mesh).copied().unwrap_or(0);
        self.meshes.insert(mesh.to_string(), first + count);
        (first..first + count)
            .map(|v| {
                VertexId::try_from(v)
                    .map_err(|_| TransportError::Failure("too many vertices".into()))
            })
            .collect()
    }

    fn data_id(&mut self, data: &str, mesh: &str) -> Result<DataId, TransportError> {
        if !self.meshes.contains_key(mesh) {
            return Err(TransportError::UnknownMesh(mesh.to_string()));
        }
        let idx = match self
            .channels
            .iter()
            .position(|(d, m)| d == data && m == mesh)
        {
            Some(idx) => idx,
            None => {
                self.channels.push((data.to_string(), mesh.to_string()));
                self.channels.len() - 1
            }
        };
        DataId::try_from(idx).map_err(|_| TransportError::UnknownData {
            data: data.to_string(),
            mesh: mesh.to_string(),
        })
    }

    fn initialize(&mut self) -> Result<f64, TransportError> {
        if self.finalized {
            return Err(TransportError::Finalized);
        }
        self.initialized = true;
        self.calls.push(Call::Initialize);
        if self.require_initial_data {
            self.pending.insert(Action::WriteInitialData);
        }
        if self.implicit && self.windows > 0 {
            self.pending.insert(Action::WriteIterationCheckpoint);
        }
        Ok(self.max_dt)
    }

    fn initialize_data(&mut self) -> Result<(), TransportError> {
        self.check_live()?;
        self.require_fulfilled(Action::WriteInitialData)?;
        self.calls.push(Call::InitializeData);
        Ok(())
    }

    fn is_coupling_ongoing(&self) -> bool {
        !self.finalized && self.window < self.windows
    }

    fn is_action_required(&self, action: Action) -> bool {
        self.pending.contains(&action)
    }

    fn mark_action_fulfilled(&mut self, action: Action) -> Result<(), TransportError> {
        self.check_live()?;
        if !self.pending.remove(&action) {
            return Err(TransportError::ActionNotRequired(action));
        }
        self.calls.push(Call::Fulfill(action));
        Ok(())
    }

    fn is_read_data_available(&self) -> bool {
        self.initialized && !self.finalized && !self.read_values.is_empty()
    }

    fn is_write_data_required(&self, dt: f64) -> bool {
        self.write_queries.borrow_mut().push(dt);
        self.is_coupling_ongoing()
    }

    fn read_block_scalar_data(
        &mut self,
        data: DataId,
        vertices: &[VertexId],
    ) -> Result<Vec<f64>, TransportError> {
        self.read(data, vertices, 1)
    }

    fn read_block_vector_data(
        &mut self,
        data: DataId,
        vertices: &[VertexId],
    ) -> Result<Vec<f64>, TransportError> {
        let dims = self.dimensions();
        self.read(data, vertices, dims)
    }

    fn write_block_scalar_data(
        &mut self,
        data: DataId,
        vertices: &[VertexId],
        values: &[f64],
    ) -> Result<(), TransportError> {
        self.write(data, vertices, values, 1)
    }

    fn write_block_vector_data(
        &mut self,
        data: DataId,
        vertices: &[VertexId],
        values: &[f64],
    ) -> Result<(), TransportError> {
        let dims = self.dimensions();
        self.write(data, vertices, values, dims)
    }

    fn advance(&mut self, dt: f64) -> Result<f64, TransportError> {
        self.check_live()?;
        if !self.is_coupling_ongoing() {
            return Err(TransportError::Failure(
                "advance called after the coupling ended".into(),
            ));
        }
        for action in [
            Action::WriteInitialData,
            Action::WriteIterationCheckpoint,
            Action::ReadIterationCheckpoint,
        ] {
            self.require_fulfilled(action)?;
        }
        if self.fail_at_advance == Some(self.advances) {
            return Err(TransportError::Failure(format!(
                "scripted failure at advance {}",
                self.advances
            )));
        }

        let returned = self
            .dt_sequence
            .get(self.advances)
            .copied()
            .unwrap_or(self.max_dt);
        self.advances += 1;
        self.calls.push(Call::Advance {
            proposed: dt,
            returned,
        });

        let rejections = self.rejections.get(self.window).copied().unwrap_or(0);
        if self.implicit && self.iteration < rejections {
            self.iteration += 1;
            self.pending.insert(Action::ReadIterationCheckpoint);
        } else {
            self.window += 1;
            self.iteration = 0;
            if self.implicit && self.is_coupling_ongoing() {
                self.pending.insert(Action::WriteIterationCheckpoint);
            }
        }
        Ok(returned)
    }

    fn finalize(&mut self) -> Result<(), TransportError> {
        if self.finalized {
            return Err(TransportError::Finalized);
        }
        self.finalized = true;
        self.finalize_count += 1;
        self.calls.push(Call::Finalize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered(transport: &mut ScriptedTransport) -> (Vec<VertexId>, DataId) {
        let vertices = transport
            .set_mesh_vertices("lf-Mesh", &[0., 0., 0., 1., 0., 0.])
            .unwrap();
        let data = transport.data_id("Pressure", "lf-Mesh").unwrap();
        (vertices, data)
    }

    #[test]
    fn explicit_scheme() {
        let mut transport = ScriptedTransport::new(2, 0.5).dt_sequence([0.25]);
        let (vertices, data) = registered(&mut transport);
        assert_eq!(vertices, vec![0, 1]);
        assert_eq!(transport.data_id("Pressure", "lf-Mesh"), Ok(data));
        assert_eq!(
            transport.data_id("Pressure", "hf-Mesh"),
            Err(TransportError::UnknownMesh("hf-Mesh".into()))
        );

        assert_eq!(
            transport.write_block_scalar_data(data, &vertices, &[1., 2.]),
            Err(TransportError::NotInitialized)
        );
        assert_eq!(transport.initialize(), Ok(0.5));
        assert!(!transport.is_action_required(Action::WriteIterationCheckpoint));

        assert_eq!(
            transport.write_block_scalar_data(data, &vertices, &[1.]),
            Err(TransportError::BufferSize {
                data,
                expected: 2,
                found: 1
            })
        );
        transport
            .write_block_scalar_data(data, &vertices, &[1., 2.])
            .unwrap();
        assert_eq!(transport.advance(0.5), Ok(0.25));
        assert_eq!(transport.advance(0.25), Ok(0.5));
        assert!(!transport.is_coupling_ongoing());
        assert!(transport.advance(0.5).is_err());

        transport.finalize().unwrap();
        assert_eq!(transport.finalize(), Err(TransportError::Finalized));
        assert_eq!(transport.finalize_count(), 1);
        assert_eq!(transport.writes().len(), 1);
    }

    #[test]
    fn implicit_scheme_checkpoints() {
        let mut transport = ScriptedTransport::new(2, 1.).implicit().reject(0, 2);
        registered(&mut transport);
        transport.initialize().unwrap();

        assert!(transport.is_action_required(Action::WriteIterationCheckpoint));
        assert_eq!(
            transport.advance(1.),
            Err(TransportError::ActionPending(
                Action::WriteIterationCheckpoint
            ))
        );
        transport
            .mark_action_fulfilled(Action::WriteIterationCheckpoint)
            .unwrap();

        for _ in 0..2 {
            transport.advance(1.).unwrap();
            assert_eq!(transport.window(), 0);
            assert!(transport.is_action_required(Action::ReadIterationCheckpoint));
            assert!(!transport.is_action_required(Action::WriteIterationCheckpoint));
            transport
                .mark_action_fulfilled(Action::ReadIterationCheckpoint)
                .unwrap();
        }

        transport.advance(1.).unwrap();
        assert_eq!(transport.window(), 1);
        assert!(transport.is_action_required(Action::WriteIterationCheckpoint));
        assert_eq!(
            transport.mark_action_fulfilled(Action::ReadIterationCheckpoint),
            Err(TransportError::ActionNotRequired(
                Action::ReadIterationCheckpoint
            ))
        );
        assert_eq!(transport.fulfilled(Action::ReadIterationCheckpoint), 2);
    }

    #[test]
    fn initial_data_and_failures() {
        let mut transport = ScriptedTransport::new(3, 1.)
            .require_initial_data()
            .fail_at_advance(1)
            .with_read_data("PressureGradient", -0.5);
        let (vertices, _) = registered(&mut transport);
        let gradient = transport.data_id("PressureGradient", "lf-Mesh").unwrap();
        transport.initialize().unwrap();

        assert_eq!(
            transport.initialize_data(),
            Err(TransportError::ActionPending(Action::WriteInitialData))
        );
        transport
            .mark_action_fulfilled(Action::WriteInitialData)
            .unwrap();
        transport.initialize_data().unwrap();

        assert!(transport.is_read_data_available());
        assert_eq!(
            transport.read_block_scalar_data(gradient, &vertices),
            Ok(vec![-0.5, -0.5])
        );
        assert_eq!(
            transport.read_block_vector_data(gradient, &vertices).map(|v| v.len()),
            Ok(6)
        );

        transport.advance(1.).unwrap();
        assert!(matches!(
            transport.advance(1.),
            Err(TransportError::Failure(_))
        ));
    }
}
