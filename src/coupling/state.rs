//! The coupling state machine and the session state it guards.

use nalgebra as na;

use crate::CoefficientArchive;

use super::CouplingError;

/// Phase of a coupled session.
///
/// Sub-iterations cycle through
/// `CheckpointSave? -> Exchange -> Advance -> CheckpointRestore | Converged`;
/// the checkpoint save is skipped when the transport doesn't ask for one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Mesh and channels are being registered.
    Init,
    /// Initial data is being computed and written.
    WriteInitial,
    /// The state at the start of a time window is being saved.
    CheckpointSave,
    /// Data is being read from and written to the transport.
    Exchange,
    /// The transport is advancing.
    Advance,
    /// The last iteration was rejected; the saved state is being restored.
    CheckpointRestore,
    /// The last iteration was accepted.
    Converged,
    /// The coupling has ended.
    Finalized,
}

impl Phase {
    /// Check whether the transition `self -> to` is allowed.
    pub fn can_transition(self, to: Phase) -> bool {
        use Phase::*;
        match self {
            Init => matches!(to, WriteInitial | CheckpointSave | Exchange | Finalized),
            WriteInitial | CheckpointRestore | Converged => {
                matches!(to, CheckpointSave | Exchange | Finalized)
            }
            CheckpointSave => to == Exchange,
            Exchange => to == Advance,
            Advance => matches!(to, CheckpointRestore | Converged),
            Finalized => false,
        }
    }

    /// Whether this phase is part of the iteration cycle.
    pub fn is_iterating(self) -> bool {
        matches!(
            self,
            Phase::CheckpointSave
                | Phase::Exchange
                | Phase::Advance
                | Phase::CheckpointRestore
                | Phase::Converged
        )
    }
}

/// Coefficients and predictions of one field, computed for a pending step.
#[derive(Clone, Debug, PartialEq)]
pub struct StagedField {
    /// Name of the field.
    pub field: String,
    /// Modal coefficients.
    pub coefficients: na::DVector<f64>,
    /// Reconstructed interface values, component-major.
    pub prediction: na::DVector<f64>,
}

/// A step that has been computed but not yet accepted by the transport.
#[derive(Clone, Debug, PartialEq)]
pub struct StagedStep {
    /// Coupling time the step was computed for.
    pub time: f64,
    /// One entry per coupled field.
    pub fields: Vec<StagedField>,
}

#[derive(Clone, Debug, PartialEq)]
struct Checkpoint {
    time: f64,
    steps: usize,
    coefficients: Vec<(String, na::DVector<f64>)>,
}

/// State of a coupled session:
/// the current phase and time, the step being iterated on
/// and the checkpoint to return to if the iteration is rejected.
#[derive(Clone, Debug)]
pub struct CouplingSession {
    phase: Phase,
    time: f64,
    dt: f64,
    steps: usize,
    // time is `base_time + (steps - base_steps) * dt`,
    // rebased whenever dt shrinks or a checkpoint is restored
    base_time: f64,
    base_steps: usize,
    staged: Option<StagedStep>,
    committed: Vec<(String, na::DVector<f64>)>,
    checkpoint: Option<Checkpoint>,
    read_buffers: Vec<(String, Vec<f64>)>,
    saves: usize,
    restores: usize,
}

impl CouplingSession {
    /// Start a session at time `t_start` with proposed step `dt`.
    pub fn new(t_start: f64, dt: f64) -> Self {
        Self {
            phase: Phase::Init,
            time: t_start,
            dt,
            steps: 0,
            base_time: t_start,
            base_steps: 0,
            staged: None,
            committed: Vec::new(),
            checkpoint: None,
            read_buffers: Vec::new(),
            saves: 0,
            restores: 0,
        }
    }

    /// Move to another phase, failing if the transition isn't allowed.
    pub fn transition(&mut self, to: Phase) -> Result<(), CouplingError> {
        if !self.phase.can_transition(to) {
            return Err(CouplingError::Protocol {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        Ok(())
    }

    /// The current phase.
    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The current coupling time.
    #[inline]
    pub fn time(&self) -> f64 {
        self.time
    }

    /// The current step size.
    #[inline]
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Number of accepted steps.
    #[inline]
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Number of checkpoints saved.
    #[inline]
    pub fn saves(&self) -> usize {
        self.saves
    }

    /// Number of checkpoints restored.
    #[inline]
    pub fn restores(&self) -> usize {
        self.restores
    }

    /// The step awaiting acceptance, if any.
    #[inline]
    pub fn staged(&self) -> Option<&StagedStep> {
        self.staged.as_ref()
    }

    /// The coefficients of the last committed step, per field.
    #[inline]
    pub fn committed(&self) -> &[(String, na::DVector<f64>)] {
        &self.committed
    }

    /// The last data read from each transport channel.
    #[inline]
    pub fn read_buffers(&self) -> &[(String, Vec<f64>)] {
        &self.read_buffers
    }

    /// Store data read from a transport channel, replacing the previous read.
    pub fn store_read(&mut self, channel: &str, values: Vec<f64>) {
        match self.read_buffers.iter_mut().find(|(c, _)| c == channel) {
            Some((_, buffer)) => *buffer = values,
            None => self.read_buffers.push((channel.to_string(), values)),
        }
    }

    /// Stage a computed step; it's only archived once accepted.
    pub fn stage(&mut self, step: StagedStep) {
        self.staged = Some(step);
    }

    /// Save the current time and committed coefficients.
    pub fn save_checkpoint(&mut self) -> Result<(), CouplingError> {
        if self.phase != Phase::CheckpointSave {
            return Err(CouplingError::Protocol {
                from: self.phase,
                to: Phase::CheckpointSave,
            });
        }
        self.checkpoint = Some(Checkpoint {
            time: self.time,
            steps: self.steps,
            coefficients: self.committed.clone(),
        });
        self.saves += 1;
        Ok(())
    }

    /// Return to the saved checkpoint, discarding the staged step.
    ///
    /// The checkpoint is kept, so repeated rejections all return to the same state.
    pub fn restore_checkpoint(&mut self) -> Result<(), CouplingError> {
        if self.phase != Phase::CheckpointRestore {
            return Err(CouplingError::Protocol {
                from: self.phase,
                to: Phase::CheckpointRestore,
            });
        }
        let checkpoint = self
            .checkpoint
            .as_ref()
            .ok_or(CouplingError::MissingCheckpoint)?;
        self.time = checkpoint.time;
        self.steps = checkpoint.steps;
        self.committed = checkpoint.coefficients.clone();
        self.base_time = self.time;
        self.base_steps = self.steps;
        self.staged = None;
        self.restores += 1;
        Ok(())
    }

    /// Adopt the step size actually advanced: the smaller of the proposed one
    /// and the one the transport allows.
    pub fn adopt_dt(&mut self, returned: f64) -> f64 {
        if returned < self.dt {
            self.base_time = self.time;
            self.base_steps = self.steps;
            self.dt = returned;
        }
        self.dt
    }

    /// Archive the staged step, if any, and make it the committed state.
    ///
    /// Returns whether there was a step to commit.
    pub fn commit(&mut self, archive: &mut dyn CoefficientArchive) -> Result<bool, CouplingError> {
        let Some(step) = self.staged.take() else {
            return Ok(false);
        };
        for field in &step.fields {
            archive.store(step.time, &field.field, &field.coefficients)?;
        }
        self.committed = step
            .fields
            .into_iter()
            .map(|f| (f.field, f.coefficients))
            .collect();
        Ok(true)
    }

    /// Accept the current iteration: commit the staged step and move time forward.
    pub fn converge(
        &mut self,
        archive: &mut dyn CoefficientArchive,
    ) -> Result<(), CouplingError> {
        if self.phase != Phase::Converged {
            return Err(CouplingError::Protocol {
                from: self.phase,
                to: Phase::Converged,
            });
        }
        self.commit(archive)?;
        self.steps += 1;
        self.time = self.base_time + (self.steps - self.base_steps) as f64 * self.dt;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{field::time_label, MemoryArchive};

    fn step(time: f64, value: f64) -> StagedStep {
        StagedStep {
            time,
            fields: vec![StagedField {
                field: "p".into(),
                coefficients: na::DVector::from_element(2, value),
                prediction: na::DVector::from_element(3, value),
            }],
        }
    }

    #[test]
    fn transition_table() {
        use Phase::*;
        let all = [
            Init,
            WriteInitial,
            CheckpointSave,
            Exchange,
            Advance,
            CheckpointRestore,
            Converged,
            Finalized,
        ];
        // exchanging is only reachable from the start of an iteration
        for from in all {
            assert_eq!(
                from.can_transition(Exchange),
                !matches!(from, Exchange | Advance | Finalized)
            );
        }
        assert!(Advance.can_transition(Converged));
        assert!(!Exchange.can_transition(Converged));
        assert!(!CheckpointSave.can_transition(Advance));
        assert!(all.iter().all(|&to| !Finalized.can_transition(to)));
        assert!(!Init.is_iterating());
        assert!(Advance.is_iterating());
    }

    #[test]
    fn illegal_transition_is_reported() {
        let mut session = CouplingSession::new(0., 0.1);
        assert!(matches!(
            session.transition(Phase::Advance),
            Err(CouplingError::Protocol {
                from: Phase::Init,
                to: Phase::Advance
            })
        ));
        assert_eq!(session.phase(), Phase::Init);
    }

    #[test]
    fn rejected_iterations_return_to_the_checkpoint() {
        let mut archive = MemoryArchive::new();
        let mut session = CouplingSession::new(1., 0.5);

        session.transition(Phase::CheckpointSave).unwrap();
        session.save_checkpoint().unwrap();
        for attempt in 0..2 {
            session.transition(Phase::Exchange).unwrap();
            session.stage(step(session.time(), attempt as f64));
            session.transition(Phase::Advance).unwrap();
            session.transition(Phase::CheckpointRestore).unwrap();
            session.restore_checkpoint().unwrap();
            assert_eq!(session.time(), 1.);
            assert!(session.staged().is_none());
        }

        session.transition(Phase::Exchange).unwrap();
        session.stage(step(session.time(), 7.));
        session.transition(Phase::Advance).unwrap();
        assert_eq!(session.adopt_dt(0.25), 0.25);
        session.transition(Phase::Converged).unwrap();
        session.converge(&mut archive).unwrap();

        assert_eq!(session.time(), 1.25);
        assert_eq!(session.steps(), 1);
        assert_eq!(session.saves(), 1);
        assert_eq!(session.restores(), 2);
        assert_eq!(archive.len(), 1);
        assert_eq!(archive.records()[0].time, 1.);
        assert_eq!(archive.records()[0].coefficients[0], 7.);
        assert_eq!(session.committed()[0].0, "p");
    }

    #[test]
    fn time_does_not_drift_over_many_steps() {
        let mut archive = MemoryArchive::new();
        let mut session = CouplingSession::new(0., 0.01);
        let mut step = |session: &mut CouplingSession, returned: f64| {
            session.transition(Phase::Exchange).unwrap();
            session.transition(Phase::Advance).unwrap();
            session.adopt_dt(returned);
            session.transition(Phase::Converged).unwrap();
            session.converge(&mut archive).unwrap();
        };

        for _ in 0..1000 {
            step(&mut session, 0.01);
        }
        assert_eq!(time_label(session.time()), "10");
        // sub-cycling from here on
        for _ in 0..50372 {
            step(&mut session, 0.001);
        }
        assert_eq!(session.steps(), 51372);
        assert_eq!(time_label(session.time()), "60.372");
        // larger steps offered later don't grow dt back
        step(&mut session, 0.5);
        assert_eq!(time_label(session.time()), "60.373");
    }

    #[test]
    fn restore_without_checkpoint_fails() {
        let mut session = CouplingSession::new(0., 0.1);
        session.transition(Phase::Exchange).unwrap();
        session.transition(Phase::Advance).unwrap();
        session.transition(Phase::CheckpointRestore).unwrap();
        assert!(matches!(
            session.restore_checkpoint(),
            Err(CouplingError::MissingCheckpoint)
        ));
    }
}
