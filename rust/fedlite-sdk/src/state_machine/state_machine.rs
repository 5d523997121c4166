use derive_more::From;
use thiserror::Error;

use fedlite_core::ConfigError;

use super::{
    boxed_io,
    Done,
    Download,
    Evaluate,
    Failed,
    IntoPhase,
    MaskSetup,
    Phase,
    Round,
    RoundFailure,
    SerializableState,
    SharedState,
    StartJob,
    State,
    Step,
    Train,
    Unmask,
    Upload,
};
use crate::{
    agent::StopHandle,
    settings::{PrivacySettings, TaskSettings},
    FlClient,
    Notify,
    Trainer,
};

/// Outcome of a state machine transition attempt.
#[derive(Debug)]
pub enum TransitionOutcome {
    /// Outcome when the state machine cannot make immediate progress. The state machine
    /// is returned unchanged.
    Pending(StateMachine),
    /// Outcome when a transition occured and the state machine was updated.
    Complete(StateMachine),
}

/// Error returned when a state machine can't be created.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to initialize the crypto library")]
    Crypto,
    #[error("invalid settings: {0}")]
    Config(#[from] ConfigError),
}

/// Round state machine of a device.
#[derive(From, Debug)]
#[allow(clippy::large_enum_variant)]
pub enum StateMachine {
    /// The device asks to join the round
    StartJob(Phase<StartJob>),
    /// The device sets up the pairwise masks of its update
    MaskSetup(Phase<MaskSetup>),
    /// The device trains the model locally
    Train(Phase<Train>),
    /// The device uploads its update
    Upload(Phase<Upload>),
    /// The device helps unmasking the aggregate
    Unmask(Phase<Unmask>),
    /// The device downloads the aggregated model
    Download(Phase<Download>),
    /// The device evaluates the aggregated model
    Evaluate(Phase<Evaluate>),
    /// The round is done
    Done(Phase<Done>),
    /// The round failed
    Failed(Phase<Failed>),
}

macro_rules! on_phase {
    ($state_machine:expr, $phase:ident => $body:expr) => {
        match $state_machine {
            StateMachine::StartJob($phase) => $body,
            StateMachine::MaskSetup($phase) => $body,
            StateMachine::Train($phase) => $body,
            StateMachine::Upload($phase) => $body,
            StateMachine::Unmask($phase) => $body,
            StateMachine::Download($phase) => $body,
            StateMachine::Evaluate($phase) => $body,
            StateMachine::Done($phase) => $body,
            StateMachine::Failed($phase) => $body,
        }
    };
}

impl StateMachine {
    /// Try to make progress in the round.
    ///
    /// A round that is done or failed makes no more progress, see
    /// [`next_round`] and [`retry`].
    ///
    /// [`next_round`]: StateMachine::next_round
    /// [`retry`]: StateMachine::retry
    pub async fn transition(self) -> TransitionOutcome {
        match self {
            StateMachine::StartJob(phase) => phase.step().await,
            StateMachine::MaskSetup(phase) => phase.step().await,
            StateMachine::Train(phase) => phase.step().await,
            StateMachine::Upload(phase) => phase.step().await,
            StateMachine::Unmask(phase) => phase.step().await,
            StateMachine::Download(phase) => phase.step().await,
            StateMachine::Evaluate(phase) => phase.step().await,
            StateMachine::Done(phase) => Step::step(phase).await,
            StateMachine::Failed(phase) => Step::step(phase).await,
        }
    }

    /// Convert the state machine into a serializable data structure so
    /// that it can be saved.
    pub fn save(self) -> SerializableState {
        on_phase!(self, phase => phase.state.into())
    }

    /// Start the next iteration after a completed round. In any other
    /// phase, the state machine is returned unchanged.
    pub fn next_round(self) -> Self {
        match self {
            StateMachine::Done(phase) => phase.next_round().into(),
            state_machine => state_machine,
        }
    }

    /// Restart the iteration after a failed round. In any other phase,
    /// the state machine is returned unchanged.
    pub fn retry(self) -> Self {
        match self {
            StateMachine::Failed(phase) => phase.retry().into(),
            state_machine => state_machine,
        }
    }

    /// The progress of the current round.
    pub fn round(&self) -> &Round {
        &self.shared().round
    }

    /// Why the round failed, if it did.
    pub fn failure(&self) -> Option<&RoundFailure> {
        match self {
            StateMachine::Failed(phase) => Some(&phase.state.private.failure),
            _ => None,
        }
    }

    /// Whether the round reached a terminal phase.
    pub fn is_finished(&self) -> bool {
        matches!(self, StateMachine::Done(_) | StateMachine::Failed(_))
    }

    /// A handle to stop the task.
    pub fn stop_handle(&self) -> StopHandle {
        self.shared().stop.clone()
    }

    /// Take the time before which a restarted round must not go on.
    pub(crate) fn take_restart_time(&mut self) -> Option<u64> {
        match self {
            StateMachine::StartJob(phase) => phase.state.shared.round.next_request_time.take(),
            _ => None,
        }
    }

    fn shared(&self) -> &SharedState {
        on_phase!(self, phase => &*phase.state.shared)
    }
}

impl StateMachine {
    /// Instantiate a new round state machine.
    ///
    /// # Args
    ///
    /// - `task`: settings of the task
    /// - `privacy`: local privacy settings, completing the plans of the coordinator
    /// - `client`: a client for communicating with the coordinator
    /// - `trainer`: the local model
    /// - `notifier`: a type that the state machine can use to emit notifications
    ///
    /// # Errors
    /// Fails if the crypto library can't be initialized or the privacy
    /// settings are invalid.
    pub fn new<C, T, N>(
        task: TaskSettings,
        privacy: PrivacySettings,
        client: C,
        trainer: T,
        notifier: N,
    ) -> Result<Self, InitError>
    where
        C: FlClient + Send + 'static,
        T: Trainer + Send + 'static,
        N: Notify + Send + 'static,
    {
        sodiumoxide::init().map_err(|_| InitError::Crypto)?;
        let io = boxed_io(client, trainer, notifier);
        let shared = SharedState::new(task, privacy)?;
        let state = State::new(Box::new(shared), Box::new(StartJob));
        Ok(state.into_phase(io).into())
    }

    /// Restore the round state machine from the given `state`.
    ///
    /// The restored state machine has a new stop handle.
    pub fn restore<C, T, N>(
        state: SerializableState,
        client: C,
        trainer: T,
        notifier: N,
    ) -> Self
    where
        C: FlClient + Send + 'static,
        T: Trainer + Send + 'static,
        N: Notify + Send + 'static,
    {
        let io = boxed_io(client, trainer, notifier);
        match state {
            SerializableState::StartJob(state) => state.into_phase(io).into(),
            SerializableState::MaskSetup(state) => state.into_phase(io).into(),
            SerializableState::Train(state) => state.into_phase(io).into(),
            SerializableState::Upload(state) => state.into_phase(io).into(),
            SerializableState::Unmask(state) => state.into_phase(io).into(),
            SerializableState::Download(state) => state.into_phase(io).into(),
            SerializableState::Evaluate(state) => state.into_phase(io).into(),
            SerializableState::Done(state) => state.into_phase(io).into(),
            SerializableState::Failed(state) => state.into_phase(io).into(),
        }
    }
}
