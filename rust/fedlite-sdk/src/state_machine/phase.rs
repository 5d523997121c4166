use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use derive_more::From;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fedlite_core::{
    common::ConfigError,
    crypto::SigningKeyPair,
    privacy::{dp::AdaptiveClip, signds::MagnitudeReference},
    secagg::CipherSession,
    CompressType,
    ResponseCode,
    RoundStatus,
};

use super::{
    io::BoxError,
    Done,
    Download,
    Evaluate,
    Failed,
    MaskSetup,
    StartJob,
    Train,
    Unmask,
    Upload,
    IO,
};
use crate::{
    agent::StopHandle,
    message::{Plan, Reply, ServerResponse},
    settings::{PrivacySettings, TaskSettings},
    state_machine::{StateMachine, TransitionOutcome},
};

/// State of the state machine
#[derive(Debug, Serialize, Deserialize)]
pub struct State<P> {
    /// data specific to the current phase
    pub private: Box<P>,
    /// data common to all the phases
    pub shared: Box<SharedState>,
}

impl<P> State<P> {
    /// Create a new state
    pub fn new(shared: Box<SharedState>, private: Box<P>) -> Self {
        Self { shared, private }
    }
}

/// A dynamically dispatched [`IO`] object.
pub(crate) type PhaseIo = Box<dyn IO>;

/// Represent the state machine in a specific phase
pub struct Phase<P> {
    /// State of the phase.
    pub(super) state: State<P>,
    /// Opaque client for performing IO tasks: talking with the
    /// coordinator, training the model, etc.
    pub(super) io: PhaseIo,
}

impl<P> std::fmt::Debug for Phase<P>
where
    P: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Phase")
            .field("state", &self.state)
            .field("io", &"PhaseIo")
            .finish()
    }
}

/// Progress of the current round, as observed by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Round {
    /// The iteration assigned by the coordinator
    pub iteration: u64,
    /// The number of iterations of the task, as planned by the coordinator
    pub iterations: u64,
    /// Outcome of the last phase
    pub status: RoundStatus,
    /// Code of the last coordinator response
    pub code: ResponseCode,
    pub reason: String,
    /// Earliest time, in milliseconds since the epoch, at which the round may
    /// be restarted. Only set after a restart.
    pub next_request_time: Option<u64>,
}

/// Why a round failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundFailure {
    pub code: ResponseCode,
    pub reason: String,
    /// Whether the whole task must stop, not only the current iteration
    pub task_fatal: bool,
}

impl RoundFailure {
    /// A failure of the current iteration.
    pub fn new(code: ResponseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            task_fatal: false,
        }
    }

    /// A failure that ends the task.
    pub fn fatal(code: ResponseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            task_fatal: true,
        }
    }

    /// A local error of the device.
    pub(crate) fn local(reason: impl std::fmt::Display) -> Self {
        Self::new(ResponseCode::RequestError, reason.to_string())
    }

    pub(crate) fn stopped() -> Self {
        Self::fatal(ResponseCode::RequestError, "the task was stopped")
    }
}

/// Store for all the data that are common to all the phases
#[derive(Serialize, Deserialize, Debug)]
pub struct SharedState {
    pub task: TaskSettings,
    pub privacy: PrivacySettings,
    pub round: Round,
    /// Norm clipping bound of the DP mode. It adapts to the trained updates
    /// across iterations.
    pub dp_clip: AdaptiveClip,
    /// Magnitude reference of the SignDS mode
    pub magnitude: MagnitudeReference,
    /// Keys proving the identity of the device, if enabled
    pub identity: Option<SigningKeyPair>,
    #[serde(skip)]
    pub stop: StopHandle,
}

impl SharedState {
    /// # Errors
    /// Fails if the magnitude reference of the privacy settings is invalid.
    pub fn new(task: TaskSettings, privacy: PrivacySettings) -> Result<Self, ConfigError> {
        let identity = if task.proof_of_identity {
            Some(SigningKeyPair::generate())
        } else {
            None
        };
        Ok(Self {
            dp_clip: AdaptiveClip::new(privacy.dp_norm_clip_factor),
            magnitude: privacy.magnitude_reference()?,
            round: Round::default(),
            identity,
            stop: StopHandle::default(),
            task,
            privacy,
        })
    }
}

/// What the device learnt about the round when joining it.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RoundContext {
    pub plan: Plan,
    /// The features subject to the privacy transforms, and uploaded
    pub feature_names: Vec<String>,
    /// The number of values of the named features
    pub feature_size: usize,
    pub compress_type: CompressType,
    pub sparse_rate: f32,
    /// Whether inference results are uploaded for unsupervised evaluation
    pub unsupervised_eval: bool,
    /// The secure aggregation session, under pairwise masking
    pub session: Option<CipherSession>,
}

/// A trait that each `Phase<P>` implements. When `Step::step` is called, the phase
/// tries to do a small piece of work.
#[async_trait]
pub trait Step {
    /// Represent an attempt to make progress within a phase. If the step results in a
    /// change in the phase state, the updated state machine is returned as
    /// `TransitionOutcome::Complete`. If no progress can be made, the state machine is
    /// returned unchanged as `TransitionOutcome::Pending`.
    async fn step(mut self) -> TransitionOutcome;
}

#[macro_export]
macro_rules! try_progress {
    ($progress:expr) => {{
        use $crate::state_machine::{Progress, TransitionOutcome};
        match $progress {
            // No progress can be made. Return the state machine as is
            Progress::Stuck(phase) => return TransitionOutcome::Pending(phase.into()),
            // Further progress can be made but require more work, so don't return
            Progress::Continue(phase) => phase,
            // Progress has been made, return the updated state machine
            Progress::Updated(state_machine) => return TransitionOutcome::Complete(state_machine),
        }
    }};
}

/// Represent the presence or absence of progress being made during a phase.
#[derive(Debug)]
pub enum Progress<P> {
    /// No progress can be made currently.
    Stuck(Phase<P>),
    /// More work needs to be done for progress to be made.
    Continue(Phase<P>),
    /// Progress has been made and resulted in this new state machine.
    Updated(StateMachine),
}

impl<P> Progress<P>
where
    Phase<P>: Into<StateMachine>,
{
    /// The outcome of a phase that can't go any further.
    pub(crate) fn into_outcome(self) -> TransitionOutcome {
        match self {
            Progress::Stuck(phase) | Progress::Continue(phase) => {
                TransitionOutcome::Pending(phase.into())
            }
            Progress::Updated(state_machine) => TransitionOutcome::Complete(state_machine),
        }
    }
}

impl<P> Phase<P>
where
    Phase<P>: Step + Into<StateMachine>,
{
    /// Try to make some progress in the round. There are three possible
    /// outcomes:
    ///
    /// 1. no progress can currently be made and the phase state is unchanged
    /// 2. progress is made but the state machine does not transition to a new
    ///    phase. Internally, the phase state is changed though.
    /// 3. progress is made and the state machine transitions to a new phase.
    ///
    /// In case `1.`, the state machine is returned unchanged, wrapped in
    /// [`TransitionOutcome::Pending`]. In case `2.` and `3.` the updated state
    /// machine is returned wrapped in [`TransitionOutcome::Complete`].
    ///
    /// If the task was stopped, the round fails instead.
    pub async fn step(self) -> TransitionOutcome {
        if self.state.shared.stop.is_stopped() {
            info!("the task was stopped, abandoning the round");
            return TransitionOutcome::Complete(self.into_failed(RoundFailure::stopped()).into());
        }
        <Self as Step>::step(self).await
    }
}

/// Trait for building [`Phase<P>`] from a [`State<P>`].
///
/// Note that we could just use [`Phase::new`] for this. However we want to be able to
/// customize the conversion for each phase, to emit the notifications of the phase
/// with the `io` object.
pub(crate) trait IntoPhase<P> {
    /// Build the phase with the given `io` object
    fn into_phase(self, io: PhaseIo) -> Phase<P>;
}

/// Why a phase could not complete.
#[derive(Debug)]
pub(crate) enum Interrupt {
    /// The coordinator is busy, the phase must be retried later.
    Wait(ResponseCode),
    /// The round must restart, not before `at`.
    Restart { at: u64, code: ResponseCode },
    Failed(RoundFailure),
}

/// How a "not ready" answer of the coordinator is handled by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NotReady {
    /// The round restarts. The endpoints that submit data behave this way.
    Restart,
    /// The same request is retried. The endpoints that fetch data behave this way.
    Wait,
}

impl<P> Phase<P> {
    /// Build a new phase with the given state and io object. This should not be called
    /// directly. Instead, use the [`IntoPhase`] trait to construct a phase.
    pub(crate) fn new(state: State<P>, io: PhaseIo) -> Self {
        Phase { state, io }
    }

    /// Transition to the start job phase, to restart the round
    pub(crate) fn into_restart(mut self, at: u64, code: ResponseCode) -> Phase<StartJob> {
        info!("restarting the round, not before {}", at);
        let round = &mut self.state.shared.round;
        round.status = RoundStatus::Restart;
        round.code = code;
        round.next_request_time = Some(at);
        State::new(self.state.shared, Box::new(StartJob)).into_phase(self.io)
    }

    /// Transition to the failed phase
    pub(crate) fn into_failed(mut self, failure: RoundFailure) -> Phase<Failed> {
        warn!(
            "round failed with {:?}: {} (task fatal: {})",
            failure.code, failure.reason, failure.task_fatal
        );
        let round = &mut self.state.shared.round;
        round.status = RoundStatus::Failed;
        round.code = failure.code;
        round.reason = failure.reason.clone();
        State::new(self.state.shared, Box::new(Failed { failure })).into_phase(self.io)
    }

    /// Record that the current phase completed
    pub(crate) fn succeeded(&mut self) {
        let round = &mut self.state.shared.round;
        round.status = RoundStatus::Success;
        round.code = ResponseCode::Succeed;
        round.reason.clear();
    }

    /// Turn an interrupt into the progress of the phase
    pub(crate) fn interrupt(mut self, interrupt: Interrupt) -> Progress<P> {
        match interrupt {
            Interrupt::Wait(code) => {
                debug!("the coordinator is busy, waiting");
                let round = &mut self.state.shared.round;
                round.status = RoundStatus::Wait;
                round.code = code;
                Progress::Stuck(self)
            }
            Interrupt::Restart { at, code } => Progress::Updated(self.into_restart(at, code).into()),
            Interrupt::Failed(failure) => Progress::Updated(self.into_failed(failure).into()),
        }
    }

    /// Fail the round with a local error
    pub(crate) fn fail(self, failure: RoundFailure) -> Progress<P> {
        self.interrupt(Interrupt::Failed(failure))
    }

    /// Check the reply of the coordinator to a request sent to `endpoint`.
    pub(crate) fn accept<T>(
        &self,
        endpoint: &str,
        reply: Result<Reply<T>, BoxError>,
        not_ready: NotReady,
    ) -> Result<T, Interrupt>
    where
        T: ServerResponse,
    {
        let response = match reply {
            Ok(Reply::Message(response)) => response,
            Ok(Reply::NotReady) => {
                info!("{}: the coordinator is not ready", endpoint);
                return Err(match not_ready {
                    NotReady::Restart => Interrupt::Restart {
                        at: now_ms() + self.state.shared.task.not_ready_delay_ms,
                        code: ResponseCode::OutOfTime,
                    },
                    NotReady::Wait => Interrupt::Wait(ResponseCode::SucNotReady),
                });
            }
            Ok(Reply::JobNotAvailable) => {
                warn!("{}: the training job is not available", endpoint);
                return Err(Interrupt::Failed(RoundFailure::fatal(
                    ResponseCode::SystemError,
                    "the training job is disabled or finished",
                )));
            }
            Err(e) => {
                warn!("{}: request failed: {}", endpoint, e);
                return Err(Interrupt::Failed(RoundFailure::new(
                    ResponseCode::RequestError,
                    format!("{} request failed: {}", endpoint, e),
                )));
            }
        };

        let code = response.retcode();
        match code {
            ResponseCode::Succeed => Ok(response),
            ResponseCode::SucNotReady if not_ready == NotReady::Wait => Err(Interrupt::Wait(code)),
            ResponseCode::SucNotReady | ResponseCode::OutOfTime => {
                info!("{}: {:?}, {}", endpoint, code, response.reason());
                Err(Interrupt::Restart {
                    at: response.next_req_time(),
                    code,
                })
            }
            ResponseCode::SystemError => Err(Interrupt::Failed(RoundFailure::fatal(
                code,
                response.reason(),
            ))),
            _ => Err(Interrupt::Failed(RoundFailure::new(
                code,
                response.reason(),
            ))),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_io_mock<F>(&mut self, f: F)
    where
        F: FnOnce(&mut super::MockIO),
    {
        let mut mock = super::MockIO::new();
        f(&mut mock);
        self.io = Box::new(mock);
    }

    #[cfg(test)]
    pub(crate) fn check_io_mock(&mut self) {
        // dropping the mock forces the checks to run. We replace it
        // by an empty one, so that we detect if a method is called
        // un-expectedly afterwards
        let _ = std::mem::replace(&mut self.io, Box::new(super::MockIO::new()));
    }
}

/// The current time in milliseconds since the epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// A serializable representation of a phase state.
///
/// We cannot serialize the state directly, even though it implements `Serialize`, because
/// deserializing it would require knowing its type in advance.
#[derive(Serialize, Deserialize, From, Debug)]
pub enum SerializableState {
    StartJob(State<StartJob>),
    MaskSetup(State<MaskSetup>),
    Train(State<Train>),
    Upload(State<Upload>),
    Unmask(State<Unmask>),
    Download(State<Download>),
    Evaluate(State<Evaluate>),
    Done(State<Done>),
    Failed(State<Failed>),
}

impl<P> Into<SerializableState> for Phase<P>
where
    State<P>: Into<SerializableState>,
{
    fn into(self) -> SerializableState {
        self.state.into()
    }
}
