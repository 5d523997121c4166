//! Drivers of the round state machine.
//!
//! The state machine only makes progress when [`StateMachine::transition`] is
//! called. [`run_round`] calls it until the round ends, waiting between the
//! attempts as the coordinator requires, and [`run_task`] runs rounds until the
//! task is over.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::mpsc, time::sleep};
use tracing::{debug, info, warn};

use crate::{
    state_machine::{now_ms, RoundFailure, StateMachine, TransitionOutcome},
    Notify,
};

/// A cooperative stop flag.
///
/// Clones share the flag. Once stopped, the next phase of the round fails and
/// the task ends.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// All the planned iterations are done
    Completed { rounds: u64 },
    /// A round failed
    Failed(RoundFailure),
    /// The task was stopped
    Stopped,
}

/// The time left until `at`, in milliseconds since the epoch.
fn until(at: u64) -> Duration {
    Duration::from_millis(at.saturating_sub(now_ms()))
}

/// Drive the state machine until the round is done or failed.
///
/// The state machine is retried after `backoff` when it can't make progress,
/// and a restarted round is resumed at the time set by the coordinator.
pub async fn run_round(mut state_machine: StateMachine, backoff: Duration) -> StateMachine {
    loop {
        state_machine = match state_machine.transition().await {
            TransitionOutcome::Pending(state_machine) if state_machine.is_finished() => {
                return state_machine;
            }
            TransitionOutcome::Pending(state_machine) => {
                debug!("no progress, retrying in {:?}", backoff);
                sleep(backoff).await;
                state_machine
            }
            TransitionOutcome::Complete(mut state_machine) => {
                if let Some(at) = state_machine.take_restart_time() {
                    let delay = until(at);
                    info!("the round restarts in {:?}", delay);
                    sleep(delay).await;
                }
                if state_machine.is_finished() {
                    return state_machine;
                }
                state_machine
            }
        };
    }
}

/// Run rounds until the planned iterations are done, a round fails or the
/// task is stopped.
///
/// Returns the state machine in its last phase along with the outcome.
pub async fn run_task(
    mut state_machine: StateMachine,
    backoff: Duration,
) -> (StateMachine, TaskOutcome) {
    let stop = state_machine.stop_handle();
    let mut rounds = 0;
    loop {
        state_machine = run_round(state_machine, backoff).await;
        if stop.is_stopped() {
            info!("the task was stopped after {} rounds", rounds);
            return (state_machine, TaskOutcome::Stopped);
        }
        if let Some(failure) = state_machine.failure() {
            let failure = failure.clone();
            warn!("the task ends with a failed round: {}", failure.reason);
            return (state_machine, TaskOutcome::Failed(failure));
        }
        rounds += 1;
        let iterations = state_machine.round().iterations;
        if rounds >= iterations {
            info!("the task completed {} rounds", rounds);
            return (state_machine, TaskOutcome::Completed { rounds });
        }
        state_machine = state_machine.next_round();
    }
}

/// Events emitted by the state machine through a [`Notifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The device joined the round of the given iteration
    NewRound(u64),
    Train,
    Upload,
    /// The round of the given iteration is done
    Done(u64),
    Failed,
}

/// A [`Notify`] implementation forwarding the notifications to a channel.
#[derive(Debug)]
pub struct Notifier(mpsc::Sender<Event>);

impl Notifier {
    /// Create a notifier and the receiver of its events. Events are dropped
    /// when more than `capacity` of them are pending.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self(tx), rx)
    }

    fn notify(&mut self, event: Event) {
        if let Err(e) = self.0.try_send(event) {
            warn!("failed to notify the device: {}", e);
        }
    }
}

impl Notify for Notifier {
    fn notify_new_round(&mut self, iteration: u64) {
        self.notify(Event::NewRound(iteration))
    }

    fn notify_train(&mut self) {
        self.notify(Event::Train)
    }

    fn notify_upload(&mut self) {
        self.notify(Event::Upload)
    }

    fn notify_done(&mut self, iteration: u64) {
        self.notify(Event::Done(iteration))
    }

    fn notify_failed(&mut self) {
        self.notify(Event::Failed)
    }
}
