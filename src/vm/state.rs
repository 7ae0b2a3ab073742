//! Per-VM lifecycle state machine.
//!
//! ```text
//! Stopped → Starting → Running → {Stopped, Errored}
//! Errored → Starting            (retry)
//! Running → Stopped             (graceful stop or platform-reported finish)
//! ```
//!
//! No other transitions exist; events that would produce one are swallowed
//! where they stand. Both the lifecycle-event listener and the status
//! poller publish into the engine's event channel, and the single consumer
//! drives this machine — so per-VM event ordering is exactly the channel
//! ordering.

use statig::blocking::StateMachine;
use statig::prelude::*;
use tracing::trace;

use crate::model::VmStatus;

/// Events fed to the machine by the engine's event consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// A new start was issued by the engine.
    StartRequested,
    /// The run call returned successfully; the record is optimistically
    /// considered running (payload-ready events never fire for custom
    /// images).
    RunIssued,
    /// Platform reported the payload process started.
    PayloadStarted,
    /// Platform reported the payload is ready.
    PayloadReady,
    /// Platform reported the payload finished.
    PayloadFinished { exit_code: i32 },
    /// Platform reported an error; the engine records the message before
    /// dispatching this.
    Fault,
    /// The platform instance is gone — explicit stop, platform stop event,
    /// or the status poller observed it dead.
    StopObserved,
}

/// Storage for the machine; only used for trace logging.
pub struct VmLifecycle {
    pub id: String,
}

impl VmLifecycle {
    pub fn machine(id: impl Into<String>) -> StateMachine<VmLifecycle> {
        VmLifecycle { id: id.into() }.state_machine()
    }
}

#[state_machine(
    initial = "State::stopped()",
    state(derive(Debug, Clone, PartialEq))
)]
impl VmLifecycle {
    #[state]
    fn stopped(&mut self, event: &LifecycleEvent) -> Response<State> {
        match event {
            LifecycleEvent::StartRequested => {
                trace!(id = %self.id, "stopped -> starting");
                Transition(State::starting())
            }
            _ => Handled,
        }
    }

    #[state]
    fn starting(&mut self, event: &LifecycleEvent) -> Response<State> {
        match event {
            LifecycleEvent::RunIssued | LifecycleEvent::PayloadReady => {
                trace!(id = %self.id, "starting -> running");
                Transition(State::running())
            }
            LifecycleEvent::PayloadStarted => Handled,
            LifecycleEvent::PayloadFinished { .. } | LifecycleEvent::StopObserved => {
                Transition(State::stopped())
            }
            LifecycleEvent::Fault => Transition(State::errored()),
            LifecycleEvent::StartRequested => Handled,
        }
    }

    #[state]
    fn running(&mut self, event: &LifecycleEvent) -> Response<State> {
        match event {
            LifecycleEvent::PayloadFinished { exit_code } => {
                trace!(id = %self.id, exit_code, "running -> stopped");
                Transition(State::stopped())
            }
            LifecycleEvent::StopObserved => Transition(State::stopped()),
            LifecycleEvent::Fault => Transition(State::errored()),
            _ => Handled,
        }
    }

    #[state]
    fn errored(&mut self, event: &LifecycleEvent) -> Response<State> {
        match event {
            LifecycleEvent::StartRequested => {
                trace!(id = %self.id, "errored -> starting (retry)");
                Transition(State::starting())
            }
            _ => Handled,
        }
    }
}

/// Map a machine state to the persisted record status.
pub fn status_of(state: &State) -> VmStatus {
    match state {
        State::Stopped {} => VmStatus::Stopped,
        State::Starting {} => VmStatus::Starting,
        State::Running {} => VmStatus::Running,
        State::Errored {} => VmStatus::Error,
    }
}
