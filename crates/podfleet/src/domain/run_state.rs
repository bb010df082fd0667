//! Run state machine for the whole fleet
//!
//! Purely reactive: [`RunStateMachine::apply`] validates an event against the
//! current state and tells the caller which [`Effect`] to perform. It owns no
//! timers and performs no I/O.

use error_stack::Report;
use serde::Serialize;

use super::types::{FleetError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, derive_more::Display)]
pub enum RunState {
    #[default]
    NotStarted,
    StartConfirm,
    InProgress,
    Completed,
    CancelConfirm,
    Cancelled,
    ResetConfirm,
    Collected,
}

impl RunState {
    /// States waiting on a user confirmation
    pub fn awaiting_confirmation(&self) -> bool {
        matches!(
            self,
            RunState::StartConfirm | RunState::CancelConfirm | RunState::ResetConfirm
        )
    }

    /// True once the run can no longer make progress on its own
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Cancelled | RunState::Collected
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunEvent {
    RequestStart,
    ConfirmStart,
    RequestCancel,
    ConfirmCancel,
    RequestReset,
    ConfirmReset,
    /// Answer "no" to whichever confirmation is pending
    Decline,
    /// The fleet finished its work, or the run deadline passed
    FleetFinished,
    /// Results have been gathered
    Collect,
}

/// Work the driver must carry out after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    /// Bring the fleet up and run the load test
    StartRun,
    /// Abort the running work and delete every worker
    Teardown,
    /// Prepare for another run, keeping healthy workers
    Rearm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: RunState,
    pub to: RunState,
    pub effect: Effect,
}

#[derive(Debug, Default)]
pub struct RunStateMachine {
    state: RunState,
    /// State to return to when a cancel or reset confirmation is declined
    resume: Option<RunState>,
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Apply `event`, or reject it and keep the current state.
    pub fn apply(&mut self, event: RunEvent) -> Result<Transition> {
        use RunEvent::*;
        use RunState::*;

        let from = self.state;
        let (to, effect) = match (from, event) {
            (NotStarted, RequestStart) => (StartConfirm, Effect::None),
            (StartConfirm, ConfirmStart) => (InProgress, Effect::StartRun),
            (StartConfirm, Decline) => (NotStarted, Effect::None),
            (InProgress, FleetFinished) => (Completed, Effect::None),
            (InProgress, RequestCancel) => (CancelConfirm, Effect::None),
            (CancelConfirm, ConfirmCancel) => (Cancelled, Effect::Teardown),
            (CancelConfirm, FleetFinished) => (Completed, Effect::None),
            (Completed, Collect) => (Collected, Effect::None),
            (Completed | Cancelled | Collected, RequestReset) => (ResetConfirm, Effect::None),
            (ResetConfirm, ConfirmReset) => (NotStarted, Effect::Rearm),
            (CancelConfirm | ResetConfirm, Decline) => match self.resume {
                Some(previous) => (previous, Effect::None),
                None => return Err(self.reject(event)),
            },
            _ => return Err(self.reject(event)),
        };

        self.resume = match to {
            CancelConfirm | ResetConfirm => Some(from),
            _ => None,
        };
        self.state = to;

        Ok(Transition { from, to, effect })
    }

    fn reject(&self, event: RunEvent) -> Report<FleetError> {
        Report::new(FleetError::InvalidTransition {
            from: self.state,
            event,
        })
    }
}
