//! Execution loop state machine.
//!
//! The engine drives one story per cycle through these states:
//!
//! ```text
//! Idle -> Selecting -> Invoking -> Gating -> Committing -> Logging -> Idle
//!   |                     |           |                       ^
//!   |                     +-----------+--(failure)------------+
//!   +-> Stopped(reason)
//! ```
//!
//! `transition` is pure; the engine calls it before each side effect so an
//! out-of-order step fails loudly instead of corrupting persisted state.

use thiserror::Error;

use crate::core::scheduler::StopReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Selecting,
    Invoking,
    Gating,
    Committing,
    Logging,
    Stopped(StopReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEvent {
    /// Stop check passed.
    Proceed,
    /// Stop check fired.
    Halt(StopReason),
    /// Story selected and marked in progress.
    StoryStarted,
    AgentReturned,
    AgentFailed,
    GatesPassed,
    GatesFailed,
    /// Commit attempt finished, whatever its outcome.
    CommitSettled,
    /// Ledgers and backlog written for the iteration.
    Recorded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal loop transition: {event:?} while {state:?}")]
pub struct IllegalTransition {
    pub state: LoopState,
    pub event: LoopEvent,
}

impl LoopState {
    pub fn is_stopped(self) -> bool {
        matches!(self, Self::Stopped(_))
    }
}

pub fn transition(state: LoopState, event: LoopEvent) -> Result<LoopState, IllegalTransition> {
    use LoopEvent as E;
    use LoopState as S;

    let next = match (state, event) {
        (S::Idle, E::Proceed) => S::Selecting,
        (S::Idle, E::Halt(reason)) => S::Stopped(reason),
        (S::Selecting, E::StoryStarted) => S::Invoking,
        (S::Invoking, E::AgentReturned) => S::Gating,
        (S::Invoking, E::AgentFailed) => S::Logging,
        (S::Gating, E::GatesPassed) => S::Committing,
        (S::Gating, E::GatesFailed) => S::Logging,
        (S::Committing, E::CommitSettled) => S::Logging,
        (S::Logging, E::Recorded) => S::Idle,
        _ => return Err(IllegalTransition { state, event }),
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(events: &[LoopEvent]) -> Result<LoopState, IllegalTransition> {
        events
            .iter()
            .try_fold(LoopState::Idle, |state, event| transition(state, *event))
    }

    #[test]
    fn passing_iteration_returns_to_idle() {
        let state = drive(&[
            LoopEvent::Proceed,
            LoopEvent::StoryStarted,
            LoopEvent::AgentReturned,
            LoopEvent::GatesPassed,
            LoopEvent::CommitSettled,
            LoopEvent::Recorded,
        ])
        .expect("legal path");
        assert_eq!(state, LoopState::Idle);
    }

    #[test]
    fn failures_skip_straight_to_logging() {
        let after_agent = drive(&[
            LoopEvent::Proceed,
            LoopEvent::StoryStarted,
            LoopEvent::AgentFailed,
        ])
        .expect("agent failure path");
        assert_eq!(after_agent, LoopState::Logging);

        let after_gates = drive(&[
            LoopEvent::Proceed,
            LoopEvent::StoryStarted,
            LoopEvent::AgentReturned,
            LoopEvent::GatesFailed,
        ])
        .expect("gate failure path");
        assert_eq!(after_gates, LoopState::Logging);
    }

    #[test]
    fn halt_is_only_legal_from_idle() {
        let stopped = drive(&[LoopEvent::Halt(StopReason::AllComplete)]).expect("halt");
        assert!(stopped.is_stopped());

        let err = drive(&[LoopEvent::Proceed, LoopEvent::Halt(StopReason::Interrupted)])
            .expect_err("halt mid-iteration");
        assert_eq!(err.state, LoopState::Selecting);
    }

    #[test]
    fn commit_cannot_precede_gates() {
        let err = drive(&[
            LoopEvent::Proceed,
            LoopEvent::StoryStarted,
            LoopEvent::CommitSettled,
        ])
        .expect_err("commit before gates");
        assert_eq!(err.event, LoopEvent::CommitSettled);
    }

    #[test]
    fn stopped_is_terminal() {
        let stopped = LoopState::Stopped(StopReason::MaxIterations);
        assert!(transition(stopped, LoopEvent::Proceed).is_err());
        assert!(transition(stopped, LoopEvent::Recorded).is_err());
    }
}
