//! Engine error taxonomy.
//!
//! Agent, gate and commit errors end an iteration, not the run: the engine
//! records them as failed iterations and the story is retried later.
//! `Scheduling` and `Persistence` end the run.

use thiserror::Error;

use crate::commit::CommitError;
use crate::core::machine::IllegalTransition;
use crate::core::types::FailureKind;
use crate::io::agent::AgentError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The backlog is in a state the loop cannot schedule from.
    #[error("scheduling error: {0}")]
    Scheduling(String),

    #[error(transparent)]
    AgentInvocation(#[from] AgentError),

    #[error("gate execution failed: {0}")]
    GateExecution(String),

    #[error(transparent)]
    Commit(#[from] CommitError),

    /// A ledger or the backlog could not be written.
    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error(transparent)]
    Transition(#[from] IllegalTransition),

    /// Setup problems: invalid config or backlog, git preflight.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn persistence(err: anyhow::Error) -> Self {
        Self::Persistence(format!("{err:#}"))
    }

    /// Failure kind when this error ends an iteration rather than the run.
    pub fn iteration_failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::AgentInvocation(_) => Some(FailureKind::AgentInvocation),
            Self::GateExecution(_) => Some(FailureKind::GateExecution),
            Self::Commit(_) => Some(FailureKind::Commit),
            Self::Scheduling(_) | Self::Persistence(_) | Self::Transition(_) | Self::Other(_) => {
                None
            }
        }
    }
}
