//! Shared result types recorded per iteration.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of a single quality gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pass,
    Fail,
    Timeout,
    /// The gate command could not be started.
    Error,
    /// Not run because an earlier required gate failed.
    Skipped,
}

impl GateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Timeout => "timeout",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::Fail | Self::Timeout | Self::Error)
    }
}

impl fmt::Display for GateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateSummary {
    pub name: String,
    pub status: GateStatus,
    pub duration_seconds: f64,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    Passed,
    Failed,
}

impl IterationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
        }
    }
}

/// Why an iteration failed. Every kind is retried on a later pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    GatesFailed,
    AgentInvocation,
    GateExecution,
    Commit,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GatesFailed => "gates_failed",
            Self::AgentInvocation => "agent_invocation",
            Self::GateExecution => "gate_execution",
            Self::Commit => "commit",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seconds rounded to one decimal, as written to ledgers.
pub fn rounded_secs(duration: std::time::Duration) -> f64 {
    (duration.as_secs_f64() * 10.0).round() / 10.0
}
