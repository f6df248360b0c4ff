//! External agent abstraction.
//!
//! The [`Agent`] trait decouples the engine from the code-generation backend.
//! [`CommandAgent`] spawns a configured command through a [`CommandRunner`];
//! tests use scripted agents that edit the working tree directly.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::io::config::{AgentSettings, PromptVia};
use crate::io::process::{CommandRunner, CommandSpec};

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub context: String,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Stream the transcript here while the agent runs.
    pub stream_path: Option<PathBuf>,
}

/// Raw result of an invocation that ran to completion or to its deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentTranscript {
    pub transcript: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub timed_out: bool,
}

impl AgentTranscript {
    /// Classify an invocation; a timeout or non-zero exit fails the iteration.
    pub fn check(&self, timeout: Duration) -> Result<(), AgentError> {
        if self.timed_out {
            return Err(AgentError::TimedOut(timeout));
        }
        match self.exit_code {
            Some(0) => Ok(()),
            code => Err(AgentError::Exit(code)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("agent could not be started: {0}")]
    Spawn(String),
    #[error("agent timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
    #[error("agent exited with status {0:?}")]
    Exit(Option<i32>),
}

/// Abstraction over agent backends.
pub trait Agent {
    /// `Err` only when the agent could not be run at all.
    fn invoke(&self, request: &AgentRequest) -> Result<AgentTranscript>;
}

/// Agent that spawns a configured command line.
pub struct CommandAgent<R> {
    runner: R,
    settings: AgentSettings,
}

impl<R: CommandRunner> CommandAgent<R> {
    pub fn new(runner: R, settings: AgentSettings) -> Self {
        Self { runner, settings }
    }

    fn spec(&self, request: &AgentRequest) -> CommandSpec {
        let (program, args) = self
            .settings
            .command
            .split_first()
            .map(|(p, a)| (p.clone(), a.to_vec()))
            .unwrap_or_default();
        let mut spec = CommandSpec::new(program, &request.workdir)
            .timeout(request.timeout)
            .output_limit(request.output_limit_bytes);
        spec.args = args;
        match self.settings.prompt_via {
            PromptVia::Stdin => spec.stdin = Some(request.context.clone()),
            PromptVia::Argument => spec.args.push(request.context.clone()),
        }
        spec.stream_path = request.stream_path.clone();
        spec
    }
}

impl<R: CommandRunner> Agent for CommandAgent<R> {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, request: &AgentRequest) -> Result<AgentTranscript> {
        let spec = self.spec(request);
        info!(program = %spec.program, workdir = %request.workdir.display(), "invoking agent");
        let outcome = self.runner.run(&spec)?;
        if outcome.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
        } else if !outcome.success() {
            warn!(exit_code = ?outcome.exit_code, "agent exited non-zero");
        }
        Ok(AgentTranscript {
            transcript: outcome.combined_output(),
            exit_code: outcome.exit_code,
            duration: outcome.duration,
            timed_out: outcome.timed_out,
        })
    }
}
