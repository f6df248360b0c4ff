//! Quality gate runner.
//!
//! Gates run sequentially, one isolated `sh -c` subprocess each, in the
//! project working tree. A gate passes iff it exits 0 within its timeout. The
//! report passes iff every required gate passed. No retries.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use regex::RegexSet;
use tracing::{info, instrument, warn};

use crate::core::guardrail::{Diagnostic, FailureDiagnostic};
use crate::core::types::{GateStatus, GateSummary, rounded_secs};
use crate::io::config::GateSpec;
use crate::io::process::{CommandRunner, CommandSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateResult {
    pub name: String,
    pub required: bool,
    pub status: GateStatus,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    /// Combined stdout and stderr; partial when the gate timed out.
    pub output: String,
    pub diagnostic: Diagnostic,
}

impl GateResult {
    fn skipped(spec: &GateSpec) -> Self {
        Self {
            name: spec.name.clone(),
            required: spec.required,
            status: GateStatus::Skipped,
            exit_code: None,
            duration: Duration::ZERO,
            output: String::new(),
            diagnostic: Diagnostic::default(),
        }
    }

    pub fn summary(&self) -> GateSummary {
        GateSummary {
            name: self.name.clone(),
            status: self.status,
            duration_seconds: rounded_secs(self.duration),
            exit_code: self.exit_code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateReport {
    pub verdict: Verdict,
    pub results: Vec<GateResult>,
    pub total_duration: Duration,
}

impl GateReport {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    /// Required gates that did not pass.
    pub fn failed_required(&self) -> impl Iterator<Item = &GateResult> {
        self.results
            .iter()
            .filter(|r| r.required && r.status.is_failure())
    }

    /// True when a required gate could not be run at all.
    pub fn has_execution_error(&self) -> bool {
        self.failed_required().any(|r| r.status == GateStatus::Error)
    }

    pub fn summaries(&self) -> Vec<GateSummary> {
        self.results.iter().map(GateResult::summary).collect()
    }

    pub fn failure_diagnostics(&self) -> Vec<FailureDiagnostic> {
        self.failed_required()
            .map(|r| FailureDiagnostic {
                source: r.name.clone(),
                diagnostic: r.diagnostic.clone(),
            })
            .collect()
    }
}

/// Knobs shared by every gate in a run.
#[derive(Debug, Clone)]
pub struct GateOptions {
    pub stop_on_required_failure: bool,
    pub output_limit_bytes: usize,
    /// Lines kept in each diagnostic.
    pub diagnostic_lines: usize,
    pub patterns: RegexSet,
}

pub struct GateRunner<'a, R: ?Sized> {
    runner: &'a R,
    workdir: PathBuf,
    options: GateOptions,
}

impl<'a, R: CommandRunner + ?Sized> GateRunner<'a, R> {
    pub fn new(runner: &'a R, workdir: impl Into<PathBuf>, options: GateOptions) -> Self {
        Self {
            runner,
            workdir: workdir.into(),
            options,
        }
    }

    #[instrument(skip_all, fields(gates = gates.len()))]
    pub fn run(&self, gates: &[GateSpec]) -> GateReport {
        let started = Instant::now();
        let mut results = Vec::with_capacity(gates.len());
        let mut halted = false;

        for gate in gates {
            if halted {
                results.push(GateResult::skipped(gate));
                continue;
            }
            let result = self.run_one(gate);
            if result.required && result.status.is_failure() && self.options.stop_on_required_failure {
                halted = true;
            }
            results.push(result);
        }

        let verdict = if results.iter().any(|r| r.required && r.status != GateStatus::Pass) {
            Verdict::Fail
        } else {
            Verdict::Pass
        };
        info!(?verdict, "quality gates finished");
        GateReport {
            verdict,
            results,
            total_duration: started.elapsed(),
        }
    }

    fn run_one(&self, gate: &GateSpec) -> GateResult {
        let spec = CommandSpec::shell(&gate.command, &self.workdir)
            .timeout(gate.timeout())
            .output_limit(self.options.output_limit_bytes);
        let started = Instant::now();

        let outcome = match self.runner.run(&spec) {
            Ok(outcome) => outcome,
            Err(err) => {
                let message = format!("gate '{}' could not be run: {err:#}", gate.name);
                warn!(gate = %gate.name, "{message}");
                return GateResult {
                    name: gate.name.clone(),
                    required: gate.required,
                    status: GateStatus::Error,
                    exit_code: None,
                    duration: started.elapsed(),
                    diagnostic: Diagnostic::message(message.clone()),
                    output: message,
                };
            }
        };

        let status = if outcome.timed_out {
            GateStatus::Timeout
        } else if outcome.exit_code == Some(0) {
            GateStatus::Pass
        } else {
            GateStatus::Fail
        };
        let output = outcome.combined_output();
        let diagnostic = Diagnostic::from_output(
            &output,
            outcome.exit_code,
            outcome.timed_out,
            self.options.diagnostic_lines,
            &self.options.patterns,
        );
        if status.is_failure() {
            warn!(gate = %gate.name, status = %status, exit_code = ?outcome.exit_code, "gate failed");
        } else {
            info!(gate = %gate.name, "gate passed");
        }
        GateResult {
            name: gate.name.clone(),
            required: gate.required,
            status,
            exit_code: outcome.exit_code,
            duration: outcome.duration,
            output,
            diagnostic,
        }
    }
}
