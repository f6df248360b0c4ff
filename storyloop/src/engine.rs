//! Execution loop driver.
//!
//! One story per iteration, strictly sequential:
//!
//! 1. stop check (all complete, max iterations, too many failures, interrupted)
//! 2. select the next story, mark it `in_progress`, persist
//! 3. build context from recent progress and every guardrail
//! 4. invoke the agent
//! 5. run quality gates
//! 6. on pass: commit (or no-op), mark `complete`, append progress, persist
//! 7. on failure: release the story, append progress, maybe add a guardrail, persist
//!
//! Each step is gated by [`crate::core::machine::transition`]. Agent, gate and
//! commit errors fail the iteration; persistence errors end the run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::commit::{CommitManager, CommitOutcome};
use crate::core::backlog::{Backlog, Story};
use crate::core::guardrail::{
    Diagnostic, FailureDiagnostic, FailureTracker, GuardrailEntry, SignatureExtractor,
};
use crate::core::machine::{LoopEvent, LoopState, transition};
use crate::core::progress::{ProgressEntry, excerpt};
use crate::core::scheduler::{Scheduler, StopPolicy, StopReason};
use crate::core::types::{FailureKind, IterationStatus};
use crate::error::EngineError;
use crate::gates::{GateOptions, GateReport, GateRunner};
use crate::io::agent::{Agent, AgentError, AgentRequest, AgentTranscript};
use crate::io::backlog_store::BacklogStore;
use crate::io::config::Config;
use crate::io::context::{ContextAssembler, ContextInput};
use crate::io::git::Vcs;
use crate::io::guardrail_ledger::GuardrailLedger;
use crate::io::init::{STATE_DIR_NAME, StatePaths};
use crate::io::iteration_log::{IterationMeta, IterationPaths};
use crate::io::process::{ActiveChild, CommandRunner};
use crate::io::progress_ledger::ProgressLedger;

/// Shared cancellation flag, observed only at the top of each iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Ctrl-C policy for `run`.
///
/// Children run in their own process group, so the terminal's SIGINT never
/// reaches them. The first interrupt only sets the [`CancelFlag`]: the running
/// iteration finishes and is recorded. The second kills the active child's
/// process group and asks the caller to exit.
#[derive(Debug, Clone)]
pub struct InterruptHandler {
    cancel: CancelFlag,
    active: ActiveChild,
}

impl InterruptHandler {
    pub fn new(cancel: CancelFlag, active: ActiveChild) -> Self {
        Self { cancel, active }
    }

    /// Returns `true` when the process should exit now.
    pub fn interrupt(&self) -> bool {
        if !self.cancel.is_cancelled() {
            info!("interrupt received; stopping after the current iteration");
            self.cancel.cancel();
            return false;
        }
        if !self.active.kill_group() {
            debug!("no active child to kill");
        }
        true
    }
}

/// Per-run overrides of the configured limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub phase: Option<u32>,
    pub max_iterations: Option<u32>,
}

/// What happened in one iteration, reported to the caller's callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationReport {
    pub iteration: u32,
    pub story_id: String,
    pub status: IterationStatus,
    pub failure_kind: Option<FailureKind>,
    pub commit: Option<CommitOutcome>,
    pub guardrail_added: bool,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub stop: StopReason,
    pub iterations: u32,
    pub passed: u32,
    pub failed: u32,
}

struct IterationFailure {
    kind: FailureKind,
    detail: String,
    diagnostics: Vec<FailureDiagnostic>,
}

impl IterationFailure {
    /// Only iteration-scoped errors become failures; anything else ends the run.
    fn from_error(
        error: EngineError,
        diagnostics: Vec<FailureDiagnostic>,
    ) -> Result<Self, EngineError> {
        match error.iteration_failure_kind() {
            Some(kind) => Ok(Self {
                kind,
                detail: error.to_string(),
                diagnostics,
            }),
            None => Err(error),
        }
    }
}

struct Attempt {
    transcript: Option<AgentTranscript>,
    gates: Option<GateReport>,
    result: Result<CommitOutcome, IterationFailure>,
}

pub struct Engine<'a, A: ?Sized, R: ?Sized, V> {
    config: &'a Config,
    paths: StatePaths,
    agent: &'a A,
    runner: &'a R,
    assembler: &'a dyn ContextAssembler,
    commits: CommitManager<V>,
    progress: ProgressLedger,
    guardrails: GuardrailLedger,
    extractor: Box<dyn SignatureExtractor>,
    gate_options: GateOptions,
    cancel: CancelFlag,
    state: LoopState,
}

impl<'a, A, R, V> Engine<'a, A, R, V>
where
    A: Agent + ?Sized,
    R: CommandRunner + ?Sized,
    V: Vcs,
{
    pub fn new(
        config: &'a Config,
        paths: StatePaths,
        agent: &'a A,
        runner: &'a R,
        vcs: V,
        assembler: &'a dyn ContextAssembler,
    ) -> anyhow::Result<Self> {
        let gate_options = GateOptions {
            stop_on_required_failure: config.gate_runner.stop_on_required_failure,
            output_limit_bytes: config.engine.output_limit_bytes,
            diagnostic_lines: config.guardrails.max_lines,
            patterns: config.guardrails.pattern_set()?,
        };
        Ok(Self {
            commits: CommitManager::new(
                vcs,
                config.git.commit_message_format.clone(),
                vec![STATE_DIR_NAME.to_string()],
            ),
            progress: ProgressLedger::new(&paths.progress_path),
            guardrails: GuardrailLedger::new(&paths.guardrails_path),
            extractor: config.guardrails.extractor(),
            gate_options,
            config,
            paths,
            agent,
            runner,
            assembler,
            cancel: CancelFlag::new(),
            state: LoopState::Idle,
        })
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    fn advance(&mut self, event: LoopEvent) -> Result<(), EngineError> {
        let next = transition(self.state, event)?;
        debug!(from = ?self.state, to = ?next, "loop transition");
        self.state = next;
        Ok(())
    }

    /// Run iterations until a stop condition fires.
    ///
    /// `on_iteration` is called after each iteration has been persisted.
    #[instrument(skip_all, fields(phase = ?options.phase))]
    pub fn run<F>(&mut self, options: RunOptions, mut on_iteration: F) -> Result<RunOutcome, EngineError>
    where
        F: FnMut(&IterationReport),
    {
        let policy = StopPolicy {
            max_iterations: options
                .max_iterations
                .unwrap_or(self.config.engine.max_iterations),
            max_failures: self.config.engine.max_failures,
        };
        let scheduler = Scheduler::new(policy, options.phase);
        let store = BacklogStore::new(&self.paths.backlog_path);
        let mut backlog = store.load()?;
        refuse_in_progress(&backlog)?;

        self.state = LoopState::Idle;
        let mut tracker = FailureTracker::default();
        let mut outcome = RunOutcome {
            stop: StopReason::AllComplete,
            iterations: 0,
            passed: 0,
            failed: 0,
        };
        let mut worktree_ready = false;

        loop {
            if let Some(reason) = scheduler.should_stop(
                &backlog,
                outcome.iterations,
                tracker.consecutive(),
                self.cancel.is_cancelled(),
            ) {
                self.advance(LoopEvent::Halt(reason))?;
                info!(
                    reason = reason.as_str(),
                    iterations = outcome.iterations,
                    passed = outcome.passed,
                    failed = outcome.failed,
                    "run stopped"
                );
                outcome.stop = reason;
                return Ok(outcome);
            }
            self.advance(LoopEvent::Proceed)?;

            if !worktree_ready {
                self.prepare_worktree(&backlog)?;
                worktree_ready = true;
            }

            let story_id = scheduler
                .select_next(&backlog)
                .map(|story| story.id.clone())
                .ok_or_else(|| {
                    EngineError::Scheduling("no eligible story although work remains".to_string())
                })?;
            outcome.iterations += 1;

            let report = self.iterate(&store, &mut backlog, &story_id, &mut tracker)?;
            match report.status {
                IterationStatus::Passed => outcome.passed += 1,
                IterationStatus::Failed => outcome.failed += 1,
            }
            on_iteration(&report);
        }
    }

    /// Branch checkout and clean-tree check, once per run before the first iteration.
    fn prepare_worktree(&self, backlog: &Backlog) -> Result<(), EngineError> {
        let vcs = self.commits.vcs();
        if self.config.git.require_clean {
            let dirty = vcs.changed_paths(self.commits.excluded())?;
            if !dirty.is_empty() {
                let listing: Vec<String> = dirty
                    .iter()
                    .map(|entry| format!("{} {}", entry.code, entry.path))
                    .collect();
                return Err(anyhow!(
                    "working tree not clean (commit or stash first):\n{}",
                    listing.join("\n")
                )
                .into());
            }
        }
        if self.config.git.switch_branch
            && let Some(branch) = backlog.branch_name.as_deref().filter(|b| !b.trim().is_empty())
        {
            let current = vcs.current_branch()?;
            if current != branch {
                info!(from = %current, to = %branch, "switching branch");
                vcs.switch_branch(branch)?;
            }
        }
        Ok(())
    }

    fn iterate(
        &mut self,
        store: &BacklogStore,
        backlog: &mut Backlog,
        story_id: &str,
        tracker: &mut FailureTracker,
    ) -> Result<IterationReport, EngineError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let iteration = backlog.metadata.current_iteration + 1;
        backlog.metadata.current_iteration = iteration;

        let story = story_mut(backlog, story_id)?;
        story
            .start(started_at)
            .map_err(|e| EngineError::Scheduling(e.to_string()))?;
        let story = story.clone();
        store
            .save(backlog, started_at)
            .map_err(EngineError::persistence)?;
        self.advance(LoopEvent::StoryStarted)?;
        info!(iteration, story_id, title = %story.title, "iteration started");

        let started = IterationPaths::create(&self.paths.logs_dir, iteration)
            .map_err(EngineError::persistence)
            .and_then(|log| {
                let attempt = self.attempt(backlog, &story, iteration, &log)?;
                Ok((log, attempt))
            });
        let (log, attempt) = match started {
            Ok(started) => started,
            Err(err) => {
                abandon(store, backlog, story_id);
                return Err(err);
            }
        };
        let duration = clock.elapsed();
        let now = Utc::now();

        let gate_results = attempt
            .gates
            .as_ref()
            .map(GateReport::summaries)
            .unwrap_or_default();
        let mut entry = ProgressEntry {
            iteration,
            story_id: story.id.clone(),
            story_title: story.title.clone(),
            timestamp: now,
            status: IterationStatus::Passed,
            duration_seconds: crate::core::types::rounded_secs(duration),
            gate_results: gate_results.clone(),
            failure_kind: None,
            detail: None,
            commit: None,
            transcript_excerpt: attempt
                .transcript
                .as_ref()
                .map(|t| excerpt(&t.transcript))
                .unwrap_or_default(),
        };
        let mut guardrail = None;

        match &attempt.result {
            Ok(commit) => {
                story_mut(backlog, story_id)?
                    .complete(duration, iteration)
                    .map_err(|e| EngineError::Scheduling(e.to_string()))?;
                tracker.record_success(story_id);
                entry.commit = commit.sha().map(str::to_string);
                info!(iteration, story_id, commit = ?commit.sha(), "story complete");
            }
            Err(failure) => {
                story_mut(backlog, story_id)?
                    .release()
                    .map_err(|e| EngineError::Scheduling(e.to_string()))?;
                let count = tracker.record_failure(story_id);
                let signature = self.extractor.extract(&failure.diagnostics);
                entry.status = IterationStatus::Failed;
                entry.failure_kind = Some(failure.kind);
                entry.detail = Some(format!("{}\n{signature}", failure.detail));
                warn!(
                    iteration,
                    story_id,
                    kind = %failure.kind,
                    story_failures = count,
                    consecutive = tracker.consecutive(),
                    "iteration failed"
                );
                if count == self.config.engine.guardrail_threshold {
                    guardrail = Some(GuardrailEntry::new(
                        &story,
                        count,
                        &failure.diagnostics,
                        self.extractor.as_ref(),
                        now,
                    ));
                }
            }
        }

        self.progress
            .append(&entry, now)
            .map_err(EngineError::persistence)?;
        let guardrail_added = guardrail.is_some();
        if let Some(guardrail) = guardrail {
            self.guardrails
                .append(guardrail)
                .map_err(EngineError::persistence)?;
        }
        store.save(backlog, now).map_err(EngineError::persistence)?;

        let commit = attempt.result.as_ref().ok().cloned();
        log.write_meta(&IterationMeta {
            iteration,
            story_id: story.id.clone(),
            status: entry.status,
            failure_kind: entry.failure_kind,
            detail: entry.detail.clone(),
            started_at,
            ended_at: now,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            agent_exit_code: attempt.transcript.as_ref().and_then(|t| t.exit_code),
            gates: gate_results,
            commit: entry.commit.clone(),
        })
        .map_err(EngineError::persistence)?;
        self.advance(LoopEvent::Recorded)?;

        Ok(IterationReport {
            iteration,
            story_id: story.id,
            status: entry.status,
            failure_kind: entry.failure_kind,
            commit,
            guardrail_added,
            duration,
        })
    }

    /// Context, agent, gates, commit. Returns `Err` only for run-ending errors.
    fn attempt(
        &mut self,
        backlog: &Backlog,
        story: &Story,
        iteration: u32,
        log: &IterationPaths,
    ) -> Result<Attempt, EngineError> {
        let config = self.config;
        let engine = &config.engine;
        let recent = self
            .progress
            .recent(engine.progress_context_entries)
            .map_err(EngineError::persistence)?;
        let guardrails = self
            .guardrails
            .entries()
            .map_err(EngineError::persistence)?;
        let context = self.assembler.build(&ContextInput {
            iteration,
            backlog,
            story,
            recent_progress: &recent,
            guardrails: &guardrails,
            gates: &config.gates,
        })?;
        log.write_context(&context)
            .map_err(EngineError::persistence)?;

        let timeout = engine.iteration_timeout();
        let request = AgentRequest {
            context,
            workdir: self.paths.root.clone(),
            timeout,
            output_limit_bytes: engine.output_limit_bytes,
            stream_path: Some(log.agent_stream_path.clone()),
        };
        let transcript = match self.agent.invoke(&request) {
            Ok(transcript) => transcript,
            Err(err) => {
                self.advance(LoopEvent::AgentFailed)?;
                let message = format!("{err:#}");
                let failure = IterationFailure::from_error(
                    AgentError::Spawn(message.clone()).into(),
                    vec![FailureDiagnostic {
                        source: "agent".to_string(),
                        diagnostic: Diagnostic::message(message),
                    }],
                )?;
                return Ok(Attempt {
                    transcript: None,
                    gates: None,
                    result: Err(failure),
                });
            }
        };
        log.write_agent_log(transcript.exit_code, transcript.timed_out, &transcript.transcript)
            .map_err(EngineError::persistence)?;

        if let Err(err) = transcript.check(timeout) {
            self.advance(LoopEvent::AgentFailed)?;
            let diagnostic = Diagnostic::from_output(
                &transcript.transcript,
                transcript.exit_code,
                transcript.timed_out,
                self.gate_options.diagnostic_lines,
                &self.gate_options.patterns,
            );
            let failure = IterationFailure::from_error(
                err.into(),
                vec![FailureDiagnostic {
                    source: "agent".to_string(),
                    diagnostic,
                }],
            )?;
            return Ok(Attempt {
                transcript: Some(transcript),
                gates: None,
                result: Err(failure),
            });
        }
        self.advance(LoopEvent::AgentReturned)?;

        let report = GateRunner::new(self.runner, &self.paths.root, self.gate_options.clone())
            .run(&config.gates);
        for result in &report.results {
            if !result.output.is_empty() {
                log.write_gate_log(&result.name, &result.output)
                    .map_err(EngineError::persistence)?;
            }
        }
        if !report.passed() {
            self.advance(LoopEvent::GatesFailed)?;
            let failed: Vec<&str> = report.failed_required().map(|r| r.name.as_str()).collect();
            let failure = if report.has_execution_error() {
                IterationFailure::from_error(
                    EngineError::GateExecution(failed.join(", ")),
                    report.failure_diagnostics(),
                )?
            } else {
                IterationFailure {
                    kind: FailureKind::GatesFailed,
                    detail: format!("required gates failed: {}", failed.join(", ")),
                    diagnostics: report.failure_diagnostics(),
                }
            };
            return Ok(Attempt {
                transcript: Some(transcript),
                gates: Some(report),
                result: Err(failure),
            });
        }
        self.advance(LoopEvent::GatesPassed)?;

        let committed = self.commits.commit_if_changed(story);
        self.advance(LoopEvent::CommitSettled)?;
        let result = match committed {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let diagnostic = Diagnostic::message(err.message.clone());
                Err(IterationFailure::from_error(
                    err.into(),
                    vec![FailureDiagnostic {
                        source: "commit".to_string(),
                        diagnostic,
                    }],
                )?)
            }
        };
        Ok(Attempt {
            transcript: Some(transcript),
            gates: Some(report),
            result,
        })
    }
}

fn story_mut<'b>(backlog: &'b mut Backlog, story_id: &str) -> Result<&'b mut Story, EngineError> {
    backlog
        .story_mut(story_id)
        .ok_or_else(|| EngineError::Scheduling(format!("story '{story_id}' not found in backlog")))
}

/// Hand a started story back before a run-ending error propagates.
fn abandon(store: &BacklogStore, backlog: &mut Backlog, story_id: &str) {
    match backlog.story_mut(story_id).map(Story::release) {
        Some(Ok(())) => {}
        Some(Err(err)) => warn!(story_id, error = %err, "could not release story"),
        None => return,
    }
    if let Err(err) = store.save(backlog, Utc::now()) {
        warn!(story_id, error = %format!("{err:#}"), "could not persist released story");
    } else {
        warn!(story_id, "iteration aborted; story released");
    }
}

/// Single-flight: a story left `in_progress` means an earlier run died mid-iteration.
fn refuse_in_progress(backlog: &Backlog) -> Result<(), EngineError> {
    let stuck: Vec<&str> = backlog.in_progress().map(|s| s.id.as_str()).collect();
    if stuck.is_empty() {
        return Ok(());
    }
    Err(EngineError::Scheduling(format!(
        "stories left in_progress by an interrupted run: {} (run `storyloop reset-stale` to release them)",
        stuck.join(", ")
    )))
}
