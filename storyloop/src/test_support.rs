//! Test-only builders and fakes: stories, scripted agents and runners, scratch git repos.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::backlog::{Backlog, Story};
use crate::core::guardrail::GuardrailEntry;
use crate::engine::CancelFlag;
use crate::gates::GateOptions;
use crate::io::agent::{Agent, AgentRequest, AgentTranscript};
use crate::io::atomic::write_json_atomic;
use crate::io::config::{Config, GateSpec, GuardrailSettings, write_config};
use crate::io::guardrail_ledger::GuardrailLedger;
use crate::io::init::StatePaths;
use crate::io::process::{CommandOutcome, CommandRunner, CommandSpec};

/// Create a deterministic incomplete story with no criteria.
pub fn story(id: &str, priority: i64) -> Story {
    Story::new(id, format!("{id} title"), priority)
}

pub fn phased_story(id: &str, priority: i64, phase: u32) -> Story {
    Story {
        phase: Some(phase),
        ..story(id, priority)
    }
}

pub fn backlog(stories: Vec<Story>) -> Backlog {
    Backlog::new("demo", stories)
}

/// Gate options matching the default config.
pub fn gate_options() -> GateOptions {
    let guardrails = GuardrailSettings::default();
    GateOptions {
        stop_on_required_failure: true,
        output_limit_bytes: 200_000,
        diagnostic_lines: guardrails.max_lines,
        patterns: guardrails
            .pattern_set()
            .expect("default guardrail patterns compile"),
    }
}

/// Default config with a single required `test` gate and a finite iteration cap.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.engine.max_iterations = 20;
    config.gates = vec![GateSpec::new("test", "cargo test")];
    config
}

/// Command runner that replays canned outcomes in order and records every call.
pub struct ScriptedRunner {
    outcomes: RefCell<VecDeque<Result<CommandOutcome, String>>>,
    fallback: Option<Result<CommandOutcome, String>>,
    calls: RefCell<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new(outcomes: Vec<CommandOutcome>) -> Self {
        Self {
            outcomes: RefCell::new(outcomes.into_iter().map(Ok).collect()),
            fallback: None,
            calls: RefCell::new(Vec::new()),
        }
    }

    /// Every call fails to spawn with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            outcomes: RefCell::new(VecDeque::new()),
            fallback: Some(Err(message.to_string())),
            calls: RefCell::new(Vec::new()),
        }
    }

    /// Every call exits 0.
    pub fn passing() -> Self {
        Self {
            outcomes: RefCell::new(VecDeque::new()),
            fallback: Some(Ok(CommandOutcome::exited(0, "ok\n"))),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.borrow().clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome> {
        self.calls.borrow_mut().push(spec.clone());
        let next = self
            .outcomes
            .borrow_mut()
            .pop_front()
            .or_else(|| self.fallback.clone());
        match next {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted runner exhausted at `{}`", spec.display())),
        }
    }
}

/// One scripted agent invocation.
#[derive(Debug, Clone, Default)]
pub struct AgentScript {
    /// Files written into the working tree, relative to the workdir.
    pub files: Vec<(String, String)>,
    pub transcript: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub spawn_error: Option<String>,
    pub cancel: Option<CancelFlag>,
}

impl AgentScript {
    /// Write one file and exit 0.
    pub fn write(path: &str, contents: &str) -> Self {
        Self {
            files: vec![(path.to_string(), contents.to_string())],
            transcript: format!("wrote {path}\n"),
            exit_code: Some(0),
            ..Self::default()
        }
    }

    /// Change nothing and exit 0.
    pub fn idle() -> Self {
        Self {
            transcript: "nothing to do\n".to_string(),
            exit_code: Some(0),
            ..Self::default()
        }
    }

    pub fn exit(code: i32, transcript: &str) -> Self {
        Self {
            transcript: transcript.to_string(),
            exit_code: Some(code),
            ..Self::default()
        }
    }

    pub fn timeout() -> Self {
        Self {
            transcript: "still thinking\n".to_string(),
            timed_out: true,
            ..Self::default()
        }
    }

    pub fn spawn_error(message: &str) -> Self {
        Self {
            spawn_error: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Trip `flag` while this invocation runs.
    pub fn cancelling(mut self, flag: CancelFlag) -> Self {
        self.cancel = Some(flag);
        self
    }
}

/// Agent that replays [`AgentScript`]s and records the context it was given.
#[derive(Default)]
pub struct ScriptedAgent {
    scripts: RefCell<VecDeque<AgentScript>>,
    contexts: RefCell<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new(scripts: Vec<AgentScript>) -> Self {
        Self {
            scripts: RefCell::new(scripts.into()),
            contexts: RefCell::new(Vec::new()),
        }
    }

    pub fn invocations(&self) -> usize {
        self.contexts.borrow().len()
    }

    pub fn contexts(&self) -> Vec<String> {
        self.contexts.borrow().clone()
    }
}

impl Agent for ScriptedAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentTranscript> {
        self.contexts.borrow_mut().push(request.context.clone());
        let script = self
            .scripts
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent exhausted"))?;
        if let Some(flag) = &script.cancel {
            flag.cancel();
        }
        if let Some(message) = script.spawn_error {
            return Err(anyhow!(message));
        }
        for (rel, contents) in &script.files {
            let path = request.workdir.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        }
        Ok(AgentTranscript {
            transcript: script.transcript,
            exit_code: script.exit_code,
            duration: Duration::from_millis(5),
            timed_out: script.timed_out,
        })
    }
}

/// Scratch git repository with one initial commit on `main`.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let repo = Self { dir };
        repo.git(&["init", "-q", "-b", "main"])?;
        repo.git(&["config", "user.email", "loop@example.com"])?;
        repo.git(&["config", "user.name", "Story Loop"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        fs::write(repo.path().join("README.md"), "# demo\n").context("write README")?;
        repo.git(&["add", "README.md"])?;
        repo.git(&["commit", "-q", "-m", "initial"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn paths(&self) -> StatePaths {
        StatePaths::new(self.path())
    }

    pub fn git(&self, args: &[&str]) -> Result<String> {
        let out = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !out.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    pub fn last_commit_message(&self) -> Result<String> {
        Ok(self.git(&["log", "-1", "--format=%s"])?.trim().to_string())
    }

    pub fn commit_count(&self) -> Result<usize> {
        let out = self.git(&["rev-list", "--count", "HEAD"])?;
        out.trim().parse().context("parse commit count")
    }

    pub fn write_backlog(&self, stories: Vec<Story>) -> Result<()> {
        self.write_backlog_doc(&backlog(stories))
    }

    pub fn write_backlog_doc(&self, backlog: &Backlog) -> Result<()> {
        write_json_atomic(&self.paths().backlog_path, backlog)
    }

    pub fn write_config(&self, config: &Config) -> Result<()> {
        write_config(&self.paths().config_path, config)
    }

    pub fn read_backlog(&self) -> Result<Backlog> {
        let raw = fs::read_to_string(self.paths().backlog_path).context("read backlog")?;
        serde_json::from_str(&raw).context("parse backlog")
    }

    pub fn read_progress(&self) -> Result<String> {
        fs::read_to_string(self.paths().progress_path).context("read progress")
    }

    pub fn guardrails(&self) -> Result<Vec<GuardrailEntry>> {
        GuardrailLedger::new(self.paths().guardrails_path).entries()
    }
}
