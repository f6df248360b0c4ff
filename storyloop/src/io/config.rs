//! Engine configuration stored under `.storyloop/config.toml`.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::guardrail::{HeadLines, MatchedLines, SignatureExtractor};
use crate::io::atomic::write_atomic;

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields take the
/// defaults below; a missing file is the same as an empty one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub engine: EngineSettings,
    pub agent: AgentSettings,
    pub gate_runner: GateRunnerSettings,
    pub git: GitSettings,
    pub guardrails: GuardrailSettings,
    /// Quality gates, run in declaration order.
    pub gates: Vec<GateSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineSettings {
    /// Iterations per run; 0 means unlimited.
    pub max_iterations: u32,
    /// Consecutive failed iterations (any story) before the run stops.
    pub max_failures: u32,
    /// Wall-clock budget for one agent invocation.
    pub iteration_timeout_secs: u64,
    /// Recent progress entries included in each context.
    pub progress_context_entries: usize,
    /// Captured bytes kept per stream of each subprocess.
    pub output_limit_bytes: usize,
    /// Consecutive failures of one story before a guardrail is recorded.
    pub guardrail_threshold: u32,
    /// Soft cap on rendered context size; droppable sections go first.
    pub context_budget_bytes: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_iterations: 0,
            max_failures: 3,
            iteration_timeout_secs: 60 * 60,
            progress_context_entries: 5,
            output_limit_bytes: 200_000,
            guardrail_threshold: 2,
            context_budget_bytes: 64_000,
        }
    }
}

impl EngineSettings {
    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PromptVia {
    /// Context is written to the agent's stdin.
    Stdin,
    /// Context is appended as the final argument.
    #[default]
    Argument,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentSettings {
    /// Agent command line, program first.
    pub command: Vec<String>,
    pub prompt_via: PromptVia,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "--dangerously-skip-permissions".to_string(),
                "--print".to_string(),
            ],
            prompt_via: PromptVia::Argument,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GateRunnerSettings {
    /// Record the remaining gates as skipped after a required gate fails.
    pub stop_on_required_failure: bool,
}

impl Default for GateRunnerSettings {
    fn default() -> Self {
        Self {
            stop_on_required_failure: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitSettings {
    /// Supports `{story_id}` and `{story_title}`.
    pub commit_message_format: String,
    /// Check out the backlog's `branchName` before the first iteration.
    pub switch_branch: bool,
    /// Refuse to start with uncommitted changes outside the state directory.
    pub require_clean: bool,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            commit_message_format: "feat: {story_id} - {story_title}".to_string(),
            switch_branch: true,
            require_clean: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignatureStrategy {
    #[default]
    Head,
    Matched,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GuardrailSettings {
    pub signature: SignatureStrategy,
    /// Lines kept per diagnostic and per signature.
    pub max_lines: usize,
    /// Regexes marking error lines in command output.
    pub patterns: Vec<String>,
}

impl Default for GuardrailSettings {
    fn default() -> Self {
        Self {
            signature: SignatureStrategy::Head,
            max_lines: 20,
            patterns: vec![
                r"(?i)\berror\b".to_string(),
                r"(?i)\bfailed\b".to_string(),
                r"panicked at".to_string(),
                r"^E\s".to_string(),
            ],
        }
    }
}

impl GuardrailSettings {
    pub fn pattern_set(&self) -> Result<RegexSet> {
        RegexSet::new(&self.patterns).context("compile guardrails.patterns")
    }

    pub fn extractor(&self) -> Box<dyn SignatureExtractor> {
        match self.signature {
            SignatureStrategy::Head => Box::new(HeadLines {
                max_lines: self.max_lines,
            }),
            SignatureStrategy::Matched => Box::new(MatchedLines {
                max_lines: self.max_lines,
            }),
        }
    }
}

/// One quality gate: a shell command that must exit 0.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateSpec {
    pub name: String,
    pub command: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default = "default_gate_timeout")]
    pub timeout_secs: u64,
}

fn default_required() -> bool {
    true
}

fn default_gate_timeout() -> u64 {
    300
}

impl GateSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            required: true,
            timeout_secs: default_gate_timeout(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineSettings::default(),
            agent: AgentSettings::default(),
            gate_runner: GateRunnerSettings::default(),
            git: GitSettings::default(),
            guardrails: GuardrailSettings::default(),
            gates: vec![GateSpec {
                name: "ci".to_string(),
                command: "just ci".to_string(),
                required: true,
                timeout_secs: 600,
            }],
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        if engine.max_failures == 0 {
            return Err(anyhow!("engine.max_failures must be > 0"));
        }
        if engine.iteration_timeout_secs == 0 {
            return Err(anyhow!("engine.iteration_timeout_secs must be > 0"));
        }
        if engine.output_limit_bytes == 0 {
            return Err(anyhow!("engine.output_limit_bytes must be > 0"));
        }
        if engine.guardrail_threshold == 0 {
            return Err(anyhow!("engine.guardrail_threshold must be > 0"));
        }
        if engine.context_budget_bytes == 0 {
            return Err(anyhow!("engine.context_budget_bytes must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.git.commit_message_format.trim().is_empty() {
            return Err(anyhow!("git.commit_message_format must not be empty"));
        }
        if self.guardrails.max_lines == 0 {
            return Err(anyhow!("guardrails.max_lines must be > 0"));
        }
        self.guardrails.pattern_set()?;

        let mut names = HashSet::new();
        for gate in &self.gates {
            if gate.name.trim().is_empty() {
                return Err(anyhow!("gates: every gate needs a name"));
            }
            if !names.insert(gate.name.as_str()) {
                return Err(anyhow!("gates: duplicate gate name '{}'", gate.name));
            }
            if gate.command.trim().is_empty() {
                return Err(anyhow!("gates.{}: command must not be empty", gate.name));
            }
            if gate.timeout_secs == 0 {
                return Err(anyhow!("gates.{}: timeout_secs must be > 0", gate.name));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `Config::default()`.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = Config::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &Config) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = Config::default();
        cfg.gates.push(GateSpec::new("lint", "cargo clippy"));
        cfg.guardrails.signature = SignatureStrategy::Matched;
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            r#"
[engine]
max_iterations = 10

[agent]
command = ["my-agent", "--yes"]
prompt_via = "stdin"

[[gates]]
name = "typecheck"
command = "tsc --noEmit"

[[gates]]
name = "lint"
command = "eslint ."
required = false
timeout_secs = 120
"#,
        )
        .expect("write config");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.engine.max_iterations, 10);
        assert_eq!(cfg.engine.max_failures, 3);
        assert_eq!(cfg.agent.prompt_via, PromptVia::Stdin);
        assert_eq!(cfg.gates.len(), 2);
        assert!(cfg.gates[0].required);
        assert_eq!(cfg.gates[0].timeout_secs, 300);
        assert!(!cfg.gates[1].required);
        assert!(cfg.git.require_clean);
    }

    #[test]
    fn rejects_duplicate_gate_names() {
        let mut cfg = Config::default();
        cfg.gates.push(GateSpec::new("ci", "make test"));
        let err = cfg.validate().expect_err("duplicate");
        assert!(err.to_string().contains("duplicate gate name 'ci'"));
    }

    #[test]
    fn rejects_bad_patterns_and_zero_limits() {
        let mut cfg = Config::default();
        cfg.guardrails.patterns = vec!["(unclosed".to_string()];
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.engine.max_failures = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.agent.command.clear();
        assert!(cfg.validate().is_err());
    }
}
