//! Operator tools behind `storyloop status|select|validate|skip|close-phase|reset-stale|guardrails`.
//!
//! Each tool loads `.storyloop/backlog.json`, applies one change through the
//! same status transitions the engine uses, and writes the document back.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::info;

use crate::core::backlog::BacklogSummary;
use crate::core::invariants::{ValidationReport, validate_backlog};
use crate::core::scheduler::select_next;
use crate::io::backlog_store::BacklogStore;
use crate::io::config::load_config;
use crate::io::guardrail_ledger::{GuardrailLedger, render_markdown};
use crate::io::init::StatePaths;

/// Story the scheduler would run next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedStory {
    pub id: String,
    pub title: String,
    pub priority: i64,
    pub phase: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResetOptions {
    pub max_age_hours: u32,
    /// Release every in-progress story regardless of age.
    pub all: bool,
}

fn store(root: &Path) -> BacklogStore {
    BacklogStore::new(StatePaths::new(root).backlog_path)
}

pub fn status(root: &Path) -> Result<BacklogSummary> {
    Ok(store(root).load()?.summary())
}

pub fn render_status(summary: &BacklogSummary) -> String {
    let mut out = String::new();
    let project = if summary.project.is_empty() {
        "(unnamed project)"
    } else {
        summary.project.as_str()
    };
    let _ = writeln!(out, "{project}: {:.0}% done", summary.percent_done());
    let _ = writeln!(
        out,
        "  total {}, complete {}, skipped {}, remaining {}, iteration {}",
        summary.total,
        summary.completed,
        summary.skipped,
        summary.remaining,
        summary.current_iteration
    );
    for phase in &summary.phases {
        let name = if phase.name.is_empty() {
            String::new()
        } else {
            format!(" {}", phase.name)
        };
        let _ = writeln!(
            out,
            "  phase {}{name}: {}/{} complete, {} skipped{}",
            phase.number,
            phase.completed,
            phase.total,
            phase.skipped,
            if phase.closed { " [closed]" } else { "" }
        );
    }
    if !summary.in_progress.is_empty() {
        let _ = writeln!(out, "  in progress: {}", summary.in_progress.join(", "));
    }
    out
}

pub fn select(root: &Path, phase: Option<u32>) -> Result<Option<SelectedStory>> {
    let backlog = store(root).load()?;
    Ok(select_next(&backlog, phase).map(|s| SelectedStory {
        id: s.id.clone(),
        title: s.title.clone(),
        priority: s.priority,
        phase: s.phase,
    }))
}

/// Validate config and backlog; an unparseable file is an `Err`, semantic
/// problems land in the report.
pub fn validate(root: &Path) -> Result<ValidationReport> {
    let paths = StatePaths::new(root);
    load_config(&paths.config_path).context("load config.toml")?;
    let backlog = store(root).load_unchecked()?;
    Ok(validate_backlog(&backlog))
}

pub fn render_report(report: &ValidationReport) -> String {
    let mut out = String::new();
    for error in &report.errors {
        let _ = writeln!(out, "error: {error}");
    }
    for warning in &report.warnings {
        let _ = writeln!(out, "warning: {warning}");
    }
    if report.is_valid() {
        let _ = writeln!(out, "backlog ok ({} warnings)", report.warnings.len());
    }
    out
}

pub fn skip(root: &Path, story_id: &str) -> Result<()> {
    let store = store(root);
    let mut backlog = store.load()?;
    let now = Utc::now();
    let story = backlog
        .story_mut(story_id)
        .ok_or_else(|| anyhow!("story '{story_id}' not found"))?;
    story.skip(now)?;
    store.save(&mut backlog, now)?;
    info!(story_id, "story skipped");
    Ok(())
}

/// Result of `close_phase`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseClosure {
    pub skipped: Vec<String>,
    /// Members still `in_progress`; the phase stays open while any remain.
    pub in_progress: Vec<String>,
}

impl PhaseClosure {
    pub fn closed(&self) -> bool {
        self.in_progress.is_empty()
    }
}

/// Skip every incomplete story in `phase`. In-progress members are left alone.
pub fn close_phase(root: &Path, phase: u32) -> Result<PhaseClosure> {
    let store = store(root);
    let mut backlog = store.load()?;
    if !backlog.stories.iter().any(|s| s.phase == Some(phase)) {
        return Err(anyhow!("phase {phase} has no stories"));
    }
    let now = Utc::now();
    let skipped = backlog.close_phase(phase, now)?;
    store.save(&mut backlog, now)?;
    let in_progress: Vec<String> = backlog
        .in_progress()
        .filter(|s| s.phase == Some(phase))
        .map(|s| s.id.clone())
        .collect();
    let closure = PhaseClosure {
        skipped,
        in_progress,
    };
    info!(
        phase,
        skipped = closure.skipped.len(),
        closed = closure.closed(),
        "phase close requested"
    );
    Ok(closure)
}

/// Release `in_progress` stories left behind by an interrupted run.
pub fn reset_stale(root: &Path, options: ResetOptions) -> Result<Vec<String>> {
    let store = store(root);
    let mut backlog = store.load()?;
    let max_age = (!options.all).then(|| chrono::Duration::hours(i64::from(options.max_age_hours)));
    let now = Utc::now();
    let released = backlog.reset_stale(max_age, now)?;
    if !released.is_empty() {
        store.save(&mut backlog, now)?;
        info!(released = ?released, "released stale stories");
    }
    Ok(released)
}

pub fn guardrails(root: &Path) -> Result<String> {
    let entries = GuardrailLedger::new(StatePaths::new(root).guardrails_path).entries()?;
    Ok(render_markdown(&entries))
}
