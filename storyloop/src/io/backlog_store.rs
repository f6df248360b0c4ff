//! Backlog persistence: `.storyloop/backlog.json`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::core::backlog::Backlog;
use crate::core::invariants::{ValidationReport, validate_backlog};
use crate::io::atomic::write_json_atomic;

#[derive(Debug, Clone)]
pub struct BacklogStore {
    path: PathBuf,
}

impl BacklogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse without semantic checks.
    pub fn load_unchecked(&self) -> Result<Backlog> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("read backlog {}", self.path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse backlog {}", self.path.display()))
    }

    /// Parse and validate; errors block, warnings are logged.
    pub fn load(&self) -> Result<Backlog> {
        let backlog = self.load_unchecked()?;
        let report = validate_backlog(&backlog);
        ensure_valid(&self.path, &report)?;
        debug!(
            path = %self.path.display(),
            stories = backlog.stories.len(),
            "backlog loaded"
        );
        Ok(backlog)
    }

    /// Recompute metadata and atomically rewrite the whole document.
    pub fn save(&self, backlog: &mut Backlog, now: DateTime<Utc>) -> Result<()> {
        backlog.refresh_metadata(now);
        debug!(
            path = %self.path.display(),
            completed = backlog.metadata.completed_stories,
            iteration = backlog.metadata.current_iteration,
            "writing backlog"
        );
        write_json_atomic(&self.path, backlog)
            .with_context(|| format!("write backlog {}", self.path.display()))
    }
}

fn ensure_valid(path: &Path, report: &ValidationReport) -> Result<()> {
    for warning in &report.warnings {
        warn!(path = %path.display(), "backlog: {warning}");
    }
    if !report.is_valid() {
        bail!(
            "invalid backlog {}:\n- {}",
            path.display(),
            report.errors.join("\n- ")
        );
    }
    Ok(())
}
