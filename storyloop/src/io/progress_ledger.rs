//! Append-only progress ledger: `.storyloop/progress.md`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::core::progress::{ProgressEntry, last_entries};
use crate::io::atomic::write_atomic;

#[derive(Debug, Clone)]
pub struct ProgressLedger {
    path: PathBuf,
}

impl ProgressLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        fs::read_to_string(&self.path)
            .map(Some)
            .with_context(|| format!("read progress {}", self.path.display()))
    }

    /// Append one entry, creating the ledger with a header on first use.
    pub fn append(&self, entry: &ProgressEntry, now: DateTime<Utc>) -> Result<()> {
        let mut doc = match self.read()? {
            Some(doc) => doc,
            None => header(now),
        };
        if !doc.is_empty() && !doc.ends_with('\n') {
            doc.push('\n');
        }
        doc.push('\n');
        doc.push_str(&entry.render_markdown());
        debug!(iteration = entry.iteration, story_id = %entry.story_id, "appending progress entry");
        write_atomic(&self.path, &doc)
            .with_context(|| format!("write progress {}", self.path.display()))
    }

    /// The last `n` entries as markdown, oldest first.
    pub fn recent(&self, n: usize) -> Result<Vec<String>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        Ok(self
            .read()?
            .map(|doc| last_entries(&doc, n))
            .unwrap_or_default())
    }
}

fn header(now: DateTime<Utc>) -> String {
    format!("# Progress Log\n\nStarted: {}\n\n---\n", now.to_rfc3339())
}
