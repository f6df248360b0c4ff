//! Append-only guardrail ledger: `.storyloop/guardrails.json`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::core::guardrail::GuardrailEntry;
use crate::io::atomic::write_json_atomic;

#[derive(Debug, Clone)]
pub struct GuardrailLedger {
    path: PathBuf,
}

impl GuardrailLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All entries in insertion order; a missing ledger is empty.
    pub fn entries(&self) -> Result<Vec<GuardrailEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("read guardrails {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw)
            .with_context(|| format!("parse guardrails {}", self.path.display()))
    }

    /// Existing entries are rewritten unchanged; only the tail grows.
    pub fn append(&self, entry: GuardrailEntry) -> Result<()> {
        let mut entries = self.entries()?;
        info!(story_id = %entry.story_id, total = entries.len() + 1, "recording guardrail");
        entries.push(entry);
        write_json_atomic(&self.path, &entries)
            .with_context(|| format!("write guardrails {}", self.path.display()))
    }
}

/// Markdown view of the ledger for operators.
pub fn render_markdown(entries: &[GuardrailEntry]) -> String {
    if entries.is_empty() {
        return "# Guardrails\n\nNo guardrails recorded.\n".to_string();
    }
    let mut out = String::from("# Guardrails\n\n");
    for entry in entries {
        out.push_str(&entry.render_markdown());
        out.push('\n');
    }
    out
}
