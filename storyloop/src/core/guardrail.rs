//! Guardrails: lessons recorded after a story fails repeatedly.
//!
//! A [`FailureTracker`] counts consecutive failures globally (for the stop
//! condition) and per story (for guardrail creation). When a story's counter
//! reaches the configured threshold, the engine condenses the failing
//! diagnostics into a [`GuardrailEntry`] with a [`SignatureExtractor`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use regex::RegexSet;
use serde::{Deserialize, Serialize};

use crate::core::backlog::Story;

/// Structured view of a failed command's output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostic {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// First non-empty lines of output, in order.
    pub head: Vec<String>,
    /// Lines matching the configured error patterns, in order.
    pub matched: Vec<String>,
}

impl Diagnostic {
    pub fn from_output(
        output: &str,
        exit_code: Option<i32>,
        timed_out: bool,
        head_lines: usize,
        patterns: &RegexSet,
    ) -> Self {
        let lines = output.lines().map(str::trim_end).filter(|l| !l.trim().is_empty());
        let mut head = Vec::new();
        let mut matched = Vec::new();
        for line in lines {
            if head.len() < head_lines {
                head.push(line.to_string());
            }
            if !patterns.is_empty() && patterns.is_match(line) && matched.len() < head_lines {
                matched.push(line.to_string());
            }
        }
        Self {
            exit_code,
            timed_out,
            head,
            matched,
        }
    }

    /// Diagnostic with a single synthetic line (spawn errors, VCS errors).
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            head: vec![message.into()],
            ..Self::default()
        }
    }

    fn status_line(&self) -> String {
        if self.timed_out {
            "timed out".to_string()
        } else {
            match self.exit_code {
                Some(code) => format!("exit {code}"),
                None => "no exit code".to_string(),
            }
        }
    }
}

/// A diagnostic labelled with where it came from (a gate name, `agent`, `commit`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDiagnostic {
    pub source: String,
    pub diagnostic: Diagnostic,
}

/// Condenses failure diagnostics into a guardrail signature.
pub trait SignatureExtractor {
    fn extract(&self, failures: &[FailureDiagnostic]) -> String;
}

/// Top of each failing source's output.
#[derive(Debug, Clone, Copy)]
pub struct HeadLines {
    pub max_lines: usize,
}

/// Pattern-matched error lines, falling back to the head when nothing matched.
#[derive(Debug, Clone, Copy)]
pub struct MatchedLines {
    pub max_lines: usize,
}

impl SignatureExtractor for HeadLines {
    fn extract(&self, failures: &[FailureDiagnostic]) -> String {
        render_signature(failures, self.max_lines, |d| &d.head)
    }
}

impl SignatureExtractor for MatchedLines {
    fn extract(&self, failures: &[FailureDiagnostic]) -> String {
        render_signature(failures, self.max_lines, |d| {
            if d.matched.is_empty() {
                &d.head
            } else {
                &d.matched
            }
        })
    }
}

fn render_signature(
    failures: &[FailureDiagnostic],
    max_lines: usize,
    pick: impl Fn(&Diagnostic) -> &Vec<String>,
) -> String {
    let mut out = Vec::new();
    let mut budget = max_lines;
    for failure in failures {
        out.push(format!(
            "[{}] {}",
            failure.source,
            failure.diagnostic.status_line()
        ));
        for line in pick(&failure.diagnostic).iter().take(budget) {
            out.push(line.clone());
        }
        budget = budget.saturating_sub(pick(&failure.diagnostic).len());
    }
    out.join("\n")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailEntry {
    pub story_id: String,
    #[serde(default)]
    pub story_title: String,
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub failed_sources: Vec<String>,
    pub failure_signature: String,
    pub rule: String,
}

impl GuardrailEntry {
    pub fn new(
        story: &Story,
        failure_count: u32,
        failures: &[FailureDiagnostic],
        extractor: &dyn SignatureExtractor,
        now: DateTime<Utc>,
    ) -> Self {
        let failed_sources: Vec<String> = failures.iter().map(|f| f.source.clone()).collect();
        let rule = format!(
            "{} failed {failure_count} consecutive attempts ({}). \
             Resolve the failure signature before finishing the story; do not repeat the same approach.",
            story.id,
            failed_sources.join(", ")
        );
        Self {
            story_id: story.id.clone(),
            story_title: story.title.clone(),
            added_at: now,
            failure_count,
            failed_sources,
            failure_signature: extractor.extract(failures),
            rule,
        }
    }

    pub fn render_markdown(&self) -> String {
        format!(
            "## {}: {}\n**Added**: {}\n**Rule**: {}\n\n```text\n{}\n```\n",
            self.story_id,
            self.story_title,
            self.added_at.to_rfc3339(),
            self.rule,
            self.failure_signature
        )
    }
}

/// Consecutive-failure counters for one run.
#[derive(Debug, Default)]
pub struct FailureTracker {
    consecutive: u32,
    per_story: HashMap<String, u32>,
}

impl FailureTracker {
    /// Record a failed attempt, returning the story's consecutive failure count.
    pub fn record_failure(&mut self, story_id: &str) -> u32 {
        self.consecutive += 1;
        let count = self.per_story.entry(story_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn record_success(&mut self, story_id: &str) {
        self.consecutive = 0;
        self.per_story.remove(story_id);
    }

    /// Failures since the last success, across all stories.
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn for_story(&self, story_id: &str) -> u32 {
        self.per_story.get(story_id).copied().unwrap_or(0)
    }
}
