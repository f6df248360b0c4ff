//! Progress entries and their markdown form.
//!
//! The progress ledger is a human-readable markdown file. Each iteration adds
//! one section: an [`ENTRY_MARKER`] line, then a heading starting with
//! [`ENTRY_HEADER`]. Recent sections are split back out at marker lines for the
//! next iteration's context. Agent output and gate detail can contain anything,
//! including markdown headings, so embedded text has the marker escaped.

use chrono::{DateTime, Utc};

use crate::core::types::{FailureKind, GateSummary, IterationStatus};

/// Line written before every entry; the only thing `split_entries` splits on.
pub const ENTRY_MARKER: &str = "<!-- storyloop:entry -->";

/// Prefix of every entry heading.
pub const ENTRY_HEADER: &str = "## Iteration ";

const ESCAPED_MARKER: &str = "&lt;!-- storyloop:entry --&gt;";

/// Transcript characters kept in each entry.
pub const TRANSCRIPT_EXCERPT_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEntry {
    pub iteration: u32,
    pub story_id: String,
    pub story_title: String,
    pub timestamp: DateTime<Utc>,
    pub status: IterationStatus,
    pub duration_seconds: f64,
    pub gate_results: Vec<GateSummary>,
    pub failure_kind: Option<FailureKind>,
    /// Failure detail or signature, already condensed.
    pub detail: Option<String>,
    /// Commit sha, or `None` for a no-op commit or a failure.
    pub commit: Option<String>,
    pub transcript_excerpt: String,
}

impl ProgressEntry {
    pub fn render_markdown(&self) -> String {
        let mut out = format!(
            "{ENTRY_MARKER}\n{ENTRY_HEADER}{}: {} - {}\n\n",
            self.iteration,
            escape(&self.story_id),
            escape(&self.story_title)
        );
        out.push_str(&format!("- **Time**: {}\n", self.timestamp.to_rfc3339()));
        out.push_str(&format!("- **Status**: {}\n", self.status.as_str()));
        out.push_str(&format!("- **Duration**: {:.1}s\n", self.duration_seconds));
        if let Some(kind) = self.failure_kind {
            out.push_str(&format!("- **Failure**: {kind}\n"));
        }
        match (&self.commit, self.status) {
            (Some(sha), _) => out.push_str(&format!("- **Commit**: {sha}\n")),
            (None, IterationStatus::Passed) => out.push_str("- **Commit**: none (no changes)\n"),
            (None, IterationStatus::Failed) => {}
        }

        if !self.gate_results.is_empty() {
            out.push_str("\n| Gate | Status | Duration | Exit |\n|---|---|---|---|\n");
            for gate in &self.gate_results {
                let exit = gate
                    .exit_code
                    .map_or_else(|| "-".to_string(), |c| c.to_string());
                out.push_str(&format!(
                    "| {} | {} | {:.1}s | {} |\n",
                    gate.name, gate.status, gate.duration_seconds, exit
                ));
            }
        }

        if let Some(detail) = self.detail.as_deref().filter(|d| !d.trim().is_empty()) {
            out.push_str(&format!("\n```text\n{}\n```\n", escape(detail.trim_end())));
        }
        if !self.transcript_excerpt.trim().is_empty() {
            out.push_str("\n<details><summary>Agent output</summary>\n\n```text\n");
            out.push_str(&escape(self.transcript_excerpt.trim_end()));
            out.push_str("\n```\n</details>\n");
        }
        out.push_str("\n---\n");
        out
    }
}

/// First `TRANSCRIPT_EXCERPT_CHARS` characters of a transcript.
pub fn excerpt(transcript: &str) -> String {
    transcript.chars().take(TRANSCRIPT_EXCERPT_CHARS).collect()
}

fn escape(text: &str) -> String {
    text.replace(ENTRY_MARKER, ESCAPED_MARKER)
}

/// Split a ledger document into entry sections, dropping the preamble.
///
/// Sections are returned without their marker line, so each starts with its heading.
pub fn split_entries(doc: &str) -> Vec<&str> {
    // (marker line start, section body start)
    let mut markers: Vec<(usize, usize)> = Vec::new();
    let mut offset = 0;
    for line in doc.split_inclusive('\n') {
        if line.trim_end() == ENTRY_MARKER {
            markers.push((offset, offset + line.len()));
        }
        offset += line.len();
    }

    markers
        .iter()
        .enumerate()
        .map(|(i, &(_, body))| {
            let end = markers.get(i + 1).map_or(doc.len(), |&(next, _)| next);
            doc[body..end].trim()
        })
        .collect()
}

/// The last `n` entries, oldest first.
pub fn last_entries(doc: &str, n: usize) -> Vec<String> {
    let entries = split_entries(doc);
    let skip = entries.len().saturating_sub(n);
    entries.into_iter().skip(skip).map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::GateStatus;

    fn entry(iteration: u32, status: IterationStatus) -> ProgressEntry {
        ProgressEntry {
            iteration,
            story_id: format!("US-{iteration}"),
            story_title: "Title".to_string(),
            timestamp: Utc::now(),
            status,
            duration_seconds: 1.25,
            gate_results: vec![GateSummary {
                name: "test".to_string(),
                status: GateStatus::Fail,
                duration_seconds: 0.5,
                exit_code: Some(1),
            }],
            failure_kind: (status == IterationStatus::Failed).then_some(FailureKind::GatesFailed),
            detail: Some("error: boom".to_string()),
            commit: None,
            transcript_excerpt: "did things".to_string(),
        }
    }

    #[test]
    fn renders_failed_entry_with_gate_table() {
        let md = entry(3, IterationStatus::Failed).render_markdown();
        assert!(md.starts_with(&format!("{ENTRY_MARKER}\n## Iteration 3: US-3 - Title")));
        assert!(md.contains("- **Status**: failed"));
        assert!(md.contains("- **Failure**: gates_failed"));
        assert!(md.contains("| test | fail | 0.5s | 1 |"));
        assert!(md.contains("error: boom"));
        assert!(!md.contains("**Commit**"));
    }

    #[test]
    fn passed_entry_without_sha_is_a_noop_commit() {
        let md = entry(1, IterationStatus::Passed).render_markdown();
        assert!(md.contains("none (no changes)"));
    }

    #[test]
    fn split_ignores_preamble_and_keeps_order() {
        let doc = format!(
            "# Progress Log\n\n---\n{}{}{}",
            entry(1, IterationStatus::Failed).render_markdown(),
            entry(2, IterationStatus::Failed).render_markdown(),
            entry(3, IterationStatus::Passed).render_markdown()
        );
        let all = split_entries(&doc);
        assert_eq!(all.len(), 3);
        assert!(all[0].starts_with("## Iteration 1:"));

        let last = last_entries(&doc, 2);
        assert_eq!(last.len(), 2);
        assert!(last[0].starts_with("## Iteration 2:"));
        assert!(last[1].starts_with("## Iteration 3:"));
    }

    #[test]
    fn headings_inside_agent_output_do_not_split_entries() {
        let mut noisy = entry(2, IterationStatus::Failed);
        noisy.transcript_excerpt =
            format!("Reviewing history:\n## Iteration 0: US-0 - old\nok\n{ENTRY_MARKER}\nmore");
        noisy.detail = Some("## Iteration 99: fake".to_string());
        let doc = format!(
            "# Progress Log\n\n---\n{}{}{}",
            entry(1, IterationStatus::Failed).render_markdown(),
            noisy.render_markdown(),
            entry(3, IterationStatus::Passed).render_markdown()
        );

        let all = split_entries(&doc);
        assert_eq!(all.len(), 3);
        assert!(all[1].contains("## Iteration 0: US-0 - old"));
        assert!(all[1].contains(ESCAPED_MARKER));

        let last = last_entries(&doc, 2);
        assert!(last[0].starts_with("## Iteration 2: US-2"));
        assert!(last[1].starts_with("## Iteration 3: US-3"));
    }

    #[test]
    fn marker_in_story_title_is_escaped() {
        let mut e = entry(1, IterationStatus::Passed);
        e.story_title = format!("odd\n{ENTRY_MARKER}\ntitle");
        let doc = e.render_markdown();
        assert_eq!(split_entries(&doc).len(), 1);
    }

    #[test]
    fn last_entries_handles_short_and_empty_docs() {
        assert!(last_entries("", 5).is_empty());
        assert!(last_entries("# Progress Log\n", 5).is_empty());
        let doc = entry(1, IterationStatus::Passed).render_markdown();
        assert_eq!(last_entries(&doc, 5).len(), 1);
    }

    #[test]
    fn excerpt_is_char_bounded() {
        let long = "é".repeat(TRANSCRIPT_EXCERPT_CHARS + 10);
        assert_eq!(excerpt(&long).chars().count(), TRANSCRIPT_EXCERPT_CHARS);
    }
}
