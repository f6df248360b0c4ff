//! Per-iteration artifacts under `.storyloop/logs/<iteration>/`.
//!
//! These are product output: always written, independent of `RUST_LOG`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::types::{FailureKind, GateSummary, IterationStatus};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationMeta {
    pub iteration: u32,
    pub story_id: String,
    pub status: IterationStatus,
    pub failure_kind: Option<FailureKind>,
    pub detail: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub agent_exit_code: Option<i32>,
    pub gates: Vec<GateSummary>,
    pub commit: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub context_path: PathBuf,
    /// Live agent stdout while it runs.
    pub agent_stream_path: PathBuf,
    /// Captured transcript after the agent exits.
    pub agent_log_path: PathBuf,
    pub gates_dir: PathBuf,
    pub meta_path: PathBuf,
}

impl IterationPaths {
    pub fn new(logs_dir: &Path, iteration: u32) -> Self {
        let dir = logs_dir.join(format!("{iteration:04}"));
        Self {
            context_path: dir.join("context.md"),
            agent_stream_path: dir.join("agent.stream.log"),
            agent_log_path: dir.join("agent.log"),
            gates_dir: dir.join("gates"),
            meta_path: dir.join("meta.json"),
            dir,
        }
    }

    pub fn create(logs_dir: &Path, iteration: u32) -> Result<Self> {
        let paths = Self::new(logs_dir, iteration);
        fs::create_dir_all(&paths.gates_dir)
            .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;
        Ok(paths)
    }

    pub fn gate_log_path(&self, gate_name: &str) -> PathBuf {
        self.gates_dir.join(format!("{}.log", file_safe(gate_name)))
    }

    pub fn write_context(&self, context: &str) -> Result<()> {
        write_text(&self.context_path, context)
    }

    pub fn write_agent_log(&self, exit_code: Option<i32>, timed_out: bool, transcript: &str) -> Result<()> {
        let header = format!("exit_code: {exit_code:?}\ntimed_out: {timed_out}\n\n");
        write_text(&self.agent_log_path, &(header + transcript))
    }

    pub fn write_gate_log(&self, gate_name: &str, output: &str) -> Result<()> {
        write_text(&self.gate_log_path(gate_name), output)
    }

    pub fn write_meta(&self, meta: &IterationMeta) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(meta)?;
        buf.push('\n');
        write_text(&self.meta_path, &buf)
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::GateStatus;

    #[test]
    fn iteration_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = IterationPaths::new(temp.path(), 7);
        assert!(paths.dir.ends_with("0007"));
        assert!(paths.meta_path.ends_with("0007/meta.json"));
        assert!(paths.gate_log_path("unit tests").ends_with("gates/unit_tests.log"));
    }

    #[test]
    fn writes_all_artifacts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = IterationPaths::create(temp.path(), 1).expect("create");
        paths.write_context("# ctx").expect("context");
        paths.write_agent_log(Some(0), false, "done").expect("agent");
        paths.write_gate_log("test", "ok").expect("gate");
        let now = Utc::now();
        paths
            .write_meta(&IterationMeta {
                iteration: 1,
                story_id: "US-1".to_string(),
                status: IterationStatus::Passed,
                failure_kind: None,
                detail: None,
                started_at: now,
                ended_at: now,
                duration_ms: 5,
                agent_exit_code: Some(0),
                gates: vec![GateSummary {
                    name: "test".to_string(),
                    status: GateStatus::Pass,
                    duration_seconds: 0.1,
                    exit_code: Some(0),
                }],
                commit: Some("abc123".to_string()),
            })
            .expect("meta");

        let meta = fs::read_to_string(&paths.meta_path).expect("read meta");
        assert!(meta.contains("\"storyId\": \"US-1\""));
        assert!(meta.contains("\"status\": \"passed\""));
        assert!(
            fs::read_to_string(&paths.agent_log_path)
                .expect("read agent")
                .ends_with("done")
        );
        assert!(paths.gate_log_path("test").is_file());
    }
}
