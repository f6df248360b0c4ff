//! Layout of the `.storyloop/` state directory and its scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use crate::core::backlog::{Backlog, Story};
use crate::io::atomic::{write_atomic, write_json_atomic};
use crate::io::config::{Config, write_config};

/// Name of the engine-owned directory under the project root.
pub const STATE_DIR_NAME: &str = ".storyloop";

/// All canonical paths within `.storyloop/` for a project root.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub backlog_path: PathBuf,
    pub guardrails_path: PathBuf,
    pub progress_path: PathBuf,
    pub config_path: PathBuf,
    pub logs_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(STATE_DIR_NAME);
        Self {
            root: root.clone(),
            state_dir: state_dir.clone(),
            backlog_path: state_dir.join("backlog.json"),
            guardrails_path: state_dir.join("guardrails.json"),
            progress_path: state_dir.join("progress.md"),
            config_path: state_dir.join("config.toml"),
            logs_dir: state_dir.join("logs"),
            gitignore_path: state_dir.join(".gitignore"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Overwrite engine-owned files that already exist.
    pub force: bool,
}

/// Create `.storyloop/` with a default config and a starter backlog.
///
/// Fails if the directory already exists unless `options.force` is set. An
/// existing backlog is never overwritten.
pub fn init_state(root: &Path, options: &InitOptions) -> Result<StatePaths> {
    let paths = StatePaths::new(root);
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!(
            "init: {} exists but is not a directory",
            paths.state_dir.display()
        ));
    }
    if paths.state_dir.exists() && !options.force {
        return Err(anyhow!(
            "init: {STATE_DIR_NAME} already exists (use --force to overwrite)"
        ));
    }

    fs::create_dir_all(&paths.logs_dir)
        .with_context(|| format!("create directory {}", paths.logs_dir.display()))?;
    write_atomic(&paths.gitignore_path, STATE_GITIGNORE)?;
    write_config(&paths.config_path, &Config::default())?;
    if !paths.backlog_path.exists() {
        write_json_atomic(&paths.backlog_path, &starter_backlog(root))?;
    }

    info!(state_dir = %paths.state_dir.display(), "initialized state directory");
    Ok(paths)
}

fn starter_backlog(root: &Path) -> Backlog {
    let project = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut story = Story::new("US-001", "Describe the first story", 1);
    story.acceptance_criteria = vec!["Replace this criterion".to_string()];
    Backlog::new(project, vec![story])
}

const STATE_GITIGNORE: &str = "logs/\n*.tmp\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::backlog_store::BacklogStore;
    use crate::io::config::load_config;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_state(temp.path(), &InitOptions { force: false }).expect("init");

        assert!(paths.state_dir.is_dir());
        assert!(paths.logs_dir.is_dir());
        assert!(paths.gitignore_path.is_file());
        assert_eq!(load_config(&paths.config_path).expect("config"), Config::default());
        let backlog = BacklogStore::new(&paths.backlog_path).load().expect("backlog");
        assert_eq!(backlog.stories.len(), 1);
    }

    #[test]
    fn init_refuses_existing_dir_without_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_state(temp.path(), &InitOptions { force: false }).expect("first init");
        let err = init_state(temp.path(), &InitOptions { force: false }).expect_err("second");
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn force_keeps_existing_backlog() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_state(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(&paths.backlog_path, "{\"userStories\": []}").expect("overwrite backlog");

        init_state(temp.path(), &InitOptions { force: true }).expect("force init");
        let raw = fs::read_to_string(&paths.backlog_path).expect("read");
        assert_eq!(raw, "{\"userStories\": []}");
    }
}
