//! Commit manager: one commit per completed story, or none when nothing changed.

use thiserror::Error;
use tracing::{info, instrument};

use crate::core::backlog::Story;
use crate::io::git::Vcs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { sha: String },
    /// The working tree had no changes outside the excluded paths.
    NoOp,
}

impl CommitOutcome {
    pub fn sha(&self) -> Option<&str> {
        match self {
            Self::Committed { sha } => Some(sha),
            Self::NoOp => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("commit for story '{story_id}' failed: {message}")]
pub struct CommitError {
    pub story_id: String,
    pub message: String,
}

pub struct CommitManager<V> {
    vcs: V,
    message_format: String,
    excluded: Vec<String>,
}

impl<V: Vcs> CommitManager<V> {
    /// `excluded` paths are never staged and never count as changes.
    pub fn new(vcs: V, message_format: impl Into<String>, excluded: Vec<String>) -> Self {
        Self {
            vcs,
            message_format: message_format.into(),
            excluded,
        }
    }

    pub fn vcs(&self) -> &V {
        &self.vcs
    }

    pub fn excluded(&self) -> &[String] {
        &self.excluded
    }

    pub fn render_message(&self, story: &Story) -> String {
        self.message_format
            .replace("{story_id}", &story.id)
            .replace("{story_title}", &story.title)
    }

    #[instrument(skip_all, fields(story_id = %story.id))]
    pub fn commit_if_changed(&self, story: &Story) -> Result<CommitOutcome, CommitError> {
        let fail = |err: anyhow::Error| CommitError {
            story_id: story.id.clone(),
            message: format!("{err:#}"),
        };
        let changed = self.vcs.changed_paths(&self.excluded).map_err(fail)?;
        if changed.is_empty() {
            info!("no changes to commit");
            return Ok(CommitOutcome::NoOp);
        }
        let message = self.render_message(story);
        match self.vcs.commit_all(&message, &self.excluded).map_err(fail)? {
            Some(sha) => {
                info!(%sha, files = changed.len(), "committed story");
                Ok(CommitOutcome::Committed { sha })
            }
            None => Ok(CommitOutcome::NoOp),
        }
    }
}
