//! Backlog model: stories, phases, and the run metadata persisted alongside them.
//!
//! Everything here is pure. Status changes go through [`Story`] methods so the
//! legal transition graph lives in one place:
//!
//! ```text
//! incomplete -> in_progress -> complete
//!      |             |
//!      |             +-------> incomplete   (failed attempt, stale reset)
//!      +-> skipped                          (operator only)
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::rounded_secs;

/// Priority assumed for stories that omit one.
pub const DEFAULT_PRIORITY: i64 = 999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    #[default]
    Incomplete,
    InProgress,
    Complete,
    Skipped,
}

impl StoryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Skipped => "skipped",
        }
    }

    /// Complete and skipped stories are never selected again.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Complete | Self::Skipped)
    }

    pub fn can_transition_to(self, next: StoryStatus) -> bool {
        matches!(
            (self, next),
            (Self::Incomplete, Self::InProgress)
                | (Self::InProgress, Self::Complete)
                | (Self::InProgress, Self::Incomplete)
                | (Self::Incomplete, Self::Skipped)
        )
    }
}

impl fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("story '{id}': illegal status transition {from} -> {to}")]
pub struct TransitionError {
    pub id: String,
    pub from: StoryStatus,
    pub to: StoryStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<u32>,
    #[serde(default)]
    pub status: StoryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_at: Option<DateTime<Utc>>,
    /// Wall-clock seconds of the attempt that completed the story.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration_number: Option<u32>,
}

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

impl Story {
    pub fn new(id: impl Into<String>, title: impl Into<String>, priority: i64) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            priority,
            phase: None,
            status: StoryStatus::Incomplete,
            started_at: None,
            skipped_at: None,
            actual_duration: None,
            iteration_number: None,
        }
    }

    fn transition(&mut self, to: StoryStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// `incomplete -> in_progress`, stamping `startedAt`.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(StoryStatus::InProgress)?;
        self.started_at = Some(now);
        Ok(())
    }

    /// `in_progress -> complete`.
    pub fn complete(&mut self, duration: Duration, iteration: u32) -> Result<(), TransitionError> {
        self.transition(StoryStatus::Complete)?;
        self.actual_duration = Some(rounded_secs(duration));
        self.iteration_number = Some(iteration);
        Ok(())
    }

    /// `in_progress -> incomplete`. `startedAt` is kept as the last attempt's start.
    pub fn release(&mut self) -> Result<(), TransitionError> {
        self.transition(StoryStatus::Incomplete)
    }

    /// `incomplete -> skipped`.
    pub fn skip(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(StoryStatus::Skipped)?;
        self.skipped_at = Some(now);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_stories: usize,
    #[serde(default)]
    pub completed_stories: usize,
    /// Monotonic across runs; the next iteration is `current_iteration + 1`.
    #[serde(default)]
    pub current_iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backlog {
    #[serde(default)]
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub phases: BTreeMap<u32, PhaseInfo>,
    #[serde(rename = "userStories", alias = "stories", default)]
    pub stories: Vec<Story>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Backlog {
    pub fn new(project: impl Into<String>, stories: Vec<Story>) -> Self {
        Self {
            project: project.into(),
            branch_name: None,
            description: String::new(),
            phases: BTreeMap::new(),
            stories,
            metadata: Metadata::default(),
        }
    }

    pub fn story(&self, id: &str) -> Option<&Story> {
        self.stories.iter().find(|s| s.id == id)
    }

    pub fn story_mut(&mut self, id: &str) -> Option<&mut Story> {
        self.stories.iter_mut().find(|s| s.id == id)
    }

    pub fn completed_count(&self) -> usize {
        self.count(StoryStatus::Complete)
    }

    pub fn count(&self, status: StoryStatus) -> usize {
        self.stories.iter().filter(|s| s.status == status).count()
    }

    pub fn in_progress(&self) -> impl Iterator<Item = &Story> {
        self.stories
            .iter()
            .filter(|s| s.status == StoryStatus::InProgress)
    }

    /// Recompute derived counters. Called on every save.
    pub fn refresh_metadata(&mut self, now: DateTime<Utc>) {
        self.metadata.total_stories = self.stories.len();
        self.metadata.completed_stories = self.completed_count();
        self.metadata.last_updated_at = Some(now);
        if self.metadata.created_at.is_none() {
            self.metadata.created_at = Some(now);
        }
    }

    /// A phase is closed iff it has stories and all of them are settled.
    pub fn is_phase_closed(&self, phase: u32) -> bool {
        let mut members = self
            .stories
            .iter()
            .filter(|s| s.phase == Some(phase))
            .peekable();
        members.peek().is_some() && members.all(|s| s.status.is_settled())
    }

    /// Every phase number referenced by a story or declared in `phases`.
    pub fn phase_numbers(&self) -> Vec<u32> {
        let mut phases: Vec<u32> = self
            .phases
            .keys()
            .copied()
            .chain(self.stories.iter().filter_map(|s| s.phase))
            .collect();
        phases.sort_unstable();
        phases.dedup();
        phases
    }

    /// Skip every incomplete story in `phase`, returning the ids touched.
    pub fn close_phase(
        &mut self,
        phase: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, TransitionError> {
        let mut skipped = Vec::new();
        for story in self
            .stories
            .iter_mut()
            .filter(|s| s.phase == Some(phase) && s.status == StoryStatus::Incomplete)
        {
            story.skip(now)?;
            skipped.push(story.id.clone());
        }
        Ok(skipped)
    }

    /// Release `in_progress` stories older than `max_age` (all of them when `None`).
    ///
    /// Stories without `startedAt` have unknown age and are always released.
    pub fn reset_stale(
        &mut self,
        max_age: Option<chrono::Duration>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, TransitionError> {
        let mut released = Vec::new();
        for story in self
            .stories
            .iter_mut()
            .filter(|s| s.status == StoryStatus::InProgress)
        {
            let stale = match (max_age, story.started_at) {
                (Some(age), Some(started)) => now - started > age,
                _ => true,
            };
            if stale {
                story.release()?;
                released.push(story.id.clone());
            }
        }
        Ok(released)
    }

    pub fn summary(&self) -> BacklogSummary {
        let total = self.stories.len();
        let completed = self.count(StoryStatus::Complete);
        let skipped = self.count(StoryStatus::Skipped);
        let phases = self
            .phase_numbers()
            .into_iter()
            .map(|number| {
                let members: Vec<&Story> = self
                    .stories
                    .iter()
                    .filter(|s| s.phase == Some(number))
                    .collect();
                PhaseSummary {
                    number,
                    name: self
                        .phases
                        .get(&number)
                        .map(|p| p.name.clone())
                        .unwrap_or_default(),
                    total: members.len(),
                    completed: members
                        .iter()
                        .filter(|s| s.status == StoryStatus::Complete)
                        .count(),
                    skipped: members
                        .iter()
                        .filter(|s| s.status == StoryStatus::Skipped)
                        .count(),
                    closed: self.is_phase_closed(number),
                }
            })
            .collect();
        BacklogSummary {
            project: self.project.clone(),
            total,
            completed,
            skipped,
            remaining: total - completed - skipped,
            in_progress: self.in_progress().map(|s| s.id.clone()).collect(),
            current_iteration: self.metadata.current_iteration,
            phases,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSummary {
    pub number: u32,
    pub name: String,
    pub total: usize,
    pub completed: usize,
    pub skipped: usize,
    pub closed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacklogSummary {
    pub project: String,
    pub total: usize,
    pub completed: usize,
    pub skipped: usize,
    pub remaining: usize,
    pub in_progress: Vec<String>,
    pub current_iteration: u32,
    pub phases: Vec<PhaseSummary>,
}

impl BacklogSummary {
    /// Settled share of the backlog, in percent.
    pub fn percent_done(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.completed + self.skipped) as f64 * 100.0 / self.total as f64
    }
}
