//! Semantic checks on a parsed backlog.

use std::collections::HashSet;

use crate::core::backlog::{Backlog, StoryStatus};

/// Errors block loading; warnings are reported but tolerated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Check backlog invariants:
/// - at least one story
/// - unique, non-empty ids
/// - every story has a title
/// - phase references resolve when phases are declared
///
/// Warns on multiple in-progress stories, missing acceptance criteria, and
/// unnamed phases.
pub fn validate_backlog(backlog: &Backlog) -> ValidationReport {
    let mut report = ValidationReport::default();

    if backlog.stories.is_empty() {
        report.errors.push("backlog has no stories".to_string());
    }

    let mut seen = HashSet::new();
    for (idx, story) in backlog.stories.iter().enumerate() {
        let label = if story.id.trim().is_empty() {
            report.errors.push(format!("story #{idx}: empty id"));
            format!("#{idx}")
        } else {
            story.id.clone()
        };
        if !story.id.trim().is_empty() && !seen.insert(story.id.as_str()) {
            report.errors.push(format!("duplicate story id '{}'", story.id));
        }
        if story.title.trim().is_empty() {
            report.errors.push(format!("{label}: missing title"));
        }
        if let Some(phase) = story.phase
            && !backlog.phases.is_empty()
            && !backlog.phases.contains_key(&phase)
        {
            report
                .errors
                .push(format!("{label}: references undefined phase {phase}"));
        }
        if story.acceptance_criteria.is_empty() {
            report
                .warnings
                .push(format!("{label}: no acceptance criteria"));
        }
    }

    let in_progress = backlog.count(StoryStatus::InProgress);
    if in_progress > 1 {
        report.warnings.push(format!(
            "{in_progress} stories are in_progress; only one should run at a time"
        ));
    }

    for (number, phase) in &backlog.phases {
        if phase.name.trim().is_empty() {
            report.warnings.push(format!("phase {number}: missing name"));
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backlog::PhaseInfo;
    use crate::test_support::{backlog, phased_story, story};

    #[test]
    fn clean_backlog_has_no_findings() {
        let mut s = story("a", 1);
        s.acceptance_criteria = vec!["done".to_string()];
        let report = validate_backlog(&backlog(vec![s]));
        assert_eq!(report, ValidationReport::default());
        assert!(report.is_valid());
    }

    #[test]
    fn reports_structural_errors() {
        let mut untitled = story("b", 2);
        untitled.title.clear();
        let mut b = backlog(vec![story("a", 1), story("a", 3), untitled, phased_story("c", 4, 7)]);
        b.phases.insert(
            1,
            PhaseInfo {
                name: "Core".to_string(),
                description: String::new(),
            },
        );

        let report = validate_backlog(&b);
        assert!(!report.is_valid());
        assert!(report.errors.iter().any(|e| e.contains("duplicate story id 'a'")));
        assert!(report.errors.iter().any(|e| e == "b: missing title"));
        assert!(report.errors.iter().any(|e| e.contains("undefined phase 7")));
    }

    #[test]
    fn empty_backlog_is_an_error() {
        let report = validate_backlog(&backlog(Vec::new()));
        assert_eq!(report.errors, vec!["backlog has no stories".to_string()]);
    }

    #[test]
    fn warnings_do_not_invalidate() {
        let mut b = backlog(vec![story("a", 1), story("b", 2)]);
        b.stories[0].status = StoryStatus::InProgress;
        b.stories[1].status = StoryStatus::InProgress;
        b.phases.insert(2, PhaseInfo::default());

        let report = validate_backlog(&b);
        assert!(report.is_valid());
        assert!(report.warnings.iter().any(|w| w.contains("2 stories are in_progress")));
        assert!(report.warnings.iter().any(|w| w == "phase 2: missing name"));
        assert!(report.warnings.iter().any(|w| w == "a: no acceptance criteria"));
    }
}
