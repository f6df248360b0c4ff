//! Story selection and loop stop conditions.
//!
//! Priority is the only ordering mechanism; stories carry no dependency edges.

use crate::core::backlog::{Backlog, Story, StoryStatus};

/// Why the execution loop halted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    AllComplete,
    MaxIterations,
    TooManyFailures,
    Interrupted,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllComplete => "all_complete",
            Self::MaxIterations => "max_iterations",
            Self::TooManyFailures => "too_many_failures",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Limits that end a run. `max_iterations == 0` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicy {
    pub max_iterations: u32,
    pub max_failures: u32,
}

/// Eligible stories: incomplete, and inside the phase filter when one is set.
pub fn eligible<'a>(backlog: &'a Backlog, phase: Option<u32>) -> impl Iterator<Item = &'a Story> {
    backlog.stories.iter().filter(move |story| {
        story.status == StoryStatus::Incomplete && phase.is_none_or(|p| story.phase == Some(p))
    })
}

/// Lowest priority value wins; ties keep declaration order.
pub fn select_next(backlog: &Backlog, phase: Option<u32>) -> Option<&Story> {
    eligible(backlog, phase).min_by_key(|story| story.priority)
}

/// Evaluate stop conditions in fixed order.
pub fn should_stop(
    backlog: &Backlog,
    phase: Option<u32>,
    policy: StopPolicy,
    iteration_count: u32,
    consecutive_failures: u32,
    interrupted: bool,
) -> Option<StopReason> {
    if eligible(backlog, phase).next().is_none() {
        return Some(StopReason::AllComplete);
    }
    if policy.max_iterations > 0 && iteration_count >= policy.max_iterations {
        return Some(StopReason::MaxIterations);
    }
    if consecutive_failures >= policy.max_failures {
        return Some(StopReason::TooManyFailures);
    }
    if interrupted {
        return Some(StopReason::Interrupted);
    }
    None
}

/// Run-scoped scheduler: a stop policy plus an optional phase filter.
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    policy: StopPolicy,
    phase: Option<u32>,
}

impl Scheduler {
    pub fn new(policy: StopPolicy, phase: Option<u32>) -> Self {
        Self { policy, phase }
    }

    pub fn phase(&self) -> Option<u32> {
        self.phase
    }

    pub fn select_next<'a>(&self, backlog: &'a Backlog) -> Option<&'a Story> {
        select_next(backlog, self.phase)
    }

    pub fn should_stop(
        &self,
        backlog: &Backlog,
        iteration_count: u32,
        consecutive_failures: u32,
        interrupted: bool,
    ) -> Option<StopReason> {
        should_stop(
            backlog,
            self.phase,
            self.policy,
            iteration_count,
            consecutive_failures,
            interrupted,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{backlog, phased_story, story};

    const POLICY: StopPolicy = StopPolicy {
        max_iterations: 0,
        max_failures: 3,
    };

    #[test]
    fn lowest_priority_value_is_selected_first() {
        let b = backlog(vec![story("two", 2), story("one", 1), story("three", 3)]);
        assert_eq!(select_next(&b, None).map(|s| s.id.as_str()), Some("one"));
    }

    #[test]
    fn ties_break_by_declaration_order() {
        let b = backlog(vec![story("first", 5), story("second", 5)]);
        assert_eq!(select_next(&b, None).map(|s| s.id.as_str()), Some("first"));
    }

    #[test]
    fn settled_and_in_progress_stories_are_not_candidates() {
        let mut b = backlog(vec![story("a", 1), story("b", 2), story("c", 3), story("d", 4)]);
        b.stories[0].status = StoryStatus::Complete;
        b.stories[1].status = StoryStatus::Skipped;
        b.stories[2].status = StoryStatus::InProgress;
        assert_eq!(select_next(&b, None).map(|s| s.id.as_str()), Some("d"));
    }

    #[test]
    fn phase_filter_restricts_candidates() {
        let b = backlog(vec![phased_story("p1", 1, 1), phased_story("p2", 2, 2)]);
        assert_eq!(select_next(&b, Some(2)).map(|s| s.id.as_str()), Some("p2"));
        assert!(select_next(&b, Some(3)).is_none());
    }

    #[test]
    fn all_complete_wins_over_every_other_condition() {
        let mut b = backlog(vec![story("a", 1)]);
        b.stories[0].status = StoryStatus::Complete;
        let policy = StopPolicy {
            max_iterations: 1,
            max_failures: 1,
        };
        assert_eq!(
            should_stop(&b, None, policy, 5, 5, true),
            Some(StopReason::AllComplete)
        );
    }

    #[test]
    fn stop_conditions_are_checked_in_order() {
        let b = backlog(vec![story("a", 1)]);
        let policy = StopPolicy {
            max_iterations: 2,
            max_failures: 3,
        };
        assert_eq!(should_stop(&b, None, policy, 0, 0, false), None);
        assert_eq!(
            should_stop(&b, None, policy, 2, 3, true),
            Some(StopReason::MaxIterations)
        );
        assert_eq!(
            should_stop(&b, None, policy, 1, 3, true),
            Some(StopReason::TooManyFailures)
        );
        assert_eq!(
            should_stop(&b, None, policy, 1, 2, true),
            Some(StopReason::Interrupted)
        );
    }

    #[test]
    fn zero_max_iterations_is_unlimited() {
        let b = backlog(vec![story("a", 1)]);
        assert_eq!(should_stop(&b, None, POLICY, 10_000, 0, false), None);
    }

    #[test]
    fn phase_filter_scopes_all_complete() {
        let mut b = backlog(vec![phased_story("p1", 1, 1), phased_story("p2", 2, 2)]);
        b.stories[0].status = StoryStatus::Complete;
        let scheduler = Scheduler::new(POLICY, Some(1));
        assert_eq!(
            scheduler.should_stop(&b, 0, 0, false),
            Some(StopReason::AllComplete)
        );
        assert!(Scheduler::new(POLICY, None).should_stop(&b, 0, 0, false).is_none());
    }
}
