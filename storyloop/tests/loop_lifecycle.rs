//! Loop-level tests: drive `Engine::run` against a real git repo with a
//! scripted agent and scripted gate runner.

use std::fs;

use storyloop::commit::CommitOutcome;
use storyloop::core::backlog::{PhaseInfo, StoryStatus};
use storyloop::core::scheduler::StopReason;
use storyloop::core::types::{FailureKind, IterationStatus};
use storyloop::engine::{CancelFlag, Engine, IterationReport, RunOptions, RunOutcome};
use storyloop::io::config::Config;
use storyloop::io::context::PromptAssembler;
use storyloop::io::git::Git;
use storyloop::io::iteration_log::IterationPaths;
use storyloop::io::process::CommandOutcome;
use storyloop::test_support::{
    AgentScript, ScriptedAgent, ScriptedRunner, TestRepo, backlog, phased_story, story,
    test_config,
};

fn run_loop(
    repo: &TestRepo,
    config: &Config,
    agent: &ScriptedAgent,
    runner: &ScriptedRunner,
    options: RunOptions,
    cancel: CancelFlag,
) -> (RunOutcome, Vec<IterationReport>) {
    let assembler = PromptAssembler::new(config.engine.context_budget_bytes).expect("assembler");
    let mut engine = Engine::new(
        config,
        repo.paths(),
        agent,
        runner,
        Git::new(repo.path()),
        &assembler,
    )
    .expect("engine")
    .with_cancel(cancel);
    let mut reports = Vec::new();
    let outcome = engine
        .run(options, |report| reports.push(report.clone()))
        .expect("run");
    (outcome, reports)
}

fn run_default(
    repo: &TestRepo,
    config: &Config,
    agent: &ScriptedAgent,
    runner: &ScriptedRunner,
) -> (RunOutcome, Vec<IterationReport>) {
    run_loop(repo, config, agent, runner, RunOptions::default(), CancelFlag::new())
}

/// Stories run in priority order, one commit each, and the backlog counters track completion.
#[test]
fn completes_backlog_in_priority_order() {
    let repo = TestRepo::new().expect("repo");
    repo.write_backlog(vec![story("US-A", 2), story("US-B", 1), story("US-C", 3)])
        .expect("backlog");
    let config = test_config();
    let agent = ScriptedAgent::new(vec![
        AgentScript::write("b.txt", "b"),
        AgentScript::write("a.txt", "a"),
        AgentScript::write("c.txt", "c"),
    ]);
    let runner = ScriptedRunner::passing();
    let before = repo.commit_count().expect("count");

    let (outcome, reports) = run_default(&repo, &config, &agent, &runner);

    assert_eq!(outcome.stop, StopReason::AllComplete);
    assert_eq!(outcome.iterations, 3);
    assert_eq!(outcome.passed, 3);
    let order: Vec<&str> = reports.iter().map(|r| r.story_id.as_str()).collect();
    assert_eq!(order, vec!["US-B", "US-A", "US-C"]);
    assert!(reports.iter().all(|r| matches!(r.commit, Some(CommitOutcome::Committed { .. }))));

    assert_eq!(repo.commit_count().expect("count"), before + 3);
    assert_eq!(repo.last_commit_message().expect("log"), "feat: US-C - US-C title");

    let b = repo.read_backlog().expect("backlog");
    assert_eq!(b.metadata.completed_stories, 3);
    assert_eq!(b.metadata.total_stories, 3);
    assert_eq!(b.metadata.current_iteration, 3);
    assert_eq!(b.story("US-B").expect("story").iteration_number, Some(1));
    assert!(b.stories.iter().all(|s| s.actual_duration.is_some()));

    let progress = repo.read_progress().expect("progress");
    assert!(progress.starts_with("# Progress Log"));
    assert_eq!(progress.matches("## Iteration ").count(), 3);

    // Each iteration leaves its artifacts behind.
    let first = IterationPaths::new(&repo.paths().logs_dir, 1);
    assert!(first.context_path.exists());
    assert!(first.meta_path.exists());
    assert!(first.gate_log_path("test").exists());
    let context = fs::read_to_string(&first.context_path).expect("context");
    assert!(context.contains("### Story US-B"));
}

#[test]
fn required_gate_failure_leaves_story_incomplete_without_commit() {
    let repo = TestRepo::new().expect("repo");
    repo.write_backlog(vec![story("US-1", 1)]).expect("backlog");
    let mut config = test_config();
    config.engine.max_iterations = 1;
    let agent = ScriptedAgent::new(vec![AgentScript::write("lib.rs", "broken")]);
    let runner = ScriptedRunner::new(vec![CommandOutcome::exited(
        101,
        "error[E0425]: cannot find value `x`\n",
    )]);
    let before = repo.commit_count().expect("count");

    let (outcome, reports) = run_default(&repo, &config, &agent, &runner);

    assert_eq!(outcome.stop, StopReason::MaxIterations);
    assert_eq!(reports[0].status, IterationStatus::Failed);
    assert_eq!(reports[0].failure_kind, Some(FailureKind::GatesFailed));
    assert_eq!(reports[0].commit, None);
    assert_eq!(repo.commit_count().expect("count"), before);

    let b = repo.read_backlog().expect("backlog");
    assert_eq!(b.stories[0].status, StoryStatus::Incomplete);
    assert_eq!(b.metadata.completed_stories, 0);

    let progress = repo.read_progress().expect("progress");
    assert!(progress.contains("- **Status**: failed"));
    assert!(progress.contains("- **Failure**: gates_failed"));
    assert!(progress.contains("cannot find value"));
}

/// Two failures add one guardrail that the third attempt sees; the third failure stops the run.
#[test]
fn repeated_failures_add_one_guardrail_then_stop() {
    let repo = TestRepo::new().expect("repo");
    repo.write_backlog(vec![story("US-1", 1), story("US-2", 2)])
        .expect("backlog");
    let config = test_config();
    let agent = ScriptedAgent::new(vec![
        AgentScript::write("a.txt", "1"),
        AgentScript::write("a.txt", "2"),
        AgentScript::write("a.txt", "3"),
    ]);
    let runner = ScriptedRunner::new(vec![
        CommandOutcome::exited(1, "test result: FAILED. 0 passed; 1 failed\n"),
        CommandOutcome::exited(1, "test result: FAILED. 0 passed; 1 failed\n"),
        CommandOutcome::exited(1, "test result: FAILED. 0 passed; 1 failed\n"),
    ]);

    let (outcome, reports) = run_default(&repo, &config, &agent, &runner);

    assert_eq!(outcome.stop, StopReason::TooManyFailures);
    assert_eq!(outcome.failed, 3);
    assert!(reports.iter().all(|r| r.story_id == "US-1"));
    let added: Vec<bool> = reports.iter().map(|r| r.guardrail_added).collect();
    assert_eq!(added, vec![false, true, false]);

    let guardrails = repo.guardrails().expect("guardrails");
    assert_eq!(guardrails.len(), 1);
    assert_eq!(guardrails[0].story_id, "US-1");
    assert_eq!(guardrails[0].failure_count, 2);
    assert!(guardrails[0].failure_signature.contains("FAILED"));

    let contexts = agent.contexts();
    assert!(!contexts[1].contains("### Guardrails"));
    assert!(contexts[2].contains("### Guardrails"));

    let b = repo.read_backlog().expect("backlog");
    let untouched = b.story("US-2").expect("story");
    assert_eq!(untouched.status, StoryStatus::Incomplete);
    assert!(untouched.started_at.is_none());
    assert_eq!(b.story("US-1").expect("story").status, StoryStatus::Incomplete);
}

#[test]
fn unchanged_tree_is_a_noop_commit() {
    let repo = TestRepo::new().expect("repo");
    repo.write_backlog(vec![story("US-1", 1)]).expect("backlog");
    let config = test_config();
    let agent = ScriptedAgent::new(vec![AgentScript::idle()]);
    let runner = ScriptedRunner::passing();
    let before = repo.commit_count().expect("count");

    let (outcome, reports) = run_default(&repo, &config, &agent, &runner);

    assert_eq!(outcome.stop, StopReason::AllComplete);
    assert_eq!(reports[0].commit, Some(CommitOutcome::NoOp));
    assert_eq!(repo.commit_count().expect("count"), before);
    let b = repo.read_backlog().expect("backlog");
    assert_eq!(b.stories[0].status, StoryStatus::Complete);
    assert!(repo.read_progress().expect("progress").contains("none (no changes)"));
}

#[test]
fn phase_filter_runs_until_the_phase_is_closed() {
    let repo = TestRepo::new().expect("repo");
    let mut b = backlog(vec![
        phased_story("P1-A", 2, 1),
        phased_story("P2-A", 1, 2),
        phased_story("P1-B", 3, 1),
    ]);
    for n in [1, 2] {
        b.phases.insert(
            n,
            PhaseInfo {
                name: format!("Phase {n}"),
                description: String::new(),
            },
        );
    }
    repo.write_backlog_doc(&b).expect("backlog");
    let config = test_config();
    let agent = ScriptedAgent::new(vec![
        AgentScript::write("p1a.txt", "a"),
        AgentScript::write("p1b.txt", "b"),
    ]);
    let runner = ScriptedRunner::passing();

    let (outcome, reports) = run_loop(
        &repo,
        &config,
        &agent,
        &runner,
        RunOptions {
            phase: Some(1),
            max_iterations: None,
        },
        CancelFlag::new(),
    );

    assert_eq!(outcome.stop, StopReason::AllComplete);
    let order: Vec<&str> = reports.iter().map(|r| r.story_id.as_str()).collect();
    assert_eq!(order, vec!["P1-A", "P1-B"]);
    let b = repo.read_backlog().expect("backlog");
    assert!(b.is_phase_closed(1));
    assert!(!b.is_phase_closed(2));
    assert_eq!(b.story("P2-A").expect("story").status, StoryStatus::Incomplete);
}

#[test]
fn settled_backlog_stops_without_agent_or_gates() {
    let repo = TestRepo::new().expect("repo");
    let mut done = story("US-1", 1);
    done.status = StoryStatus::Complete;
    let mut skipped = story("US-2", 2);
    skipped.status = StoryStatus::Skipped;
    repo.write_backlog(vec![done, skipped]).expect("backlog");
    let config = test_config();
    let agent = ScriptedAgent::new(Vec::new());
    let runner = ScriptedRunner::new(Vec::new());

    let (outcome, reports) = run_default(&repo, &config, &agent, &runner);

    assert_eq!(outcome.stop, StopReason::AllComplete);
    assert_eq!(outcome.iterations, 0);
    assert!(reports.is_empty());
    assert_eq!(agent.invocations(), 0);
    assert!(runner.calls().is_empty());
    assert!(!repo.paths().progress_path.exists());
}

#[test]
fn interrupt_finishes_current_iteration_then_stops() {
    let repo = TestRepo::new().expect("repo");
    repo.write_backlog(vec![story("US-1", 1), story("US-2", 2)])
        .expect("backlog");
    let config = test_config();
    let cancel = CancelFlag::new();
    let agent = ScriptedAgent::new(vec![AgentScript::write("a.txt", "a").cancelling(cancel.clone())]);
    let runner = ScriptedRunner::passing();

    let (outcome, reports) = run_loop(
        &repo,
        &config,
        &agent,
        &runner,
        RunOptions::default(),
        cancel,
    );

    assert_eq!(outcome.stop, StopReason::Interrupted);
    assert_eq!(reports.len(), 1);
    let b = repo.read_backlog().expect("backlog");
    assert_eq!(b.story("US-1").expect("story").status, StoryStatus::Complete);
    assert_eq!(b.story("US-2").expect("story").status, StoryStatus::Incomplete);
    assert_eq!(b.in_progress().count(), 0);
}

#[test]
fn agent_exit_and_gate_timeout_are_distinct_failures() {
    let repo = TestRepo::new().expect("repo");
    repo.write_backlog(vec![story("US-1", 1)]).expect("backlog");
    let mut config = test_config();
    config.engine.max_iterations = 2;
    let agent = ScriptedAgent::new(vec![
        AgentScript::exit(2, "error: rate limited\n"),
        AgentScript::write("a.txt", "a"),
    ]);
    let runner = ScriptedRunner::new(vec![CommandOutcome::timed_out(
        "running 4 tests\n",
        std::time::Duration::from_secs(300),
    )]);

    let (outcome, reports) = run_default(&repo, &config, &agent, &runner);

    assert_eq!(outcome.stop, StopReason::MaxIterations);
    assert_eq!(reports[0].failure_kind, Some(FailureKind::AgentInvocation));
    assert_eq!(reports[1].failure_kind, Some(FailureKind::GatesFailed));
    assert_eq!(runner.calls().len(), 1, "gates skipped after agent failure");
    let progress = repo.read_progress().expect("progress");
    assert!(progress.contains("rate limited"));
    assert!(progress.contains("| test | timeout |"));
}

#[test]
fn iteration_numbers_continue_across_runs() {
    let repo = TestRepo::new().expect("repo");
    repo.write_backlog(vec![story("US-1", 1), story("US-2", 2)])
        .expect("backlog");
    let config = test_config();
    let once = RunOptions {
        phase: None,
        max_iterations: Some(1),
    };

    let agent = ScriptedAgent::new(vec![AgentScript::write("a.txt", "a")]);
    let runner = ScriptedRunner::passing();
    let (first, _) = run_loop(&repo, &config, &agent, &runner, once, CancelFlag::new());
    assert_eq!(first.stop, StopReason::MaxIterations);

    let agent = ScriptedAgent::new(vec![AgentScript::write("b.txt", "b")]);
    let (second, reports) = run_loop(&repo, &config, &agent, &runner, once, CancelFlag::new());
    assert_eq!(second.stop, StopReason::AllComplete);
    assert_eq!(reports[0].iteration, 2);

    let b = repo.read_backlog().expect("backlog");
    assert_eq!(b.metadata.current_iteration, 2);
    assert_eq!(b.story("US-2").expect("story").iteration_number, Some(2));
    assert!(IterationPaths::new(&repo.paths().logs_dir, 2).meta_path.exists());
}
