//! CLI tests: spawn the storyloop binary and check exit codes and output.

use std::process::{Command, Output};

use storyloop::core::backlog::StoryStatus;
use storyloop::exit_codes;
use storyloop::io::init::{InitOptions, init_state};
use storyloop::test_support::{TestRepo, phased_story, story};

fn storyloop(repo: &TestRepo, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_storyloop"))
        .arg("--project-dir")
        .arg(repo.path())
        .args(args)
        .output()
        .expect("spawn storyloop")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn init_then_validate_succeeds() {
    let repo = TestRepo::new().expect("repo");
    let init = storyloop(&repo, &["init"]);
    assert_eq!(init.status.code(), Some(exit_codes::OK));
    assert!(repo.paths().config_path.exists());

    let validate = storyloop(&repo, &["validate"]);
    assert_eq!(validate.status.code(), Some(exit_codes::OK));
    assert!(stdout(&validate).contains("backlog ok"));
}

#[test]
fn validate_rejects_duplicate_ids() {
    let repo = TestRepo::new().expect("repo");
    repo.write_backlog(vec![story("US-1", 1), story("US-1", 2)])
        .expect("backlog");
    let output = storyloop(&repo, &["validate"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(stdout(&output).contains("duplicate"));
}

#[test]
fn select_and_status_report_next_story() {
    let repo = TestRepo::new().expect("repo");
    repo.write_backlog(vec![story("US-2", 2), story("US-1", 1)])
        .expect("backlog");

    let select = storyloop(&repo, &["select"]);
    assert_eq!(select.status.code(), Some(exit_codes::OK));
    assert_eq!(stdout(&select).trim(), "US-1");

    let status = storyloop(&repo, &["status"]);
    assert_eq!(status.status.code(), Some(exit_codes::OK));
    assert!(stdout(&status).contains("remaining 2"));
}

#[test]
fn run_on_settled_backlog_exits_ok() {
    let repo = TestRepo::new().expect("repo");
    let mut done = story("US-1", 1);
    done.status = StoryStatus::Complete;
    repo.write_backlog(vec![done]).expect("backlog");

    let output = storyloop(&repo, &["run"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(stdout(&output).contains("stopped: all_complete"));
}

#[test]
fn run_with_stuck_story_exits_with_scheduling_code() {
    let repo = TestRepo::new().expect("repo");
    init_state(repo.path(), &InitOptions { force: false }).expect("init");
    let mut stuck = story("US-1", 1);
    stuck.status = StoryStatus::InProgress;
    repo.write_backlog(vec![stuck]).expect("backlog");

    let run = storyloop(&repo, &["run"]);
    assert_eq!(run.status.code(), Some(exit_codes::SCHEDULING));
    assert!(String::from_utf8_lossy(&run.stderr).contains("reset-stale"));

    let reset = storyloop(&repo, &["reset-stale", "--all"]);
    assert_eq!(reset.status.code(), Some(exit_codes::OK));
    assert!(stdout(&reset).contains("released US-1"));
    let b = repo.read_backlog().expect("backlog");
    assert_eq!(b.stories[0].status, StoryStatus::Incomplete);
}

#[test]
fn skip_unknown_story_fails() {
    let repo = TestRepo::new().expect("repo");
    repo.write_backlog(vec![story("US-1", 1)]).expect("backlog");
    let output = storyloop(&repo, &["skip", "US-9"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn close_phase_reports_open_phase_while_a_story_runs() {
    let repo = TestRepo::new().expect("repo");
    let mut running = phased_story("US-1", 1, 1);
    running.status = StoryStatus::InProgress;
    repo.write_backlog(vec![running, phased_story("US-2", 2, 1)])
        .expect("backlog");

    let output = storyloop(&repo, &["close-phase", "1"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let out = stdout(&output);
    assert!(out.contains("phase 1 still open (in progress: US-1); skipped US-2"), "{out}");
}
