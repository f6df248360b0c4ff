//! storyloop: drive an agent through a prioritized story backlog.
//!
//! State lives in `<project>/.storyloop/`: the backlog, config, the append-only
//! progress and guardrail ledgers, and per-iteration logs.

use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use storyloop::engine::{CancelFlag, Engine, InterruptHandler, IterationReport, RunOptions};
use storyloop::exit_codes;
use storyloop::io::agent::CommandAgent;
use storyloop::io::config::load_config;
use storyloop::io::context::PromptAssembler;
use storyloop::io::git::Git;
use storyloop::io::init::{InitOptions, StatePaths, init_state};
use storyloop::io::process::ProcessRunner;
use storyloop::logging;
use storyloop::tools::{self, ResetOptions};

#[derive(Parser)]
#[command(
    name = "storyloop",
    version,
    about = "Autonomous story execution loop with quality gates"
)]
struct Cli {
    /// Project root containing `.storyloop/`.
    #[arg(long, global = true, default_value = ".")]
    project_dir: PathBuf,

    /// Log progress to stderr (`RUST_LOG` overrides).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.storyloop/` with a default config and starter backlog.
    Init {
        /// Overwrite the config and ignore file.
        #[arg(short, long)]
        force: bool,
    },
    /// Run iterations until every story is settled or a stop condition fires.
    Run {
        /// Only consider stories in this phase.
        #[arg(long)]
        phase: Option<u32>,
        /// Override `engine.max_iterations` (0 = unlimited).
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Print backlog totals and per-phase progress.
    Status,
    /// Print the id of the story the next iteration would pick.
    Select {
        #[arg(long)]
        phase: Option<u32>,
    },
    /// Check config and backlog; exits 1 on errors.
    Validate,
    /// Mark an incomplete story as skipped.
    Skip { story_id: String },
    /// Skip every incomplete story in a phase.
    ClosePhase { phase: u32 },
    /// Release stories left `in_progress` by an interrupted run.
    ResetStale {
        #[arg(long, default_value_t = 24)]
        max_age_hours: u32,
        /// Release all in-progress stories regardless of age.
        #[arg(long)]
        all: bool,
    },
    /// Print the guardrail ledger.
    Guardrails,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match dispatch(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: &Cli) -> Result<i32> {
    let root = cli.project_dir.as_path();
    match &cli.command {
        Command::Init { force } => cmd_init(root, *force),
        Command::Run {
            phase,
            max_iterations,
        } => cmd_run(
            root,
            RunOptions {
                phase: *phase,
                max_iterations: *max_iterations,
            },
        ),
        Command::Status => {
            print!("{}", tools::render_status(&tools::status(root)?));
            Ok(exit_codes::OK)
        }
        Command::Select { phase } => {
            match tools::select(root, *phase)? {
                Some(story) => println!("{}", story.id),
                None => eprintln!("no eligible story"),
            }
            Ok(exit_codes::OK)
        }
        Command::Validate => {
            let report = tools::validate(root)?;
            print!("{}", tools::render_report(&report));
            Ok(if report.is_valid() {
                exit_codes::OK
            } else {
                exit_codes::INVALID
            })
        }
        Command::Skip { story_id } => {
            tools::skip(root, story_id)?;
            println!("skipped {story_id}");
            Ok(exit_codes::OK)
        }
        Command::ClosePhase { phase } => {
            let closure = tools::close_phase(root, *phase)?;
            if closure.closed() {
                println!(
                    "phase {phase} closed; skipped {}",
                    list_or_none(&closure.skipped)
                );
            } else {
                println!(
                    "phase {phase} still open (in progress: {}); skipped {}",
                    closure.in_progress.join(", "),
                    list_or_none(&closure.skipped)
                );
            }
            Ok(exit_codes::OK)
        }
        Command::ResetStale { max_age_hours, all } => {
            let released = tools::reset_stale(
                root,
                ResetOptions {
                    max_age_hours: *max_age_hours,
                    all: *all,
                },
            )?;
            println!("released {}", list_or_none(&released));
            Ok(exit_codes::OK)
        }
        Command::Guardrails => {
            print!("{}", tools::guardrails(root)?);
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_state(root, &InitOptions { force })?;
    println!("initialized {}", paths.state_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, options: RunOptions) -> Result<i32> {
    let paths = StatePaths::new(root);
    let config = load_config(&paths.config_path).context("load config.toml")?;
    let assembler = PromptAssembler::new(config.engine.context_budget_bytes)?;
    let runner = ProcessRunner::new();
    let agent = CommandAgent::new(runner.clone(), config.agent.clone());
    let cancel = CancelFlag::new();
    install_interrupt_handler(InterruptHandler::new(cancel.clone(), runner.active_child()));

    let mut engine = Engine::new(&config, paths, &agent, &runner, Git::new(root), &assembler)?
        .with_cancel(cancel);
    match engine.run(options, print_iteration) {
        Ok(outcome) => {
            println!(
                "stopped: {} after {} iterations ({} passed, {} failed)",
                outcome.stop.as_str(),
                outcome.iterations,
                outcome.passed,
                outcome.failed
            );
            Ok(exit_codes::for_stop(outcome.stop))
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            Ok(exit_codes::for_error(&err))
        }
    }
}

fn print_iteration(report: &IterationReport) {
    let outcome = match (&report.failure_kind, &report.commit) {
        (Some(kind), _) => format!("failed ({kind})"),
        (None, Some(commit)) => match commit.sha() {
            Some(sha) => format!("passed, committed {sha}"),
            None => "passed, nothing to commit".to_string(),
        },
        (None, None) => report.status.as_str().to_string(),
    };
    println!(
        "iteration {} {}: {} in {:.1}s{}",
        report.iteration,
        report.story_id,
        outcome,
        report.duration.as_secs_f64(),
        if report.guardrail_added {
            " (guardrail added)"
        } else {
            ""
        }
    );
}

fn list_or_none(ids: &[String]) -> String {
    if ids.is_empty() {
        "none".to_string()
    } else {
        ids.join(", ")
    }
}

/// First Ctrl-C stops the loop after the current iteration; a second one kills
/// the running child's process group and exits.
fn install_interrupt_handler(handler: InterruptHandler) {
    let spawned = thread::Builder::new()
        .name("storyloop-signal".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    warn!(error = %err, "signal runtime unavailable; Ctrl-C will abort");
                    return;
                }
            };
            runtime.block_on(async {
                while tokio::signal::ctrl_c().await.is_ok() {
                    if handler.interrupt() {
                        eprintln!("interrupt: aborted");
                        std::process::exit(exit_codes::INTERRUPTED);
                    }
                    eprintln!("interrupt: finishing the current iteration (Ctrl-C again to abort)");
                }
            });
        });
    if let Err(err) = spawned {
        warn!(error = %err, "failed to spawn signal thread");
    }
}
