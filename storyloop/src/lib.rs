//! Autonomous story execution engine.
//!
//! An agent works through a prioritized backlog one story per iteration; each
//! iteration is accepted only when the configured quality gates pass, and then
//! committed. Failures feed a guardrail ledger that every later context carries.
//!
//! - **[`core`]**: Pure, deterministic logic (backlog model, scheduling, loop
//!   state machine, guardrail signatures, progress rendering).
//! - **[`io`]**: Side effects (state files, git, subprocesses, agent, context).
//!
//! [`engine`] drives the loop; [`gates`] and [`commit`] are its gate runner and
//! commit manager; [`tools`] backs the operator subcommands.

pub mod commit;
pub mod core;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod gates;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;
