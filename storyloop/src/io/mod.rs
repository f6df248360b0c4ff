//! I/O adapters: filesystem state, git, and child processes.

pub mod agent;
pub mod atomic;
pub mod backlog_store;
pub mod config;
pub mod context;
pub mod git;
pub mod guardrail_ledger;
pub mod init;
pub mod iteration_log;
pub mod process;
pub mod progress_ledger;
