//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod backlog;
pub mod guardrail;
pub mod invariants;
pub mod machine;
pub mod progress;
pub mod scheduler;
pub mod types;
