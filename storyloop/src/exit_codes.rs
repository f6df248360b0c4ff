//! Stable exit codes for storyloop CLI commands.

use crate::core::scheduler::StopReason;
use crate::error::EngineError;

/// Command succeeded; for `run`, every eligible story is settled.
pub const OK: i32 = 0;
/// Invalid layout/config/backlog, persistence failure, or other fatal errors.
pub const INVALID: i32 = 1;
/// `run` hit its iteration cap.
pub const MAX_ITERATIONS: i32 = 2;
/// `run` stopped after too many consecutive failed iterations.
pub const TOO_MANY_FAILURES: i32 = 3;
/// The backlog cannot be scheduled from (e.g. a story stuck `in_progress`).
pub const SCHEDULING: i32 = 4;
/// `run` observed Ctrl-C.
pub const INTERRUPTED: i32 = 130;

pub fn for_stop(reason: StopReason) -> i32 {
    match reason {
        StopReason::AllComplete => OK,
        StopReason::MaxIterations => MAX_ITERATIONS,
        StopReason::TooManyFailures => TOO_MANY_FAILURES,
        StopReason::Interrupted => INTERRUPTED,
    }
}

pub fn for_error(err: &EngineError) -> i32 {
    match err {
        EngineError::Scheduling(_) => SCHEDULING,
        _ => INVALID,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reasons_have_distinct_codes() {
        let codes = [
            for_stop(StopReason::AllComplete),
            for_stop(StopReason::MaxIterations),
            for_stop(StopReason::TooManyFailures),
            for_stop(StopReason::Interrupted),
        ];
        assert_eq!(codes, [0, 2, 3, 130]);
        assert_eq!(for_error(&EngineError::Scheduling("stuck".into())), SCHEDULING);
        assert_eq!(for_error(&EngineError::Persistence("disk".into())), INVALID);
    }
}
