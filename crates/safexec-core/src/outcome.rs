//! Raw outcome of one supervised launch.

use std::time::Duration;

use crate::sandbox::RawExit;

/// Exit code reported when the isolation unit could not be launched.
pub const LAUNCH_FAILED_EXIT_CODE: i64 = -1;
/// Exit code reported when the deadline expired.
pub const TIMED_OUT_EXIT_CODE: i64 = -2;
/// Exit code reported when a request was rejected before launch.
pub const REJECTED_EXIT_CODE: i64 = -3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Ok,
    TimedOut,
    LaunchFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    /// Only meaningful when `status` is `Ok`.
    pub exit_code: Option<i64>,
    pub status: OutcomeStatus,
    /// The bound that expired, set only when `status` is `TimedOut`.
    pub deadline: Option<Duration>,
}

impl ExecutionOutcome {
    pub fn completed(exit: RawExit) -> Self {
        Self {
            stdout: exit.stdout,
            stderr: exit.stderr,
            exit_code: Some(exit.exit_code),
            status: OutcomeStatus::Ok,
            deadline: None,
        }
    }

    pub fn timed_out(deadline: Duration) -> Self {
        Self {
            stdout: String::new(),
            stderr: timeout_message(deadline),
            exit_code: None,
            status: OutcomeStatus::TimedOut,
            deadline: Some(deadline),
        }
    }

    pub fn launch_failed(message: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: message.into(),
            exit_code: None,
            status: OutcomeStatus::LaunchFailed,
            deadline: None,
        }
    }
}

pub fn timeout_message(deadline: Duration) -> String {
    if deadline.subsec_millis() == 0 {
        format!("Execution timed out after {} seconds.", deadline.as_secs())
    } else {
        format!("Execution timed out after {} ms.", deadline.as_millis())
    }
}
