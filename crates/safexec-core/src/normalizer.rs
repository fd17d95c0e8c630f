//! Maps launch outcomes and pre-launch rejections onto the API-facing result.
//!
//! Callers only ever see two shapes: a success carrying stdout, or a failure
//! carrying a message and an exit code. Infrastructure failures (timeout,
//! launch failure) and rejected requests use negative sentinel exit codes so
//! they can be told apart from user code that exited non-zero.

use serde::{Deserialize, Serialize};

use crate::errors::DispatchError;
use crate::outcome::{ExecutionOutcome, OutcomeStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecutionResult {
    Success { output: String },
    Failure { error: String, exit_code: i64 },
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success { .. })
    }

    pub fn exit_code(&self) -> i64 {
        match self {
            ExecutionResult::Success { .. } => 0,
            ExecutionResult::Failure { exit_code, .. } => *exit_code,
        }
    }

    pub fn output(&self) -> &str {
        match self {
            ExecutionResult::Success { output } => output,
            ExecutionResult::Failure { .. } => "",
        }
    }

    pub fn error(&self) -> &str {
        match self {
            ExecutionResult::Success { .. } => "",
            ExecutionResult::Failure { error, .. } => error,
        }
    }
}

impl From<&DispatchError> for ExecutionResult {
    fn from(err: &DispatchError) -> Self {
        ExecutionResult::Failure {
            error: err.to_string(),
            exit_code: err.exit_code(),
        }
    }
}

impl From<DispatchError> for ExecutionResult {
    fn from(err: DispatchError) -> Self {
        ExecutionResult::from(&err)
    }
}

pub fn normalize(outcome: ExecutionOutcome) -> ExecutionResult {
    let failure = match (outcome.status, outcome.exit_code) {
        (OutcomeStatus::Ok, Some(0)) => {
            return ExecutionResult::Success {
                output: outcome.stdout,
            }
        }
        (OutcomeStatus::Ok, Some(exit_code)) => DispatchError::NonZeroExit {
            exit_code,
            stderr: outcome.stderr,
        },
        (OutcomeStatus::TimedOut, _) => match outcome.deadline {
            Some(deadline) => DispatchError::TimedOut(deadline),
            None => DispatchError::LaunchFailed(outcome.stderr),
        },
        // A completed unit without a status is a provider bug; report it as infrastructure.
        (OutcomeStatus::Ok, None) | (OutcomeStatus::LaunchFailed, _) => {
            DispatchError::LaunchFailed(outcome.stderr)
        }
    };
    failure.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{LAUNCH_FAILED_EXIT_CODE, REJECTED_EXIT_CODE, TIMED_OUT_EXIT_CODE};
    use crate::sandbox::RawExit;
    use std::time::Duration;

    fn exit(stdout: &str, stderr: &str, code: i64) -> ExecutionOutcome {
        ExecutionOutcome::completed(RawExit {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code: code,
        })
    }

    #[test]
    fn test_zero_exit_is_success() {
        let result = normalize(exit("hello\n", "", 0));
        assert_eq!(
            result,
            ExecutionResult::Success {
                output: "hello\n".to_string()
            }
        );
        assert_eq!(result.exit_code(), 0);
    }

    #[test]
    fn test_non_zero_exit_carries_stderr() {
        let result = normalize(exit("partial", "Traceback: boom\n", 1));
        assert_eq!(
            result,
            ExecutionResult::Failure {
                error: "Traceback: boom\n".to_string(),
                exit_code: 1
            }
        );
    }

    #[test]
    fn test_non_zero_exit_without_stderr_uses_generic_message() {
        let result = normalize(exit("", "", 7));
        assert_eq!(result.error(), "Execution failed");
        assert_eq!(result.exit_code(), 7);
    }

    #[test]
    fn test_infrastructure_failures_use_sentinels() {
        let timed_out = normalize(ExecutionOutcome::timed_out(Duration::from_secs(10)));
        assert_eq!(timed_out.exit_code(), TIMED_OUT_EXIT_CODE);
        assert_eq!(timed_out.error(), "Execution timed out after 10 seconds.");

        let sub_second = normalize(ExecutionOutcome::timed_out(Duration::from_millis(300)));
        assert_eq!(sub_second.error(), "Execution timed out after 300 ms.");

        let launch = normalize(ExecutionOutcome::launch_failed("docker: not found"));
        assert_eq!(launch.exit_code(), LAUNCH_FAILED_EXIT_CODE);
        assert_eq!(launch.error(), "Internal error: docker: not found");
    }

    #[test]
    fn test_rejection_serializes_as_failure() {
        let result = ExecutionResult::from(DispatchError::UnsupportedLanguage("ruby".into()));
        assert_eq!(result.exit_code(), REJECTED_EXIT_CODE);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["error"], "Unsupported language: ruby");
        assert_eq!(json["exit_code"], REJECTED_EXIT_CODE);
        assert!(json.get("output").is_none());
    }
}
