//! Error types for every failure mode of a dispatch request
//!
//! Failures are split by where they originate. `DispatchError` is the
//! request-level taxonomy surfaced to callers: validation failures that are
//! detected before any isolation unit exists, infrastructure failures
//! (launch, timeout) and user-code failures. `SandboxError` is what a
//! provider reports when talking to the isolation runtime, and
//! `HistoryError` covers the history store.

use std::time::Duration;
use thiserror::Error;

use crate::outcome::{timeout_message, LAUNCH_FAILED_EXIT_CODE, REJECTED_EXIT_CODE, TIMED_OUT_EXIT_CODE};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Missing '{0}' field")]
    MissingField(String),
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("Code too long. Max {limit} chars.")]
    PayloadTooLarge { limit: usize, actual: usize },
    #[error("{0}")]
    InvalidArchive(String),
    #[error("ZIP must contain main.py or index.js")]
    MissingEntryPoint,
    #[error("Internal error: {0}")]
    LaunchFailed(String),
    #[error("{}", timeout_text(.0))]
    TimedOut(Duration),
    #[error("{}", failure_text(.stderr))]
    NonZeroExit { exit_code: i64, stderr: String },
    #[error("Configuration error: {0}")]
    Config(String),
}

fn timeout_text(deadline: &Duration) -> String {
    timeout_message(*deadline)
}

fn failure_text(stderr: &str) -> &str {
    if stderr.is_empty() {
        "Execution failed"
    } else {
        stderr
    }
}

impl DispatchError {
    /// True for failures detected before any isolation unit is created.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DispatchError::MissingField(_)
                | DispatchError::UnsupportedLanguage(_)
                | DispatchError::PayloadTooLarge { .. }
                | DispatchError::InvalidArchive(_)
                | DispatchError::MissingEntryPoint
        )
    }

    /// Exit code reported to API callers. Anything but `NonZeroExit` maps
    /// to a negative sentinel that no real process exit status can take.
    pub fn exit_code(&self) -> i64 {
        match self {
            DispatchError::NonZeroExit { exit_code, .. } => *exit_code,
            DispatchError::LaunchFailed(_) => LAUNCH_FAILED_EXIT_CODE,
            DispatchError::TimedOut(_) => TIMED_OUT_EXIT_CODE,
            _ => REJECTED_EXIT_CODE,
        }
    }

    pub fn invalid_archive(msg: impl Into<String>) -> Self {
        Self::InvalidArchive(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

// Errors raised while talking to an isolation runtime
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Bollard (Docker client) error: {0}")]
    BollardError(#[from] bollard::errors::Error),
    #[error("I/O error during sandbox operation: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Isolation runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("Isolation runtime failed: {0}")]
    Runtime(String),
    #[error("Could not stage payload: {0}")]
    Staging(String),
    #[error("Failed to terminate isolation unit {unit}: {message}")]
    TerminateFailed { unit: String, message: String },
}

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("I/O error in history store: {0}")]
    Io(#[from] std::io::Error),
    #[error("History store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}
