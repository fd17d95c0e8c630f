//! Sandboxed execution dispatcher for untrusted code.
//!
//! This crate accepts source snippets or small multi-file projects, runs each
//! one inside a single ephemeral, memory-capped, network-isolated container
//! and normalizes what happened into an API-facing result.
//!
//! # Architecture Overview
//!
//! - **Profiles**: language identifiers and aliases resolved to fixed runtime images and limits
//! - **Sandbox providers**: the container runtime behind one swappable capability (Docker API or CLI)
//! - **Launcher**: stages payloads on the host and guarantees their release on every exit path
//! - **Deadline supervision**: wall-clock bounds with explicit teardown of the isolation unit
//! - **Normalization**: outcomes and validation errors mapped onto success/failure results
//! - **History**: bounded newest-first log of recent executions behind a single writer
//! - **Dispatcher**: wires the above together for the HTTP layer

pub mod archive;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod history;
pub mod launcher;
pub mod normalizer;
pub mod outcome;
pub mod payload;
pub mod profiles;
pub mod sandbox;
pub mod supervisor;

pub use config::*;
pub use dispatcher::{DispatchLimits, Dispatcher};
pub use errors::{DispatchError, HistoryError, SandboxError};
pub use history::{HistoryEntry, HistoryLog, HistoryStore};
pub use launcher::Launcher;
pub use normalizer::{normalize, ExecutionResult};
pub use outcome::{ExecutionOutcome, OutcomeStatus};
pub use payload::ExecutionPayload;
pub use profiles::{IsolationProfile, ProfileRegistry};
pub use sandbox::{SandboxProvider, UnitId};
