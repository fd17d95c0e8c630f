//! Isolation runtimes behind a single capability.
//!
//! A `SandboxProvider` turns an `Invocation` into exactly one isolation unit,
//! runs it to completion and removes it. The unit's identity (`UnitId`) is
//! chosen by the caller before launch, so a supervisor that gives up on the
//! run can still address the unit and tear it down through `terminate`.

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{ExecutionConfig, ProviderKind};
use crate::errors::SandboxError;
use crate::payload::PayloadKind;
use crate::profiles::{FilesystemPolicy, IsolationProfile, NetworkPolicy, MOUNT_ROOT};

pub mod cli;
pub mod docker;

pub use cli::CliProvider;
pub use docker::DockerProvider;

/// Label attached to every unit so leftovers can be listed.
pub const MANAGED_LABEL: &str = "safexec.managed";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnitId(String);

impl UnitId {
    pub fn generate() -> Self {
        Self(format!("safexec-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(host_path: PathBuf, container_path: impl Into<String>) -> Self {
        Self {
            host_path,
            container_path: container_path.into(),
            read_only: true,
        }
    }

    /// `host:container[:ro]`, the bind syntax shared by the Engine API and the CLI.
    pub fn bind_spec(&self) -> String {
        let mut spec = format!("{}:{}", self.host_path.display(), self.container_path);
        if self.read_only {
            spec.push_str(":ro");
        }
        spec
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    /// Always equal to `memory_bytes` so swap cannot extend the memory cap.
    pub memory_swap_bytes: i64,
    pub pids_limit: Option<i64>,
}

impl ResourceLimits {
    pub fn new(memory_bytes: i64, pids_limit: Option<i64>) -> Self {
        Self {
            memory_bytes,
            memory_swap_bytes: memory_bytes,
            pids_limit,
        }
    }
}

/// Everything a provider needs to create one isolation unit.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub unit: UnitId,
    pub image: String,
    pub command: Vec<String>,
    pub mount: Mount,
    pub working_dir: String,
    pub limits: ResourceLimits,
    pub network: NetworkPolicy,
    pub filesystem: FilesystemPolicy,
}

impl Invocation {
    pub fn new(
        unit: UnitId,
        profile: &IsolationProfile,
        kind: PayloadKind,
        entry_path: &str,
        mount: Mount,
        pids_limit: Option<i64>,
    ) -> Self {
        Self {
            unit,
            image: profile.container_image.clone(),
            command: profile.command_for(entry_path),
            mount,
            working_dir: MOUNT_ROOT.to_string(),
            limits: ResourceLimits::new(profile.memory_limit_for(kind), pids_limit),
            network: profile.network_policy,
            filesystem: profile.filesystem_policy,
        }
    }
}

/// Output of a unit that ran to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct RawExit {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Creates, starts and awaits one isolation unit named `invocation.unit`,
    /// removing it once its output has been collected. An `Err` means the
    /// user process never got to run.
    async fn run(&self, invocation: &Invocation) -> Result<RawExit, SandboxError>;

    /// Forcefully stops and removes the unit. A unit that no longer exists
    /// counts as terminated.
    async fn terminate(&self, unit: &UnitId) -> Result<(), SandboxError>;

    /// Names of units created by this service that still exist.
    async fn list_units(&self) -> Result<Vec<String>, SandboxError>;

    async fn is_available(&self) -> bool;
}

pub fn provider_from_config(
    config: &ExecutionConfig,
) -> Result<Arc<dyn SandboxProvider>, SandboxError> {
    match config.provider {
        ProviderKind::Docker => {
            let provider = DockerProvider::connect(config.pull_missing_images)?;
            Ok(Arc::new(provider))
        }
        ProviderKind::Cli => Ok(Arc::new(CliProvider::new(config.runtime_binary.clone()))),
    }
}
