//! Service configuration loaded from YAML
//!
//! Every field has a default, so an empty document (or no file at all) yields
//! a working configuration: daemon-backed Docker isolation, 10 second snippet
//! deadline, 5000 character snippets, and an in-memory history of 10 entries.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::errors::DispatchError;
use crate::profiles::ProfileRegistry;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub profiles: Vec<ProfileOverride>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which isolation runtime backs the sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Docker Engine API through bollard
    #[default]
    Docker,
    /// `docker run` (or a compatible CLI) as a supervised child process
    Cli,
}

impl std::str::FromStr for ProviderKind {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(ProviderKind::Docker),
            "cli" => Ok(ProviderKind::Cli),
            other => Err(DispatchError::config(format!(
                "Unknown sandbox provider '{}' (expected 'docker' or 'cli')",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default = "default_runtime_binary")]
    pub runtime_binary: String,
    #[serde(default = "default_snippet_timeout")]
    pub snippet_timeout_secs: u64,
    #[serde(default = "default_project_timeout")]
    pub project_timeout_secs: u64,
    #[serde(default = "default_max_code_chars")]
    pub max_code_chars: usize,
    #[serde(default = "default_max_archive_bytes")]
    pub max_archive_bytes: u64,
    #[serde(default = "default_max_archive_entries")]
    pub max_archive_entries: usize,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: Option<i64>,
    #[serde(default = "default_true")]
    pub pull_missing_images: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_capacity")]
    pub capacity: usize,
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
    /// JSON file backing the history; in-memory when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Per-language adjustments layered over the built-in profile table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileOverride {
    pub language: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    #[serde(default)]
    pub project_memory_limit_mb: Option<u64>,
    #[serde(default)]
    pub snippet_timeout_secs: Option<u64>,
    #[serde(default)]
    pub project_timeout_secs: Option<u64>,
    #[serde(default)]
    pub run_command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            runtime_binary: default_runtime_binary(),
            snippet_timeout_secs: default_snippet_timeout(),
            project_timeout_secs: default_project_timeout(),
            max_code_chars: default_max_code_chars(),
            max_archive_bytes: default_max_archive_bytes(),
            max_archive_entries: default_max_archive_entries(),
            pids_limit: default_pids_limit(),
            pull_missing_images: true,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: default_history_capacity(),
            snippet_chars: default_snippet_chars(),
            path: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), DispatchError> {
        let exec = &self.execution;
        if exec.snippet_timeout_secs == 0 || exec.project_timeout_secs == 0 {
            return Err(DispatchError::config("Execution timeouts must be greater than 0 seconds"));
        }
        if exec.max_code_chars == 0 {
            return Err(DispatchError::config("execution.max_code_chars must be greater than 0"));
        }
        if exec.runtime_binary.trim().is_empty() {
            return Err(DispatchError::config("execution.runtime_binary must not be empty"));
        }
        if matches!(exec.pids_limit, Some(limit) if limit <= 0) {
            return Err(DispatchError::config("execution.pids_limit must be positive"));
        }
        if self.history.capacity == 0 {
            return Err(DispatchError::config("history.capacity must be greater than 0"));
        }

        for profile in &self.profiles {
            if profile.snippet_timeout_secs == Some(0) || profile.project_timeout_secs == Some(0) {
                return Err(DispatchError::config(format!(
                    "Profile '{}' timeouts must be greater than 0 seconds",
                    profile.language
                )));
            }
            if profile.memory_limit_mb == Some(0) || profile.project_memory_limit_mb == Some(0) {
                return Err(DispatchError::config(format!(
                    "Profile '{}' memory limits must be greater than 0",
                    profile.language
                )));
            }
            if matches!(&profile.run_command, Some(cmd) if cmd.is_empty()) {
                return Err(DispatchError::config(format!(
                    "Profile '{}' run_command must not be empty",
                    profile.language
                )));
            }
        }

        // Limits only make sense once merged with the built-in table.
        ProfileRegistry::from_config(self)?;
        Ok(())
    }
}

/// Configuration loader for YAML files
pub struct ConfigLoader;

impl ConfigLoader {
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<ServiceConfig, DispatchError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await.map_err(|e| {
            DispatchError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<ServiceConfig, DispatchError> {
        // An empty document deserializes to unit, not to a map.
        let config: ServiceConfig = if content.trim().is_empty() {
            ServiceConfig::default()
        } else {
            serde_yaml::from_str(content)
                .map_err(|e| DispatchError::config(format!("Failed to parse YAML config: {}", e)))?
        };
        config.validate()?;
        Ok(config)
    }
}

fn default_runtime_binary() -> String {
    "docker".to_string()
}

fn default_snippet_timeout() -> u64 {
    10
}

fn default_project_timeout() -> u64 {
    20
}

fn default_max_code_chars() -> usize {
    5000
}

fn default_max_archive_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_max_archive_entries() -> usize {
    512
}

fn default_pids_limit() -> Option<i64> {
    Some(64)
}

fn default_history_capacity() -> usize {
    10
}

fn default_snippet_chars() -> usize {
    120
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}
