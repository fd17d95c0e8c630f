//! Isolation profile registry.
//!
//! Every supported language maps to one fixed profile: the runtime image,
//! the file names used for snippets and projects, the command template and
//! the resource limits. Profiles are built once at startup from the built-in
//! table plus any configuration overrides and never change afterwards.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::config::{ProfileOverride, ServiceConfig};
use crate::errors::DispatchError;
use crate::payload::PayloadKind;

/// Placeholder in a run command that is replaced with the in-unit entry path.
pub const ENTRY_PLACEHOLDER: &str = "{entry}";
/// Directory inside the unit where the payload is mounted.
pub const MOUNT_ROOT: &str = "/app";

const MIB: i64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPolicy {
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilesystemPolicy {
    ReadOnlyRoot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IsolationProfile {
    pub language_id: String,
    pub aliases: Vec<String>,
    pub container_image: String,
    /// File name used when staging an inline snippet.
    pub entry_filename: String,
    /// Entry file that selects this profile for a project directory.
    pub project_entry: String,
    pub run_command: Vec<String>,
    pub memory_limit_bytes: i64,
    pub project_memory_limit_bytes: i64,
    pub snippet_timeout: Duration,
    pub project_timeout: Duration,
    pub network_policy: NetworkPolicy,
    pub filesystem_policy: FilesystemPolicy,
}

impl IsolationProfile {
    pub fn python() -> Self {
        Self {
            language_id: "python".to_string(),
            aliases: vec!["python3".to_string(), "py".to_string()],
            container_image: "python:3.11-slim".to_string(),
            entry_filename: "script.py".to_string(),
            project_entry: "main.py".to_string(),
            run_command: vec!["python".to_string(), ENTRY_PLACEHOLDER.to_string()],
            memory_limit_bytes: 128 * MIB,
            project_memory_limit_bytes: 256 * MIB,
            snippet_timeout: Duration::from_secs(10),
            project_timeout: Duration::from_secs(20),
            network_policy: NetworkPolicy::None,
            filesystem_policy: FilesystemPolicy::ReadOnlyRoot,
        }
    }

    pub fn node() -> Self {
        Self {
            language_id: "javascript".to_string(),
            aliases: vec!["js".to_string(), "node".to_string(), "nodejs".to_string()],
            container_image: "node:18-slim".to_string(),
            entry_filename: "script.js".to_string(),
            project_entry: "index.js".to_string(),
            run_command: vec!["node".to_string(), ENTRY_PLACEHOLDER.to_string()],
            memory_limit_bytes: 128 * MIB,
            project_memory_limit_bytes: 256 * MIB,
            snippet_timeout: Duration::from_secs(10),
            project_timeout: Duration::from_secs(20),
            network_policy: NetworkPolicy::None,
            filesystem_policy: FilesystemPolicy::ReadOnlyRoot,
        }
    }

    pub fn matches(&self, language: &str) -> bool {
        let wanted = language.trim().to_lowercase();
        self.language_id == wanted || self.aliases.iter().any(|alias| *alias == wanted)
    }

    /// Expands the run command for an entry file mounted at `entry_path`.
    pub fn command_for(&self, entry_path: &str) -> Vec<String> {
        self.run_command
            .iter()
            .map(|part| part.replace(ENTRY_PLACEHOLDER, entry_path))
            .collect()
    }

    pub fn memory_limit_for(&self, kind: PayloadKind) -> i64 {
        match kind {
            PayloadKind::Snippet => self.memory_limit_bytes,
            PayloadKind::Project => self.project_memory_limit_bytes,
        }
    }

    pub fn timeout_for(&self, kind: PayloadKind) -> Duration {
        match kind {
            PayloadKind::Snippet => self.snippet_timeout,
            PayloadKind::Project => self.project_timeout,
        }
    }

    fn apply(&mut self, overrides: &ProfileOverride) -> Result<(), DispatchError> {
        if let Some(image) = &overrides.image {
            self.container_image = image.clone();
        }
        if let Some(mb) = overrides.memory_limit_mb {
            self.memory_limit_bytes = mib_to_bytes(&self.language_id, mb)?;
        }
        if let Some(mb) = overrides.project_memory_limit_mb {
            self.project_memory_limit_bytes = mib_to_bytes(&self.language_id, mb)?;
        }
        if let Some(secs) = overrides.snippet_timeout_secs {
            self.snippet_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = overrides.project_timeout_secs {
            self.project_timeout = Duration::from_secs(secs);
        }
        if let Some(command) = &overrides.run_command {
            self.run_command = command.clone();
        }
        Ok(())
    }
}

fn mib_to_bytes(language: &str, mb: u64) -> Result<i64, DispatchError> {
    i64::try_from(mb)
        .ok()
        .and_then(|mb| mb.checked_mul(MIB))
        .ok_or_else(|| {
            DispatchError::config(format!(
                "Profile '{}' memory limit of {} MiB is out of range",
                language, mb
            ))
        })
}

#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: Vec<IsolationProfile>,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProfileRegistry {
    /// Python first, so `main.py` wins when a project has both entry files.
    pub fn builtin() -> Self {
        Self::new(vec![IsolationProfile::python(), IsolationProfile::node()])
    }

    pub fn new(profiles: Vec<IsolationProfile>) -> Self {
        Self { profiles }
    }

    pub fn from_config(config: &ServiceConfig) -> Result<Self, DispatchError> {
        let mut registry = Self::builtin();
        for profile in &mut registry.profiles {
            profile.snippet_timeout = Duration::from_secs(config.execution.snippet_timeout_secs);
            profile.project_timeout = Duration::from_secs(config.execution.project_timeout_secs);
        }

        for overrides in &config.profiles {
            let profile = registry
                .profiles
                .iter_mut()
                .find(|p| p.matches(&overrides.language))
                .ok_or_else(|| {
                    DispatchError::config(format!(
                        "Profile override for unknown language '{}'",
                        overrides.language
                    ))
                })?;
            profile.apply(overrides)?;
            log::debug!("Applied profile override for {}", profile.language_id);
        }

        for profile in &registry.profiles {
            if profile.project_memory_limit_bytes <= profile.memory_limit_bytes {
                return Err(DispatchError::config(format!(
                    "Profile '{}' project memory limit ({} bytes) must exceed its snippet limit ({} bytes)",
                    profile.language_id,
                    profile.project_memory_limit_bytes,
                    profile.memory_limit_bytes
                )));
            }
        }

        Ok(registry)
    }

    pub fn resolve(&self, language: &str) -> Result<&IsolationProfile, DispatchError> {
        self.profiles
            .iter()
            .find(|p| p.matches(language))
            .ok_or_else(|| DispatchError::UnsupportedLanguage(language.to_string()))
    }

    /// Picks the profile whose project entry file exists at the root of `dir`.
    pub fn resolve_project(&self, dir: &Path) -> Result<&IsolationProfile, DispatchError> {
        self.profiles
            .iter()
            .find(|p| dir.join(&p.project_entry).is_file())
            .ok_or(DispatchError::MissingEntryPoint)
    }

    pub fn profiles(&self) -> &[IsolationProfile] {
        &self.profiles
    }

    pub fn languages(&self) -> Vec<&str> {
        self.profiles.iter().map(|p| p.language_id.as_str()).collect()
    }
}
