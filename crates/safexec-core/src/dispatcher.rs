//! Request-level entry point: validate, resolve, launch, normalize, record.

use std::path::Path;
use std::sync::Arc;

use crate::archive::{extract_zip, ArchiveLimits};
use crate::config::ServiceConfig;
use crate::errors::{DispatchError, HistoryError};
use crate::history::{HistoryEntry, HistoryLog};
use crate::launcher::Launcher;
use crate::normalizer::{normalize, ExecutionResult};
use crate::payload::{ExecutionPayload, PayloadKind};
use crate::profiles::{IsolationProfile, ProfileRegistry};
use crate::sandbox::{provider_from_config, SandboxProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchLimits {
    pub max_code_chars: usize,
    pub snippet_chars: usize,
    pub archive: ArchiveLimits,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self::from(&ServiceConfig::default())
    }
}

impl From<&ServiceConfig> for DispatchLimits {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            max_code_chars: config.execution.max_code_chars,
            snippet_chars: config.history.snippet_chars,
            archive: ArchiveLimits::from(&config.execution),
        }
    }
}

pub struct Dispatcher {
    registry: ProfileRegistry,
    launcher: Launcher,
    history: HistoryLog,
    limits: DispatchLimits,
}

impl Dispatcher {
    pub fn new(
        registry: ProfileRegistry,
        launcher: Launcher,
        history: HistoryLog,
        limits: DispatchLimits,
    ) -> Self {
        Self {
            registry,
            launcher,
            history,
            limits,
        }
    }

    /// Wires every component from configuration, connecting to the
    /// configured isolation runtime.
    pub fn from_config(config: &ServiceConfig) -> Result<Self, DispatchError> {
        let provider = provider_from_config(&config.execution)
            .map_err(|e| DispatchError::config(e.to_string()))?;
        Self::with_provider(config, provider)
    }

    pub fn with_provider(
        config: &ServiceConfig,
        provider: Arc<dyn SandboxProvider>,
    ) -> Result<Self, DispatchError> {
        config.validate()?;
        let registry = ProfileRegistry::from_config(config)?;
        let launcher = Launcher::new(provider).with_pids_limit(config.execution.pids_limit);
        let history = match &config.history.path {
            Some(path) => {
                log::info!("Persisting execution history to {}", path.display());
                HistoryLog::open(path, config.history.capacity)
            }
            None => HistoryLog::in_memory(config.history.capacity),
        };

        log::info!(
            "Dispatcher ready: provider={}, languages={:?}",
            launcher.provider().name(),
            registry.languages()
        );
        Ok(Self::new(registry, launcher, history, DispatchLimits::from(config)))
    }

    /// Runs one inline snippet. Validation failures are returned as failure
    /// results without creating an isolation unit.
    pub async fn run_snippet(&self, language: &str, code: &str) -> ExecutionResult {
        let profile = match self.validate_snippet(language, code) {
            Ok(profile) => profile,
            Err(e) => {
                log::info!("Rejected {} snippet: {}", language, e);
                return e.into();
            }
        };

        let payload = ExecutionPayload::inline(code, profile.entry_filename.clone());
        let result = self.execute(profile, &payload).await;
        self.record(&profile.language_id, code, &result).await;
        result
    }

    fn validate_snippet(&self, language: &str, code: &str) -> Result<&IsolationProfile, DispatchError> {
        let actual = code.chars().count();
        if actual > self.limits.max_code_chars {
            return Err(DispatchError::PayloadTooLarge {
                limit: self.limits.max_code_chars,
                actual,
            });
        }
        self.registry.resolve(language)
    }

    /// Extracts an uploaded archive and runs it as a project.
    pub async fn run_archive(&self, bytes: Vec<u8>) -> ExecutionResult {
        let limits = self.limits.archive;
        let extracted = match tokio::task::spawn_blocking(move || extract_zip(&bytes, &limits)).await {
            Ok(Ok(project)) => project,
            Ok(Err(e)) => {
                log::info!("Rejected archive: {}", e);
                return e.into();
            }
            Err(e) => {
                log::error!("Archive extraction task failed: {}", e);
                return DispatchError::LaunchFailed(e.to_string()).into();
            }
        };

        let result = self.run_project(extracted.path()).await;
        drop(extracted);
        result
    }

    /// Runs an already-extracted project directory, picking the profile by
    /// its entry file.
    pub async fn run_project(&self, dir: &Path) -> ExecutionResult {
        let profile = match self.registry.resolve_project(dir) {
            Ok(profile) => profile,
            Err(e) => {
                log::info!("Rejected project {}: {}", dir.display(), e);
                return e.into();
            }
        };

        let payload = ExecutionPayload::project(dir, profile.project_entry.clone());
        let result = self.execute(profile, &payload).await;
        self.record(&profile.language_id, &profile.project_entry, &result)
            .await;
        result
    }

    async fn execute(&self, profile: &IsolationProfile, payload: &ExecutionPayload) -> ExecutionResult {
        let deadline = profile.timeout_for(payload.kind());
        let outcome = self.launcher.run(profile, payload, deadline).await;
        let result = normalize(outcome);

        let kind = match payload.kind() {
            PayloadKind::Snippet => "snippet",
            PayloadKind::Project => "project",
        };
        log::info!(
            "{} {} finished with exit code {}",
            profile.language_id,
            kind,
            result.exit_code()
        );
        result
    }

    async fn record(&self, language: &str, code: &str, result: &ExecutionResult) {
        let entry = HistoryEntry::new(language, code, result, self.limits.snippet_chars);
        if let Err(e) = self.history.append(entry).await {
            log::warn!("Failed to record execution history: {}", e);
        }
    }

    pub async fn recent(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        self.history.recent().await
    }

    pub fn registry(&self) -> &ProfileRegistry {
        &self.registry
    }

    pub fn launcher(&self) -> &Launcher {
        &self.launcher
    }

    pub fn limits(&self) -> &DispatchLimits {
        &self.limits
    }
}
