//! Turns a resolved profile and a payload into one supervised isolation unit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::outcome::ExecutionOutcome;
use crate::payload::{ExecutionPayload, StagedPayload};
use crate::profiles::IsolationProfile;
use crate::sandbox::{Invocation, SandboxProvider, UnitId};
use crate::supervisor::DeadlineSupervisor;

pub struct Launcher {
    supervisor: DeadlineSupervisor,
    pids_limit: Option<i64>,
    invocations: AtomicU64,
}

impl Launcher {
    pub fn new(provider: Arc<dyn SandboxProvider>) -> Self {
        Self {
            supervisor: DeadlineSupervisor::new(provider),
            pids_limit: None,
            invocations: AtomicU64::new(0),
        }
    }

    pub fn with_pids_limit(mut self, pids_limit: Option<i64>) -> Self {
        self.pids_limit = pids_limit;
        self
    }

    /// Stages the payload, runs it under the profile's isolation policy and
    /// waits at most `deadline`. Every failure is folded into the outcome.
    ///
    /// Host-side scratch storage is released before this returns, on every
    /// path including timeouts.
    pub async fn run(
        &self,
        profile: &IsolationProfile,
        payload: &ExecutionPayload,
        deadline: Duration,
    ) -> ExecutionOutcome {
        self.invocations.fetch_add(1, Ordering::Relaxed);

        let staged = match StagedPayload::stage(payload).await {
            Ok(staged) => staged,
            Err(e) => {
                log::error!("Failed to stage {} payload: {}", profile.language_id, e);
                return ExecutionOutcome::launch_failed(e.to_string());
            }
        };

        let invocation = Invocation::new(
            UnitId::generate(),
            profile,
            payload.kind(),
            &payload.entry_path_in_unit(),
            staged.mount().clone(),
            self.pids_limit,
        );
        log::info!(
            "Launching {} ({}) as {} with a {:?} deadline",
            profile.language_id,
            invocation.image,
            invocation.unit,
            deadline
        );

        let outcome = self.supervisor.supervise(&invocation, deadline).await;
        drop(staged);
        outcome
    }

    /// Number of launches attempted since startup.
    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn provider(&self) -> &Arc<dyn SandboxProvider> {
        self.supervisor.provider()
    }
}
