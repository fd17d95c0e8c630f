//! Wall-clock supervision of one isolation unit.
//!
//! A unit moves `Pending -> Running -> {Completed | TimedOut | LaunchFailed}`.
//! When the deadline fires, dropping the provider's future only stops the
//! local side (API request or CLI child). The unit itself may still be
//! running, so the supervisor always follows up with an explicit
//! `terminate` against the unit's name before reporting `TimedOut`. A create
//! request abandoned mid-flight may still land after that first removal, so
//! the runtime's unit listing is checked once more after a short settle delay.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::outcome::{ExecutionOutcome, OutcomeStatus};
use crate::sandbox::{Invocation, SandboxProvider, UnitId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    Running,
    Completed,
    TimedOut,
    LaunchFailed,
}

impl UnitState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UnitState::Completed | UnitState::TimedOut | UnitState::LaunchFailed
        )
    }
}

impl From<OutcomeStatus> for UnitState {
    fn from(status: OutcomeStatus) -> Self {
        match status {
            OutcomeStatus::Ok => UnitState::Completed,
            OutcomeStatus::TimedOut => UnitState::TimedOut,
            OutcomeStatus::LaunchFailed => UnitState::LaunchFailed,
        }
    }
}

/// Tracks one unit's lifecycle. `finish` consumes the tracker, so the
/// terminal state is reported exactly once.
struct Supervision<'a> {
    unit: &'a UnitId,
    state: UnitState,
    started: Instant,
}

impl<'a> Supervision<'a> {
    fn new(unit: &'a UnitId) -> Self {
        Self {
            unit,
            state: UnitState::Pending,
            started: Instant::now(),
        }
    }

    fn running(&mut self) {
        self.transition(UnitState::Running);
    }

    fn finish(mut self, outcome: ExecutionOutcome) -> ExecutionOutcome {
        self.transition(outcome.status.into());
        outcome
    }

    fn transition(&mut self, next: UnitState) {
        debug_assert!(!self.state.is_terminal(), "unit {} already finished", self.unit);
        log::debug!(
            "Unit {}: {:?} -> {:?} after {:?}",
            self.unit,
            self.state,
            next,
            self.started.elapsed()
        );
        self.state = next;
    }
}

/// Pause before re-checking the runtime for a unit that was just terminated.
const SETTLE_DELAY: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub struct DeadlineSupervisor {
    provider: Arc<dyn SandboxProvider>,
}

impl DeadlineSupervisor {
    pub fn new(provider: Arc<dyn SandboxProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn SandboxProvider> {
        &self.provider
    }

    pub async fn supervise(&self, invocation: &Invocation, deadline: Duration) -> ExecutionOutcome {
        let mut supervision = Supervision::new(&invocation.unit);
        supervision.running();

        match tokio::time::timeout(deadline, self.provider.run(invocation)).await {
            Ok(Ok(exit)) => supervision.finish(ExecutionOutcome::completed(exit)),
            Ok(Err(e)) => {
                log::warn!("Unit {} failed to launch: {}", invocation.unit, e);
                // The runtime may have created the unit before failing.
                self.teardown(&invocation.unit, false).await;
                supervision.finish(ExecutionOutcome::launch_failed(e.to_string()))
            }
            Err(_) => {
                log::warn!(
                    "Unit {} exceeded its {:?} deadline, terminating",
                    invocation.unit,
                    deadline
                );
                self.teardown(&invocation.unit, true).await;
                supervision.finish(ExecutionOutcome::timed_out(deadline))
            }
        }
    }

    async fn teardown(&self, unit: &UnitId, expected_running: bool) {
        match self.provider.terminate(unit).await {
            Ok(()) => log::debug!("Unit {} terminated", unit),
            Err(e) if expected_running => log::error!("Unit {} could not be terminated: {}", unit, e),
            Err(e) => log::debug!("Cleanup of unit {} after launch failure: {}", unit, e),
        }
        if expected_running {
            self.sweep(unit).await;
        }
    }

    async fn sweep(&self, unit: &UnitId) {
        tokio::time::sleep(SETTLE_DELAY).await;
        match self.provider.list_units().await {
            Ok(units) if units.iter().any(|name| name == unit.as_str()) => {
                log::warn!("Unit {} still present after termination, removing again", unit);
                if let Err(e) = self.provider.terminate(unit).await {
                    log::error!("Unit {} could not be terminated: {}", unit, e);
                }
            }
            Ok(_) => {}
            Err(e) => log::debug!("Could not list units after terminating {}: {}", unit, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SandboxError;
    use crate::payload::PayloadKind;
    use crate::profiles::IsolationProfile;
    use crate::sandbox::{Mount, RawExit};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Keeps a set of "running" units, like a container runtime would.
    struct SleepyProvider {
        run_for: Duration,
        fail_launch: bool,
        running: Mutex<HashSet<String>>,
        terminated: Mutex<Vec<String>>,
    }

    impl SleepyProvider {
        fn new(run_for: Duration) -> Self {
            Self {
                run_for,
                fail_launch: false,
                running: Mutex::new(HashSet::new()),
                terminated: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SandboxProvider for SleepyProvider {
        fn name(&self) -> &'static str {
            "sleepy"
        }

        async fn run(&self, invocation: &Invocation) -> Result<RawExit, SandboxError> {
            if self.fail_launch {
                return Err(SandboxError::RuntimeUnavailable("docker: not found".into()));
            }
            self.running.lock().unwrap().insert(invocation.unit.to_string());
            tokio::time::sleep(self.run_for).await;
            self.running.lock().unwrap().remove(invocation.unit.as_str());
            Ok(RawExit {
                stdout: "done\n".into(),
                stderr: String::new(),
                exit_code: 0,
            })
        }

        async fn terminate(&self, unit: &UnitId) -> Result<(), SandboxError> {
            self.running.lock().unwrap().remove(unit.as_str());
            self.terminated.lock().unwrap().push(unit.to_string());
            Ok(())
        }

        async fn list_units(&self) -> Result<Vec<String>, SandboxError> {
            Ok(self.running.lock().unwrap().iter().cloned().collect())
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    fn invocation() -> Invocation {
        Invocation::new(
            UnitId::generate(),
            &IsolationProfile::python(),
            PayloadKind::Snippet,
            "/app/script.py",
            Mount::read_only(PathBuf::from("/tmp/script.py"), "/app/script.py"),
            None,
        )
    }

    #[tokio::test]
    async fn test_completes_within_deadline() {
        let provider = Arc::new(SleepyProvider::new(Duration::from_millis(10)));
        let supervisor = DeadlineSupervisor::new(provider.clone());

        let outcome = supervisor.supervise(&invocation(), Duration::from_secs(5)).await;
        assert_eq!(outcome.status, OutcomeStatus::Ok);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout, "done\n");
        assert!(provider.terminated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_terminates_the_unit() {
        let provider = Arc::new(SleepyProvider::new(Duration::from_secs(30)));
        let supervisor = DeadlineSupervisor::new(provider.clone());
        let invocation = invocation();

        let started = Instant::now();
        let outcome = supervisor
            .supervise(&invocation, Duration::from_millis(100))
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(outcome.status, OutcomeStatus::TimedOut);
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.stdout.is_empty());
        assert!(outcome.stderr.contains("timed out"));
        assert_eq!(
            *provider.terminated.lock().unwrap(),
            vec![invocation.unit.to_string()]
        );
        assert!(provider.list_units().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_launch_failure() {
        let mut provider = SleepyProvider::new(Duration::ZERO);
        provider.fail_launch = true;
        let supervisor = DeadlineSupervisor::new(Arc::new(provider));

        let outcome = supervisor.supervise(&invocation(), Duration::from_secs(1)).await;
        assert_eq!(outcome.status, OutcomeStatus::LaunchFailed);
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.stderr.contains("docker: not found"));
    }

    /// The runtime registers the unit only some time after `run` is called,
    /// like a daemon still processing a create request.
    struct LateCreateProvider {
        lands_after: Duration,
        running: Arc<Mutex<HashSet<String>>>,
        terminated: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SandboxProvider for LateCreateProvider {
        fn name(&self) -> &'static str {
            "late"
        }

        async fn run(&self, invocation: &Invocation) -> Result<RawExit, SandboxError> {
            let running = self.running.clone();
            let unit = invocation.unit.to_string();
            let lands_after = self.lands_after;
            tokio::spawn(async move {
                tokio::time::sleep(lands_after).await;
                running.lock().unwrap().insert(unit);
            });
            std::future::pending::<Result<RawExit, SandboxError>>().await
        }

        async fn terminate(&self, unit: &UnitId) -> Result<(), SandboxError> {
            self.running.lock().unwrap().remove(unit.as_str());
            self.terminated.lock().unwrap().push(unit.to_string());
            Ok(())
        }

        async fn list_units(&self) -> Result<Vec<String>, SandboxError> {
            Ok(self.running.lock().unwrap().iter().cloned().collect())
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_unit_created_after_terminate_is_removed() {
        let provider = Arc::new(LateCreateProvider {
            lands_after: Duration::from_millis(50),
            running: Arc::new(Mutex::new(HashSet::new())),
            terminated: Mutex::new(Vec::new()),
        });
        let supervisor = DeadlineSupervisor::new(provider.clone());
        let invocation = invocation();

        let outcome = supervisor
            .supervise(&invocation, Duration::from_millis(10))
            .await;

        assert_eq!(outcome.status, OutcomeStatus::TimedOut);
        assert_eq!(provider.terminated.lock().unwrap().len(), 2);
        assert!(provider.list_units().await.unwrap().is_empty());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!UnitState::Pending.is_terminal());
        assert!(!UnitState::Running.is_terminal());
        assert!(UnitState::from(OutcomeStatus::Ok).is_terminal());
        assert_eq!(UnitState::from(OutcomeStatus::TimedOut), UnitState::TimedOut);
        assert_eq!(UnitState::from(OutcomeStatus::LaunchFailed), UnitState::LaunchFailed);
    }
}
