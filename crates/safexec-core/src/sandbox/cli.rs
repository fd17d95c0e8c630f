//! Process-based container runtime.
//!
//! Drives `docker create` + `docker start -a` (or any CLI with the same
//! surface, e.g. podman) as supervised children. Only a failed `create` is a
//! launch failure; the status of `start -a` is the unit's own exit code, so
//! user code may exit with any value including 125. The local client is
//! killed when its future is dropped, and the unit itself is addressed by
//! name through `rm -f` on termination.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use which::which;

use super::{Invocation, RawExit, SandboxProvider, UnitId, MANAGED_LABEL};
use crate::errors::SandboxError;
use crate::profiles::{FilesystemPolicy, NetworkPolicy};

#[derive(Debug, Clone)]
pub struct CliProvider {
    binary: String,
}

impl CliProvider {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn resolve_binary(&self) -> Result<PathBuf, SandboxError> {
        which(&self.binary).map_err(|e| {
            SandboxError::RuntimeUnavailable(format!("{}: {}", self.binary, e))
        })
    }

    fn command(&self, program: PathBuf) -> Command {
        let mut cmd = Command::new(program);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Arguments for `<binary> create ...`; runtime flags must precede the image.
    pub fn create_args(invocation: &Invocation) -> Vec<String> {
        let limits = &invocation.limits;
        let mut args = vec![
            "create".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            invocation.unit.to_string(),
            "--label".to_string(),
            format!("{}=true", MANAGED_LABEL),
            format!("--memory={}", limits.memory_bytes),
            format!("--memory-swap={}", limits.memory_swap_bytes),
        ];

        match invocation.network {
            NetworkPolicy::None => args.extend(["--network".to_string(), "none".to_string()]),
        }
        match invocation.filesystem {
            FilesystemPolicy::ReadOnlyRoot => args.push("--read-only".to_string()),
        }
        if let Some(pids) = limits.pids_limit {
            args.push(format!("--pids-limit={}", pids));
        }

        args.extend([
            "--cap-drop=ALL".to_string(),
            "--security-opt=no-new-privileges".to_string(),
            "--volume".to_string(),
            invocation.mount.bind_spec(),
            "--workdir".to_string(),
            invocation.working_dir.clone(),
            invocation.image.clone(),
        ]);
        args.extend(invocation.command.iter().cloned());
        args
    }
}

#[async_trait]
impl SandboxProvider for CliProvider {
    fn name(&self) -> &'static str {
        "cli"
    }

    async fn run(&self, invocation: &Invocation) -> Result<RawExit, SandboxError> {
        let program = self.resolve_binary()?;
        log::debug!("Creating {} via {}", invocation.unit, program.display());

        let created = self
            .command(program.clone())
            .args(Self::create_args(invocation))
            .output()
            .await?;
        if !created.status.success() {
            return Err(SandboxError::Runtime(
                String::from_utf8_lossy(&created.stderr).trim().to_string(),
            ));
        }

        let output = self
            .command(program)
            .args(["start", "-a", invocation.unit.as_str()])
            .output()
            .await?;

        Ok(RawExit {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: exit_code(output.status),
        })
    }

    async fn terminate(&self, unit: &UnitId) -> Result<(), SandboxError> {
        let program = self.resolve_binary()?;
        let output = self
            .command(program)
            .args(["rm", "-f", unit.as_str()])
            .output()
            .await?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() || stderr.contains("No such container") {
            Ok(())
        } else {
            Err(SandboxError::TerminateFailed {
                unit: unit.to_string(),
                message: stderr.trim().to_string(),
            })
        }
    }

    async fn list_units(&self) -> Result<Vec<String>, SandboxError> {
        let program = self.resolve_binary()?;
        let output = self
            .command(program)
            .args([
                "ps".to_string(),
                "-a".to_string(),
                "--filter".to_string(),
                format!("label={}=true", MANAGED_LABEL),
                "--format".to_string(),
                "{{.Names}}".to_string(),
            ])
            .output()
            .await?;

        if !output.status.success() {
            return Err(SandboxError::Runtime(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn is_available(&self) -> bool {
        let Ok(program) = self.resolve_binary() else {
            return false;
        };
        match self.command(program).arg("version").output().await {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i64 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code as i64,
        // Shell convention for a child killed by a signal.
        (None, Some(signal)) => 128 + signal as i64,
        (None, None) => 128,
    }
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i64 {
    status.code().map(i64::from).unwrap_or(128)
}
