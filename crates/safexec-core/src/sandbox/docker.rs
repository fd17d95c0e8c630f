// src/sandbox/docker.rs
use async_trait::async_trait;
use bollard::container::LogOutput; // For LogOutput::StdOut, LogOutput::StdErr
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    CreateImageOptions as BollardCreateImageOptionsQuery,
    ListContainersOptions as BollardListContainersOptionsQuery,
    LogsOptions as BollardLogsOptionsQuery,
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    WaitContainerOptions as BollardWaitContainerOptionsQuery,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;

use super::{Invocation, RawExit, SandboxProvider, UnitId, MANAGED_LABEL};
use crate::errors::SandboxError;
use crate::profiles::{FilesystemPolicy, NetworkPolicy};

/// Runs units as containers through the Docker Engine API.
pub struct DockerProvider {
    docker: Docker,
    pull_missing_images: bool,
}

impl DockerProvider {
    pub fn connect(pull_missing_images: bool) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            pull_missing_images,
        })
    }

    fn container_body(invocation: &Invocation) -> ContainerCreateBody {
        let network_mode = match invocation.network {
            NetworkPolicy::None => "none",
        };
        let readonly_rootfs = match invocation.filesystem {
            FilesystemPolicy::ReadOnlyRoot => true,
        };

        ContainerCreateBody {
            image: Some(invocation.image.clone()),
            cmd: Some(invocation.command.clone()),
            working_dir: Some(invocation.working_dir.clone()),
            network_disabled: Some(true),
            labels: Some(HashMap::from([(
                MANAGED_LABEL.to_string(),
                "true".to_string(),
            )])),
            host_config: Some(HostConfig {
                binds: Some(vec![invocation.mount.bind_spec()]),
                memory: Some(invocation.limits.memory_bytes),
                memory_swap: Some(invocation.limits.memory_swap_bytes),
                pids_limit: invocation.limits.pids_limit,
                network_mode: Some(network_mode.to_string()),
                readonly_rootfs: Some(readonly_rootfs),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                // Removed explicitly once logs are collected; auto-remove races the log read.
                auto_remove: Some(false),
                ..Default::default()
            }),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        }
    }

    async fn create_once(&self, invocation: &Invocation) -> Result<String, BollardError> {
        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(invocation.unit.to_string()),
            ..Default::default()
        });
        let response = self
            .docker
            .create_container(options, Self::container_body(invocation))
            .await?;
        Ok(response.id)
    }

    async fn create(&self, invocation: &Invocation) -> Result<String, SandboxError> {
        match self.create_once(invocation).await {
            Ok(id) => Ok(id),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) if self.pull_missing_images => {
                log::info!("Image {} not present locally, pulling", invocation.image);
                self.pull_image(&invocation.image).await?;
                Ok(self.create_once(invocation).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), SandboxError> {
        let options = Some(BollardCreateImageOptionsQuery {
            from_image: Some(image.to_string()),
            ..Default::default()
        });

        let mut pull_stream = self.docker.create_image(options, None, None);
        while let Some(progress) = pull_stream.next().await {
            let info = progress?;
            log::debug!("Pulling image {}: {:?}", image, info.status);
        }
        Ok(())
    }

    async fn start_and_wait(&self, container_id: &str) -> Result<RawExit, SandboxError> {
        self.docker
            .start_container(container_id, None::<BollardStartContainerOptionsQuery>)
            .await?;

        // wait_container returns a stream. We need to await the next item for the result.
        let mut wait_stream = self
            .docker
            .wait_container(container_id, None::<BollardWaitContainerOptionsQuery>);

        // bollard reports a non-zero exit as an error carrying the status code.
        let exit_code = match wait_stream.next().await {
            Some(Ok(response)) => response.status_code,
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(SandboxError::Runtime(
                    "Container wait stream ended unexpectedly".to_string(),
                ))
            }
        };

        let (stdout, stderr) = self.collect_logs(container_id).await?;
        Ok(RawExit {
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn collect_logs(&self, container_id: &str) -> Result<(String, String), SandboxError> {
        let mut output_stream = self.docker.logs(
            container_id,
            Some(BollardLogsOptionsQuery {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let mut frames = Vec::new();
        while let Some(log_result) = output_stream.next().await {
            frames.push(log_result?);
        }
        Ok(demux_logs(frames))
    }

    async fn remove(&self, name: &str) -> Result<(), SandboxError> {
        let options = Some(BollardRemoveContainerOptionsQuery {
            force: true,
            ..Default::default()
        });
        match self.docker.remove_container(name, options).await {
            Ok(()) => Ok(()),
            // Already gone (404) or already being removed (409).
            Err(BollardError::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => Ok(()),
            Err(e) => Err(SandboxError::TerminateFailed {
                unit: name.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn run(&self, invocation: &Invocation) -> Result<RawExit, SandboxError> {
        let container_id = self.create(invocation).await?;
        log::debug!("Created container {} ({})", invocation.unit, container_id);

        let result = self.start_and_wait(&container_id).await;

        if let Err(e) = self.remove(&container_id).await {
            log::warn!("Failed to remove container {}: {}", invocation.unit, e);
        }
        result
    }

    async fn terminate(&self, unit: &UnitId) -> Result<(), SandboxError> {
        self.remove(unit.as_str()).await
    }

    async fn list_units(&self) -> Result<Vec<String>, SandboxError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}=true", MANAGED_LABEL)],
        )]);
        let containers = self
            .docker
            .list_containers(Some(BollardListContainersOptionsQuery {
                all: true,
                filters: Some(filters),
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| c.names.and_then(|names| names.into_iter().next()))
            .map(|name| name.trim_start_matches('/').to_string())
            .collect())
    }

    async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }
}

/// Joins log frames per stream before decoding; frame boundaries can fall
/// inside a multi-byte character.
fn demux_logs(frames: impl IntoIterator<Item = LogOutput>) -> (String, String) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    for frame in frames {
        match frame {
            LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
            LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
            _ => {}
        }
    }
    (
        String::from_utf8_lossy(&stdout).into_owned(),
        String::from_utf8_lossy(&stderr).into_owned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::PayloadKind;
    use crate::profiles::IsolationProfile;
    use crate::sandbox::Mount;
    use std::path::PathBuf;

    fn invocation() -> Invocation {
        Invocation::new(
            UnitId::generate(),
            &IsolationProfile::python(),
            PayloadKind::Snippet,
            "/app/script.py",
            Mount::read_only(PathBuf::from("/tmp/safexec-x/script.py"), "/app/script.py"),
            Some(64),
        )
    }

    #[test]
    fn test_container_body_enforces_isolation() {
        let invocation = invocation();
        let body = DockerProvider::container_body(&invocation);
        let host = body.host_config.unwrap();

        assert_eq!(body.image.as_deref(), Some("python:3.11-slim"));
        assert_eq!(body.cmd.unwrap(), vec!["python", "/app/script.py"]);
        assert_eq!(body.network_disabled, Some(true));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.memory, Some(128 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.pids_limit, Some(64));
        assert_eq!(
            host.binds.unwrap(),
            vec!["/tmp/safexec-x/script.py:/app/script.py:ro".to_string()]
        );
        assert_eq!(
            body.labels.unwrap().get(MANAGED_LABEL).map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn test_split_multibyte_characters_survive() {
        let text = "héllo → wörld\n".as_bytes();
        let (head, tail) = text.split_at(2); // inside 'é'
        let frames = vec![
            LogOutput::StdOut {
                message: head.to_vec().into(),
            },
            LogOutput::StdErr {
                message: vec![0xE2, 0x9C].into(),
            },
            LogOutput::StdOut {
                message: tail.to_vec().into(),
            },
            LogOutput::StdErr {
                message: vec![0x93].into(),
            },
        ];

        let (stdout, stderr) = demux_logs(frames);
        assert_eq!(stdout, "héllo → wörld\n");
        assert_eq!(stderr, "✓");
    }

    #[tokio::test]
    #[ignore] // Requires a running Docker daemon and the python:3.11-slim image
    async fn test_hello_world_against_daemon() {
        let provider = DockerProvider::connect(true).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("script.py");
        std::fs::write(&script, "print(\"hello\")").unwrap();

        let mut invocation = invocation();
        invocation.mount = Mount::read_only(script, "/app/script.py");
        let exit = provider.run(&invocation).await.unwrap();

        assert_eq!(exit.exit_code, 0);
        assert_eq!(exit.stdout, "hello\n");
        let leftovers = provider.list_units().await.unwrap();
        assert!(!leftovers.contains(&invocation.unit.to_string()));
    }
}
