//! Execution payloads and their host-side staging.

use std::path::{Path, PathBuf};
use tempfile::{Builder, TempDir};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::errors::SandboxError;
use crate::profiles::MOUNT_ROOT;
use crate::sandbox::Mount;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Snippet,
    Project,
}

#[derive(Debug, Clone)]
pub enum ExecutionPayload {
    InlineSource { code: Vec<u8>, filename: String },
    /// The directory belongs to the caller, who removes it after the run.
    ProjectDirectory { path: PathBuf, entry_filename: String },
}

impl ExecutionPayload {
    pub fn inline(code: impl Into<Vec<u8>>, filename: impl Into<String>) -> Self {
        Self::InlineSource {
            code: code.into(),
            filename: filename.into(),
        }
    }

    pub fn project(path: impl Into<PathBuf>, entry_filename: impl Into<String>) -> Self {
        Self::ProjectDirectory {
            path: path.into(),
            entry_filename: entry_filename.into(),
        }
    }

    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::InlineSource { .. } => PayloadKind::Snippet,
            Self::ProjectDirectory { .. } => PayloadKind::Project,
        }
    }

    pub fn entry_filename(&self) -> &str {
        match self {
            Self::InlineSource { filename, .. } => filename,
            Self::ProjectDirectory { entry_filename, .. } => entry_filename,
        }
    }

    /// Path of the entry file as seen from inside the isolation unit.
    pub fn entry_path_in_unit(&self) -> String {
        format!("{}/{}", MOUNT_ROOT, self.entry_filename())
    }
}

/// A payload made visible on the host filesystem, ready to be bind-mounted.
///
/// Scratch storage created for inline sources lives exactly as long as this
/// value and is removed when it is dropped, whichever way the run ends.
#[derive(Debug)]
pub struct StagedPayload {
    mount: Mount,
    scratch: Option<TempDir>,
}

impl StagedPayload {
    pub async fn stage(payload: &ExecutionPayload) -> Result<Self, SandboxError> {
        let entry = payload.entry_filename();
        if !is_plain_file_name(entry) {
            return Err(SandboxError::Staging(format!(
                "Invalid entry file name '{}'",
                entry
            )));
        }

        match payload {
            ExecutionPayload::InlineSource { code, filename } => {
                let scratch = Builder::new().prefix("safexec-").tempdir()?;
                let host_path = scratch.path().join(filename);

                let mut file = fs::File::create(&host_path).await?;
                file.write_all(code).await?;
                file.flush().await?;

                Ok(Self {
                    mount: Mount::read_only(host_path, payload.entry_path_in_unit()),
                    scratch: Some(scratch),
                })
            }
            ExecutionPayload::ProjectDirectory { path, .. } => {
                let host_path = fs::canonicalize(path).await.map_err(|e| {
                    SandboxError::Staging(format!(
                        "Project directory {} is not accessible: {}",
                        path.display(),
                        e
                    ))
                })?;
                if !host_path.join(entry).is_file() {
                    return Err(SandboxError::Staging(format!(
                        "Entry file {} missing from {}",
                        entry,
                        host_path.display()
                    )));
                }
                Ok(Self {
                    mount: Mount::read_only(host_path, MOUNT_ROOT),
                    scratch: None,
                })
            }
        }
    }

    pub fn mount(&self) -> &Mount {
        &self.mount
    }

    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch.as_ref().map(TempDir::path)
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains(':')
}
