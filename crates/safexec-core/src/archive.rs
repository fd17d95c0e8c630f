//! Unpacks uploaded project archives into request-scoped scratch directories.

use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::Path;
use tempfile::{Builder, TempDir};
use zip::ZipArchive;

use crate::config::ExecutionConfig;
use crate::errors::DispatchError;

const INVALID_ZIP: &str = "Invalid ZIP structure";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveLimits {
    /// Budget for the upload itself and, separately, for all extracted bytes.
    pub max_bytes: u64,
    pub max_entries: usize,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self::from(&ExecutionConfig::default())
    }
}

impl From<&ExecutionConfig> for ArchiveLimits {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            max_bytes: config.max_archive_bytes,
            max_entries: config.max_archive_entries,
        }
    }
}

/// An extracted project. The directory is deleted when this is dropped.
#[derive(Debug)]
pub struct ExtractedProject {
    dir: TempDir,
    entries: usize,
}

impl ExtractedProject {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn entries(&self) -> usize {
        self.entries
    }
}

/// Extracts a ZIP archive held in memory.
///
/// Entries whose names would land outside the extraction root are rejected
/// rather than skipped. Blocking; run it off the async executor.
pub fn extract_zip(bytes: &[u8], limits: &ArchiveLimits) -> Result<ExtractedProject, DispatchError> {
    if bytes.len() as u64 > limits.max_bytes {
        return Err(DispatchError::invalid_archive(format!(
            "ZIP file too large. Max {} bytes.",
            limits.max_bytes
        )));
    }

    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(|e| {
        log::debug!("Rejected archive: {}", e);
        DispatchError::invalid_archive(INVALID_ZIP)
    })?;
    if archive.len() > limits.max_entries {
        return Err(DispatchError::invalid_archive(format!(
            "ZIP has too many entries. Max {}.",
            limits.max_entries
        )));
    }

    let dir = Builder::new()
        .prefix("safexec-project-")
        .tempdir()
        .map_err(|e| DispatchError::LaunchFailed(format!("Cannot create project directory: {}", e)))?;

    let mut remaining = limits.max_bytes;
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|_| DispatchError::invalid_archive(INVALID_ZIP))?;
        let relative = file.enclosed_name().ok_or_else(|| {
            DispatchError::invalid_archive(format!("Unsafe path in ZIP: {}", file.name()))
        })?;
        let outpath = dir.path().join(relative);

        if file.is_dir() {
            fs::create_dir_all(&outpath).map_err(extraction_failed)?;
            continue;
        }

        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent).map_err(extraction_failed)?;
        }
        let mut outfile = File::create(&outpath).map_err(extraction_failed)?;
        let written = io::copy(&mut (&mut file).take(remaining.saturating_add(1)), &mut outfile)
            .map_err(|_| DispatchError::invalid_archive(INVALID_ZIP))?;
        if written > remaining {
            return Err(DispatchError::invalid_archive(format!(
                "ZIP contents too large. Max {} bytes uncompressed.",
                limits.max_bytes
            )));
        }
        remaining -= written;
    }

    log::debug!(
        "Extracted {} entries ({} bytes) into {}",
        archive.len(),
        limits.max_bytes - remaining,
        dir.path().display()
    );
    Ok(ExtractedProject {
        entries: archive.len(),
        dir,
    })
}

fn extraction_failed(e: io::Error) -> DispatchError {
    DispatchError::LaunchFailed(format!("Cannot extract archive: {}", e))
}
