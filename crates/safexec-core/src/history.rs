//! Bounded, newest-first log of recent executions.
//!
//! The backing store is the single source of truth: every `append` reloads
//! it, mutates, and writes it back while holding the log's write lock, so
//! concurrent appends never lose each other. A failed write leaves the
//! previously persisted state untouched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::HistoryError;
use crate::normalizer::ExecutionResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub language: String,
    /// Leading characters of the submitted code, or the entry file name for projects.
    #[serde(rename = "code")]
    pub code_snippet: String,
    pub output: String,
    pub error: String,
    pub exit_code: i64,
    #[serde(rename = "time")]
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    /// Builds an entry for `result`. The timestamp is provisional;
    /// `HistoryLog::append` restamps it when the entry is committed.
    pub fn new(
        language: impl Into<String>,
        code: &str,
        result: &ExecutionResult,
        snippet_chars: usize,
    ) -> Self {
        Self {
            language: language.into(),
            code_snippet: truncate_chars(code, snippet_chars),
            output: result.output().to_string(),
            error: result.error().to_string(),
            exit_code: result.exit_code(),
            timestamp: Utc::now(),
        }
    }
}

fn commit_time(newest: Option<&HistoryEntry>) -> DateTime<Utc> {
    let now = Utc::now();
    match newest {
        Some(prev) if prev.timestamp >= now => prev.timestamp + chrono::Duration::microseconds(1),
        _ => now,
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn load(&self) -> Result<Vec<HistoryEntry>, HistoryError>;
    async fn save(&self, entries: &[HistoryEntry]) -> Result<(), HistoryError>;
}

#[derive(Default)]
pub struct MemoryHistoryStore {
    entries: std::sync::Mutex<Vec<HistoryEntry>>,
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn load(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        Ok(self.entries.lock().map(|e| e.clone()).unwrap_or_default())
    }

    async fn save(&self, entries: &[HistoryEntry]) -> Result<(), HistoryError> {
        if let Ok(mut stored) = self.entries.lock() {
            *stored = entries.to_vec();
        }
        Ok(())
    }
}

/// Persists the history as a JSON array. Writes go to a sibling temp file
/// that is renamed over the target, so readers never see a partial file.
pub struct JsonFileHistoryStore {
    path: PathBuf,
}

impl JsonFileHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "history.json".into());
        name.push(format!(".{}.tmp", Uuid::new_v4()));
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl HistoryStore for JsonFileHistoryStore {
    async fn load(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, entries: &[HistoryEntry]) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(entries)?;
        let tmp = self.temp_path();
        if let Err(e) = tokio::fs::write(&tmp, &json).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

pub struct HistoryLog {
    store: Arc<dyn HistoryStore>,
    write_lock: Mutex<()>,
    capacity: usize,
}

impl HistoryLog {
    pub fn new(store: Arc<dyn HistoryStore>, capacity: usize) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
            capacity,
        }
    }

    pub fn in_memory(capacity: usize) -> Self {
        Self::new(Arc::new(MemoryHistoryStore::default()), capacity)
    }

    pub fn open(path: impl Into<PathBuf>, capacity: usize) -> Self {
        Self::new(Arc::new(JsonFileHistoryStore::new(path)), capacity)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Inserts `entry` at the front, evicting the oldest beyond capacity.
    ///
    /// The entry is stamped inside the critical section, so timestamps are
    /// strictly decreasing from the front of the log.
    pub async fn append(&self, mut entry: HistoryEntry) -> Result<(), HistoryError> {
        let _guard = self.write_lock.lock().await;

        let mut entries = self.store.load().await?;
        entry.timestamp = commit_time(entries.first());
        entries.insert(0, entry);
        entries.truncate(self.capacity);
        self.store.save(&entries).await
    }

    /// Up to `capacity` entries, newest first. Has no side effects.
    pub async fn recent(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        let mut entries = self.store.load().await?;
        entries.truncate(self.capacity);
        Ok(entries)
    }
}
