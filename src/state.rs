//! Run-state persistence.
//!
//! Each job keeps one JSON record (`{name, lastrun, nextCheck, indexed,
//! deleted}`) addressable by job name. Writes go to a temporary file that is
//! then renamed over the previous one, so a crash mid-write leaves the last
//! valid state in place.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::StateError;
use crate::models::RunState;

const STATUS_FILE: &str = "_status.json";

/// Storage for per-job [`RunState`].
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the state for `job`, or `None` if it never completed a run.
    async fn read(&self, job: &str) -> Result<Option<RunState>, StateError>;

    /// Atomically replace the state for `state.name`.
    async fn write(&self, state: &RunState) -> Result<(), StateError>;

    /// Discard the state for `job` so the next run starts from scratch.
    async fn reset(&self, job: &str) -> Result<(), StateError>;
}

/// Stores state as `<dir>/<job>/_status.json`.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn status_path(&self, job: &str) -> PathBuf {
        self.dir.join(job).join(STATUS_FILE)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn read(&self, job: &str) -> Result<Option<RunState>, StateError> {
        let path = self.status_path(job);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, state: &RunState) -> Result<(), StateError> {
        let path = self.status_path(&state.name);
        let parent = path.parent().unwrap_or(Path::new("."));
        tokio::fs::create_dir_all(parent).await?;

        let tmp = parent.join(format!("{}.tmp", STATUS_FILE));
        let body = serde_json::to_vec_pretty(state)?;
        write_synced(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(job = %state.name, path = %path.display(), "run state saved");
        Ok(())
    }

    async fn reset(&self, job: &str) -> Result<(), StateError> {
        match tokio::fs::remove_file(self.status_path(job)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write `body` to `path` and flush it to disk before returning, so a rename
/// over the previous state never exposes an empty file.
async fn write_synced(path: &Path, body: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(body).await?;
    file.sync_all().await
}

/// Keeps state in memory; used by dry runs and tests.
#[derive(Default)]
pub struct InMemoryStateStore {
    states: Mutex<HashMap<String, RunState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn read(&self, job: &str) -> Result<Option<RunState>, StateError> {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        Ok(states.get(job).cloned())
    }

    async fn write(&self, state: &RunState) -> Result<(), StateError> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.insert(state.name.clone(), state.clone());
        Ok(())
    }

    async fn reset(&self, job: &str) -> Result<(), StateError> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.remove(job);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn sample() -> RunState {
        RunState {
            name: "docs".into(),
            last_run: Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()),
            next_check: None,
            indexed: 7,
            deleted: 2,
        }
    }

    #[tokio::test]
    async fn test_missing_state_reads_none() {
        let tmp = TempDir::new().unwrap();
        let store = FileStateStore::new(tmp.path());
        assert!(store.read("docs").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let tmp = TempDir::new().unwrap();
        let store = FileStateStore::new(tmp.path());
        store.write(&sample()).await.unwrap();

        let loaded = store.read("docs").await.unwrap().unwrap();
        assert_eq!(loaded, sample());
        assert!(!tmp.path().join("docs").join("_status.json.tmp").exists());

        let raw = std::fs::read_to_string(store.status_path("docs")).unwrap();
        assert!(raw.contains("\"lastrun\": \"2024-03-01T12:00:00Z\""));
    }

    #[tokio::test]
    async fn test_overwrite_replaces_stale_temp_file() {
        let tmp = TempDir::new().unwrap();
        let store = FileStateStore::new(tmp.path());
        store.write(&sample()).await.unwrap();

        // Leftover from a write interrupted before the rename.
        let stale = tmp.path().join("docs").join("_status.json.tmp");
        std::fs::write(&stale, "{\"name\":").unwrap();

        let next = RunState {
            indexed: 9,
            ..sample()
        };
        store.write(&next).await.unwrap();
        assert_eq!(store.read("docs").await.unwrap(), Some(next));
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_reset_discards_state() {
        let tmp = TempDir::new().unwrap();
        let store = FileStateStore::new(tmp.path());
        store.write(&sample()).await.unwrap();
        store.reset("docs").await.unwrap();
        assert!(store.read("docs").await.unwrap().is_none());
        // Idempotent
        store.reset("docs").await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_state_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let store = FileStateStore::new(tmp.path());
        std::fs::create_dir_all(tmp.path().join("docs")).unwrap();
        std::fs::write(store.status_path("docs"), "{not json").unwrap();
        assert!(matches!(
            store.read("docs").await,
            Err(StateError::Format(_))
        ));
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryStateStore::new();
        store.write(&sample()).await.unwrap();
        assert_eq!(store.read("docs").await.unwrap(), Some(sample()));
        store.reset("docs").await.unwrap();
        assert_eq!(store.read("docs").await.unwrap(), None);
    }
}
