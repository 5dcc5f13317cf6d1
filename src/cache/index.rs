//! Cache metadata rows
//!
//! A row per job cache: (project, key) identity plus the access date that
//! drives hierarchy lookup recency and eviction. Row persistence is an
//! opaque atomic operation behind the [`CacheIndex`] trait; the shipped
//! implementation keeps rows in memory and snapshots them to a JSON file.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    pub id: u64,
    pub project_id: u64,
    pub key: String,
    pub access_date: SystemTime,
}

#[derive(Error, Debug)]
pub enum IndexError {
    /// Uniqueness conflict on (project, key). Callers retry the whole
    /// get-or-create rather than failing.
    #[error("cache row already exists for project {project_id} key {key:?}")]
    Conflict { project_id: u64, key: String },

    #[error("index IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt index snapshot: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[async_trait]
pub trait CacheIndex: Send + Sync {
    async fn get(&self, id: u64) -> Option<CacheRecord>;

    /// Exact (project, key) lookup.
    async fn find(&self, project_id: u64, key: &str) -> Option<CacheRecord>;

    /// All rows of one project.
    async fn list_project(&self, project_id: u64) -> Vec<CacheRecord>;

    /// Insert a new row; `Conflict` if (project, key) is already taken.
    async fn create(&self, project_id: u64, key: &str) -> Result<CacheRecord, IndexError>;

    /// Refresh a row's access date. Best-effort.
    async fn touch(&self, id: u64);

    /// Overwrite a row's access date (retention adjustments).
    async fn set_access_date(&self, id: u64, date: SystemTime);

    /// Remove and return a row.
    async fn remove(&self, id: u64) -> Option<CacheRecord>;

    /// Rows of a project last accessed strictly before `cutoff`.
    async fn older_than(&self, project_id: u64, cutoff: SystemTime) -> Vec<CacheRecord>;
}

#[derive(Default, Serialize, Deserialize)]
struct State {
    next_id: u64,
    rows: HashMap<u64, CacheRecord>,
}

/// In-memory index with an optional JSON snapshot on disk.
pub struct MemoryCacheIndex {
    state: Mutex<State>,
    snapshot: Option<PathBuf>,
}

impl MemoryCacheIndex {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State { next_id: 1, rows: HashMap::new() }),
            snapshot: None,
        }
    }

    /// Load the snapshot at `path` if present, otherwise start empty;
    /// subsequent mutations are written back to it.
    pub fn with_snapshot(path: PathBuf) -> Result<Self, IndexError> {
        let state = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                State { next_id: 1, rows: HashMap::new() }
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self { state: Mutex::new(state), snapshot: Some(path) })
    }

    fn persist(&self, state: &State) {
        let Some(path) = &self.snapshot else { return };
        let result = serde_json::to_vec(state)
            .map_err(std::io::Error::other)
            .and_then(|bytes| std::fs::write(path, bytes));
        if let Err(e) = result {
            tracing::warn!("failed to persist cache index snapshot: {e}");
        }
    }
}

impl Default for MemoryCacheIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheIndex for MemoryCacheIndex {
    async fn get(&self, id: u64) -> Option<CacheRecord> {
        self.state.lock().await.rows.get(&id).cloned()
    }

    async fn find(&self, project_id: u64, key: &str) -> Option<CacheRecord> {
        self.state
            .lock()
            .await
            .rows
            .values()
            .find(|r| r.project_id == project_id && r.key == key)
            .cloned()
    }

    async fn list_project(&self, project_id: u64) -> Vec<CacheRecord> {
        self.state
            .lock()
            .await
            .rows
            .values()
            .filter(|r| r.project_id == project_id)
            .cloned()
            .collect()
    }

    async fn create(&self, project_id: u64, key: &str) -> Result<CacheRecord, IndexError> {
        let mut state = self.state.lock().await;
        if state
            .rows
            .values()
            .any(|r| r.project_id == project_id && r.key == key)
        {
            return Err(IndexError::Conflict { project_id, key: key.to_string() });
        }
        let id = state.next_id;
        state.next_id += 1;
        let record = CacheRecord {
            id,
            project_id,
            key: key.to_string(),
            access_date: SystemTime::now(),
        };
        state.rows.insert(id, record.clone());
        self.persist(&state);
        Ok(record)
    }

    async fn touch(&self, id: u64) {
        self.set_access_date(id, SystemTime::now()).await;
    }

    async fn set_access_date(&self, id: u64, date: SystemTime) {
        let mut state = self.state.lock().await;
        if let Some(record) = state.rows.get_mut(&id) {
            record.access_date = date;
        }
        self.persist(&state);
    }

    async fn remove(&self, id: u64) -> Option<CacheRecord> {
        let mut state = self.state.lock().await;
        let removed = state.rows.remove(&id);
        if removed.is_some() {
            self.persist(&state);
        }
        removed
    }

    async fn older_than(&self, project_id: u64, cutoff: SystemTime) -> Vec<CacheRecord> {
        self.state
            .lock()
            .await
            .rows
            .values()
            .filter(|r| r.project_id == project_id && r.access_date < cutoff)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_conflict() {
        let index = MemoryCacheIndex::new();
        let first = index.create(1, "unit").await.unwrap();
        assert!(matches!(
            index.create(1, "unit").await,
            Err(IndexError::Conflict { .. })
        ));
        // Different project or key is fine
        index.create(2, "unit").await.unwrap();
        index.create(1, "integration").await.unwrap();
        assert_eq!(index.find(1, "unit").await.unwrap().id, first.id);
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caches.json");
        {
            let index = MemoryCacheIndex::with_snapshot(path.clone()).unwrap();
            index.create(1, "unit").await.unwrap();
        }
        let reloaded = MemoryCacheIndex::with_snapshot(path).unwrap();
        let row = reloaded.find(1, "unit").await.unwrap();
        assert_eq!(row.project_id, 1);
        // Ids keep advancing after reload
        let next = reloaded.create(1, "other").await.unwrap();
        assert_ne!(next.id, row.id);
    }

    #[tokio::test]
    async fn test_older_than() {
        let index = MemoryCacheIndex::new();
        let old = index.create(1, "old").await.unwrap();
        index
            .set_access_date(old.id, SystemTime::now() - std::time::Duration::from_secs(120))
            .await;
        index.create(1, "fresh").await.unwrap();

        let cutoff = SystemTime::now() - std::time::Duration::from_secs(60);
        let stale = index.older_than(1, cutoff).await;
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].key, "old");
    }
}
