//! Job cache store
//!
//! Caches live under `<project>/cache/<cache id>/` as three files:
//!
//! - `stamp`: format version, a colon, then the newline-joined list of
//!   cache paths that were archived. Written last; its presence is the sole
//!   validity signal, and a version or path-list mismatch is a miss.
//! - `data`: the archived stream bytes.
//! - `marks`: a fixed-size trailer holding the final bytes of the stream,
//!   served ahead of `data` on download so the consumer can seal stream
//!   boundaries.
//!
//! All disk access happens under the `cache:{project}:{cache}` keyed lock;
//! metadata rows go through [`CacheIndex`].

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

use crate::cache::index::{CacheIndex, CacheRecord, IndexError};
use crate::cluster::{ClusterDirectory, ClusterProxyClient, DirectoryError, ProxyError};
use crate::lock::{cache_lock_key, LockRegistry};
use crate::project::ProjectRegistry;

/// Bumping this invalidates every previously written cache (they become
/// permanent misses); no storage migration is ever needed.
pub const CACHE_VERSION: u32 = 1;

/// Size of the `marks` trailer.
const MARK_BUFFER_SIZE: usize = 8192;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("cache IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sliding window over the last `MARK_BUFFER_SIZE` bytes written.
struct TrailWindow {
    buffer: Vec<u8>,
    ptr: usize,
}

impl TrailWindow {
    fn new() -> Self {
        Self { buffer: vec![0; MARK_BUFFER_SIZE], ptr: 0 }
    }

    fn append(&mut self, data: &[u8]) {
        let cap = self.buffer.len();
        if data.len() <= cap - self.ptr {
            self.buffer[self.ptr..self.ptr + data.len()].copy_from_slice(data);
            self.ptr += data.len();
        } else if data.len() < cap {
            self.buffer.copy_within(data.len() - cap + self.ptr..self.ptr, 0);
            self.buffer[cap - data.len()..].copy_from_slice(data);
            self.ptr = cap;
        } else {
            self.buffer.copy_from_slice(&data[data.len() - cap..]);
            self.ptr = cap;
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

fn stamp_content(cache_paths: &[String]) -> String {
    format!("{CACHE_VERSION}:{}", cache_paths.join("\n"))
}

pub struct JobCacheStore {
    registry: ProjectRegistry,
    index: Arc<dyn CacheIndex>,
    locks: LockRegistry,
    directory: ClusterDirectory,
    proxy: ClusterProxyClient,
    conflict_retry: Duration,
}

impl JobCacheStore {
    pub fn new(
        registry: ProjectRegistry,
        index: Arc<dyn CacheIndex>,
        locks: LockRegistry,
        directory: ClusterDirectory,
        proxy: ClusterProxyClient,
        conflict_retry: Duration,
    ) -> Self {
        Self { registry, index, locks, directory, proxy, conflict_retry }
    }

    /// Exact-key lookup, walking from `project_id` up through its
    /// ancestors; the first hit wins and its access date is refreshed.
    pub async fn resolve_for_download(
        &self,
        project_id: u64,
        cache_key: &str,
    ) -> Option<(u64, u64)> {
        let mut current = Some(project_id);
        while let Some(id) = current {
            if let Some(record) = self.index.find(id, cache_key).await {
                self.index.touch(record.id).await;
                return Some((id, record.id));
            }
            current = self.registry.parent(id);
        }
        None
    }

    /// Ordered-candidate lookup: at each project level (from `project_id`
    /// to the root), the first load key with any prefix match wins, and
    /// among its matches the most recently accessed cache is chosen.
    pub async fn resolve_for_download_by_load_keys(
        &self,
        project_id: u64,
        load_keys: &[String],
    ) -> Option<(u64, u64)> {
        let mut current = Some(project_id);
        while let Some(id) = current {
            let rows = self.index.list_project(id).await;
            for load_key in load_keys {
                let hit = rows
                    .iter()
                    .filter(|r| r.key.starts_with(load_key.as_str()))
                    .max_by_key(|r| r.access_date);
                if let Some(record) = hit {
                    self.index.touch(record.id).await;
                    return Some((id, record.id));
                }
            }
            current = self.registry.parent(id);
        }
        None
    }

    /// Idempotent get-or-create of the upload target row. A uniqueness
    /// conflict from a concurrent creator is retried after a short delay
    /// instead of failing the caller.
    pub async fn resolve_for_upload(
        &self,
        project_id: u64,
        cache_key: &str,
    ) -> Result<u64, CacheError> {
        loop {
            if let Some(record) = self.index.find(project_id, cache_key).await {
                self.index.touch(record.id).await;
                return Ok(record.id);
            }
            match self.index.create(project_id, cache_key).await {
                Ok(record) => return Ok(record.id),
                Err(IndexError::Conflict { .. }) => {
                    tracing::debug!(
                        project_id,
                        cache_key,
                        "cache row created concurrently, retrying"
                    );
                    tokio::time::sleep(self.conflict_retry).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Validate the stamp and, on a hit, stream `marks` then `data` to
    /// `sink`. Returns whether anything was written.
    pub async fn download(
        &self,
        project_id: u64,
        cache_id: u64,
        cache_paths: &[String],
        sink: &mut (impl AsyncWrite + Unpin),
    ) -> Result<bool, CacheError> {
        let _guard = self.locks.read(&cache_lock_key(project_id, cache_id)).await;
        self.copy_cache_to(project_id, cache_id, cache_paths, sink).await
    }

    /// Streaming-protocol variant: one sentinel byte (1 = hit, 0 = miss)
    /// followed by the payload on a hit.
    pub async fn download_with_sentinel(
        &self,
        project_id: u64,
        cache_id: u64,
        cache_paths: &[String],
        sink: &mut (impl AsyncWrite + Unpin),
    ) -> Result<(), CacheError> {
        let _guard = self.locks.read(&cache_lock_key(project_id, cache_id)).await;
        if self.cache_valid(project_id, cache_id, cache_paths).await? {
            sink.write_all(&[1]).await?;
            self.copy_cache_to(project_id, cache_id, cache_paths, sink).await?;
        } else {
            sink.write_all(&[0]).await?;
        }
        sink.flush().await?;
        Ok(())
    }

    async fn cache_valid(
        &self,
        project_id: u64,
        cache_id: u64,
        cache_paths: &[String],
    ) -> Result<bool, CacheError> {
        let cache_dir = self.registry.cache_dir(project_id).join(cache_id.to_string());
        let stamp_file = cache_dir.join("stamp");
        match tokio::fs::read_to_string(&stamp_file).await {
            Ok(stamp) => Ok(stamp == stamp_content(cache_paths)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn copy_cache_to(
        &self,
        project_id: u64,
        cache_id: u64,
        cache_paths: &[String],
        sink: &mut (impl AsyncWrite + Unpin),
    ) -> Result<bool, CacheError> {
        if !self.cache_valid(project_id, cache_id, cache_paths).await? {
            return Ok(false);
        }
        let cache_dir = self.registry.cache_dir(project_id).join(cache_id.to_string());
        let marks = tokio::fs::read(cache_dir.join("marks")).await?;
        sink.write_all(&marks).await?;
        let mut data = tokio::fs::File::open(cache_dir.join("data")).await?;
        tokio::io::copy(&mut data, sink).await?;
        sink.flush().await?;
        Ok(true)
    }

    /// Replace the cache payload: wipe the directory, stream `source` into
    /// `data` while keeping the trailing window for `marks`, then write the
    /// stamp. A crash mid-write leaves no stamp and therefore no
    /// valid-looking cache.
    pub async fn upload(
        &self,
        project_id: u64,
        cache_id: u64,
        cache_paths: &[String],
        source: &mut (impl AsyncRead + Unpin),
    ) -> Result<(), CacheError> {
        let _guard = self.locks.write(&cache_lock_key(project_id, cache_id)).await;

        let cache_dir = self.registry.cache_dir(project_id).join(cache_id.to_string());
        match tokio::fs::remove_dir_all(&cache_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&cache_dir).await?;

        let data_file = tokio::fs::File::create(cache_dir.join("data")).await?;
        let mut data = BufWriter::new(data_file);
        let mut window = TrailWindow::new();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            data.write_all(&buf[..n]).await?;
            window.append(&buf[..n]);
        }
        data.flush().await?;

        tokio::fs::write(cache_dir.join("marks"), window.into_bytes()).await?;
        tokio::fs::write(cache_dir.join("stamp"), stamp_content(cache_paths)).await?;
        Ok(())
    }

    /// `data` length if the cache is present with a current-version stamp.
    pub async fn cache_size(&self, project_id: u64, cache_id: u64) -> Result<Option<u64>, CacheError> {
        let _guard = self.locks.read(&cache_lock_key(project_id, cache_id)).await;
        let cache_dir = self.registry.cache_dir(project_id).join(cache_id.to_string());
        let stamp = match tokio::fs::read_to_string(cache_dir.join("stamp")).await {
            Ok(stamp) => stamp,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !stamp.starts_with(&format!("{CACHE_VERSION}:")) {
            return Ok(None);
        }
        match tokio::fs::metadata(cache_dir.join("data")).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the row, then the on-disk directory on whichever node owns
    /// the project.
    pub async fn delete(&self, record: &CacheRecord) -> Result<(), CacheError> {
        self.index.remove(record.id).await;
        let owner = self.directory.active_node_for(record.project_id, true).await?;
        if self.directory.is_local(&owner) {
            self.remove_local_dir(record.project_id, record.id).await?;
        } else {
            self.proxy
                .delete(
                    &owner,
                    "cache",
                    &[
                        ("projectId", record.project_id.to_string()),
                        ("cacheId", record.id.to_string()),
                    ],
                )
                .await?;
        }
        Ok(())
    }

    /// Remove the on-disk directory for a cache this node owns.
    pub async fn remove_local_dir(&self, project_id: u64, cache_id: u64) -> Result<(), CacheError> {
        let _guard = self.locks.write(&cache_lock_key(project_id, cache_id)).await;
        let cache_dir = self.registry.cache_dir(project_id).join(cache_id.to_string());
        match tokio::fs::remove_dir_all(&cache_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Scheduled eviction pass: for every project this node owns, delete
    /// caches not accessed within the project's retention window. A failure
    /// on one project never aborts the others.
    pub async fn evict(&self) {
        let now = SystemTime::now();
        for project_id in self.registry.ids().collect::<Vec<_>>() {
            match self.directory.active_node_for(project_id, false).await {
                Ok(owner) if self.directory.is_local(&owner) => {}
                _ => continue,
            }
            if let Err(e) = self.evict_project(project_id, now).await {
                tracing::error!(project_id, "error cleaning up job caches: {e}");
            }
        }
    }

    async fn evict_project(&self, project_id: u64, now: SystemTime) -> Result<(), CacheError> {
        let preserve_days = self.registry.cache_preserve_days(project_id).unwrap_or(7);
        let cutoff = now - Duration::from_secs(u64::from(preserve_days) * 24 * 3600);
        for record in self.index.older_than(project_id, cutoff).await {
            self.delete(&record).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::index::MemoryCacheIndex;
    use crate::project::ProjectEntry;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> JobCacheStore {
        store_with_days(tmp, 7)
    }

    fn store_with_days(tmp: &TempDir, preserve_days: u32) -> JobCacheStore {
        let registry = ProjectRegistry::new(
            tmp.path(),
            vec![
                ProjectEntry { id: 1, parent: None, cache_preserve_days: preserve_days },
                ProjectEntry { id: 2, parent: Some(1), cache_preserve_days: preserve_days },
                ProjectEntry { id: 3, parent: Some(2), cache_preserve_days: preserve_days },
            ],
        );
        let local = "127.0.0.1:6100".to_string();
        let owners: HashMap<u64, String> =
            [(1, local.clone()), (2, local.clone()), (3, local.clone())].into();
        let directory = ClusterDirectory::new(
            local,
            "secret".into(),
            owners,
            Duration::from_millis(100),
        );
        JobCacheStore::new(
            registry,
            Arc::new(MemoryCacheIndex::new()),
            LockRegistry::new(),
            directory,
            ClusterProxyClient::new("secret".into()),
            Duration::from_millis(10),
        )
    }

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_upload_download_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let cache_id = store.resolve_for_upload(1, "unit").await.unwrap();
        let payload = b"cache payload bytes".to_vec();
        store
            .upload(1, cache_id, &paths(&["a", "b"]), &mut payload.as_slice())
            .await
            .unwrap();

        let mut out = Vec::new();
        let hit = store
            .download(1, cache_id, &paths(&["a", "b"]), &mut out)
            .await
            .unwrap();
        assert!(hit);
        // marks trailer first, then the data bytes
        assert_eq!(out.len(), 8192 + payload.len());
        assert_eq!(&out[8192..], &payload[..]);
        assert_eq!(&out[..payload.len()], &payload[..]);

        // Different path set is a miss even though the cache exists
        let mut out = Vec::new();
        let hit = store
            .download(1, cache_id, &paths(&["a"]), &mut out)
            .await
            .unwrap();
        assert!(!hit);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_sentinel_variant() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let cache_id = store.resolve_for_upload(1, "unit").await.unwrap();
        store
            .upload(1, cache_id, &paths(&["a"]), &mut b"x".as_slice())
            .await
            .unwrap();

        let mut out = Vec::new();
        store
            .download_with_sentinel(1, cache_id, &paths(&["a"]), &mut out)
            .await
            .unwrap();
        assert_eq!(out[0], 1);
        assert_eq!(out.len(), 1 + 8192 + 1);

        let mut out = Vec::new();
        store
            .download_with_sentinel(1, cache_id, &paths(&["other"]), &mut out)
            .await
            .unwrap();
        assert_eq!(out, vec![0]);
    }

    #[tokio::test]
    async fn test_stale_stamp_version_is_miss() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let cache_id = store.resolve_for_upload(1, "unit").await.unwrap();
        store
            .upload(1, cache_id, &paths(&["a"]), &mut b"payload".as_slice())
            .await
            .unwrap();

        // Rewrite the stamp as if an older format version had produced it
        let stamp = tmp
            .path()
            .join("projects/1/cache")
            .join(cache_id.to_string())
            .join("stamp");
        std::fs::write(&stamp, format!("{}:a", CACHE_VERSION - 1)).unwrap();

        let mut out = Vec::new();
        let hit = store
            .download(1, cache_id, &paths(&["a"]), &mut out)
            .await
            .unwrap();
        assert!(!hit);
        assert_eq!(store.cache_size(1, cache_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_stamp_is_miss() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let mut out = Vec::new();
        let hit = store.download(1, 99, &paths(&["a"]), &mut out).await.unwrap();
        assert!(!hit);
    }

    #[tokio::test]
    async fn test_marks_holds_stream_tail() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let cache_id = store.resolve_for_upload(1, "unit").await.unwrap();
        // Payload longer than the trailer window
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        store
            .upload(1, cache_id, &paths(&["a"]), &mut payload.as_slice())
            .await
            .unwrap();

        let marks = std::fs::read(
            tmp.path()
                .join("projects/1/cache")
                .join(cache_id.to_string())
                .join("marks"),
        )
        .unwrap();
        assert_eq!(marks.len(), 8192);
        assert_eq!(&marks[..], &payload[payload.len() - 8192..]);
    }

    #[tokio::test]
    async fn test_resolve_for_upload_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(store(&tmp));

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.resolve_for_upload(1, "unit").await.unwrap() })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.resolve_for_upload(1, "unit").await.unwrap() })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(a, b);
        assert_eq!(store.index.list_project(1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_hierarchy_fallback_exact() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        // Written only at the root project
        let cache_id = store.resolve_for_upload(1, "base-v1").await.unwrap();
        store
            .upload(1, cache_id, &paths(&["a"]), &mut b"root".as_slice())
            .await
            .unwrap();

        let (owner, found) = store.resolve_for_download(3, "base-v1").await.unwrap();
        assert_eq!(owner, 1);
        assert_eq!(found, cache_id);
        assert!(store.resolve_for_download(3, "absent").await.is_none());
    }

    #[tokio::test]
    async fn test_load_key_lookup_prefers_candidate_order_then_recency() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let old = store.resolve_for_upload(2, "base-v1-old").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let fresh = store.resolve_for_upload(2, "base-v1-fresh").await.unwrap();
        let exotic = store.resolve_for_upload(2, "exotic").await.unwrap();

        // Within one candidate, the most recently accessed match wins
        let (owner, found) = store
            .resolve_for_download_by_load_keys(3, &paths(&["base-v1"]))
            .await
            .unwrap();
        assert_eq!((owner, found), (2, fresh));

        // Candidate order outranks recency across candidates
        let (_, found) = store
            .resolve_for_download_by_load_keys(3, &paths(&["exotic", "base-v1"]))
            .await
            .unwrap();
        assert_eq!(found, exotic);

        // A level with any match stops the walk: nothing at level 3, both at 2
        let (_, found) = store
            .resolve_for_download_by_load_keys(3, &paths(&["base-v1-old"]))
            .await
            .unwrap();
        assert_eq!(found, old);
    }

    #[tokio::test]
    async fn test_closer_level_beats_older_ancestor() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        let root = store.resolve_for_upload(1, "base-v1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mid = store.resolve_for_upload(2, "base-v1").await.unwrap();
        assert_ne!(root, mid);

        // Level 2 matches first even though the root row also matches
        let (owner, found) = store
            .resolve_for_download_by_load_keys(3, &paths(&["base-v1"]))
            .await
            .unwrap();
        assert_eq!((owner, found), (2, mid));
    }

    #[tokio::test]
    async fn test_evict_honors_retention_window() {
        let tmp = TempDir::new().unwrap();
        let store = store_with_days(&tmp, 1);

        let stale = store.resolve_for_upload(1, "stale").await.unwrap();
        store
            .upload(1, stale, &paths(&["a"]), &mut b"old".as_slice())
            .await
            .unwrap();
        let fresh = store.resolve_for_upload(2, "fresh").await.unwrap();
        store
            .upload(2, fresh, &paths(&["a"]), &mut b"new".as_slice())
            .await
            .unwrap();

        store
            .index
            .set_access_date(stale, SystemTime::now() - Duration::from_secs(2 * 24 * 3600))
            .await;

        store.evict().await;

        assert!(store.index.find(1, "stale").await.is_none());
        assert!(store.index.find(2, "fresh").await.is_some());
        assert!(!tmp
            .path()
            .join("projects/1/cache")
            .join(stale.to_string())
            .exists());
        assert!(tmp
            .path()
            .join("projects/2/cache")
            .join(fresh.to_string())
            .exists());
    }

    #[tokio::test]
    async fn test_evict_failure_on_one_project_does_not_stop_others() {
        let tmp = TempDir::new().unwrap();
        let store = store_with_days(&tmp, 1);
        let aged = SystemTime::now() - Duration::from_secs(2 * 24 * 3600);

        // Project 1: a row whose directory removal will fail, because the
        // cache parent path is a plain file.
        let blocked = store.resolve_for_upload(1, "blocked").await.unwrap();
        store.index.set_access_date(blocked, aged).await;
        std::fs::create_dir_all(tmp.path().join("projects/1")).unwrap();
        std::fs::write(tmp.path().join("projects/1/cache"), b"not a directory").unwrap();

        // Project 2: a normal stale cache.
        let stale = store.resolve_for_upload(2, "stale").await.unwrap();
        store
            .upload(2, stale, &paths(&["a"]), &mut b"old".as_slice())
            .await
            .unwrap();
        store.index.set_access_date(stale, aged).await;

        store.evict().await;

        // Project 2 was still cleaned despite the project 1 failure
        assert!(store.index.find(2, "stale").await.is_none());
        assert!(!tmp
            .path()
            .join("projects/2/cache")
            .join(stale.to_string())
            .exists());
    }
}
