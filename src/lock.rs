//! Keyed read/write locks
//!
//! Every mutable on-disk resource (an artifacts directory, a cache
//! directory, a site directory) is guarded by a named lock. The same
//! logical resource always maps to the same key string, locks for distinct
//! keys never contend, and the key-to-lock mapping is created lazily on
//! first use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Well-known lock key for a build's artifacts directory.
pub fn artifacts_lock_key(project_id: u64, build_number: u64) -> String {
    format!("artifacts:{project_id}:{build_number}")
}

/// Well-known lock key for a job cache directory.
pub fn cache_lock_key(project_id: u64, cache_id: u64) -> String {
    format!("cache:{project_id}:{cache_id}")
}

/// Well-known lock key for a package registry blob.
pub fn pack_blob_lock_key(project_id: u64, hash: &str) -> String {
    format!("pack-blob:{project_id}:{hash}")
}

/// Well-known lock key for a project's site directory.
pub fn site_lock_key(project_id: u64) -> String {
    format!("site:{project_id}")
}

/// Well-known lock key for an attachment group.
pub fn attachment_lock_key(project_id: u64, group: &str) -> String {
    format!("attachment:{project_id}:{group}")
}

/// Registry of named multi-reader/single-writer locks.
///
/// Guards are owned, so they can be held across await points or stored in
/// reader structs; dropping the guard (on success, error, or cancellation)
/// releases the lock.
#[derive(Clone, Default)]
pub struct LockRegistry {
    locks: Arc<Mutex<HashMap<String, Arc<RwLock<()>>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().expect("lock registry poisoned");
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Acquire the shared lock for `key`. Multiple readers on the same key
    /// run concurrently; a writer excludes them all.
    pub async fn read(&self, key: &str) -> OwnedRwLockReadGuard<()> {
        self.lock_for(key).read_owned().await
    }

    /// Acquire the exclusive lock for `key`.
    pub async fn write(&self, key: &str) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(key).write_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_readers_overlap() {
        let registry = LockRegistry::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = registry.read("k").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) > 1, "readers never overlapped");
    }

    #[tokio::test]
    async fn test_writer_excludes_all() {
        let registry = LockRegistry::new();
        let active = Arc::new(AtomicUsize::new(0));
        let clash = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..6 {
            let registry = registry.clone();
            let active = active.clone();
            let clash = clash.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    let _guard = registry.write("k").await;
                    if active.fetch_add(1, Ordering::SeqCst) != 0 {
                        clash.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                } else {
                    let _guard = registry.read("k").await;
                    active.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(clash.load(Ordering::SeqCst), 0, "writer overlapped another holder");
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_contend() {
        let registry = LockRegistry::new();
        let _w1 = registry.write("a").await;
        // Would deadlock if keys shared a lock
        let _w2 = registry.write("b").await;
    }

    #[tokio::test]
    async fn test_error_releases_lock() {
        let registry = LockRegistry::new();
        let result: Result<(), &str> = async {
            let _guard = registry.write("k").await;
            Err("boom")
        }
        .await;
        assert!(result.is_err());
        // Lock must be free again
        let _guard = registry.write("k").await;
    }
}
