//! Three-tier metadata cache: process-local map, shared cache bin, persistent
//! store.
//!
//! A miss that has to reach the store is done under a named lock keyed by the
//! cache id. Concurrent callers that lose the race wait (bounded) for the
//! holder and then read what it left in the shared bin. Negative results are
//! cached in the shared bin only; the local map holds positive records.

use super::lock::NamedLocks;
use super::shared::{SharedCache, SharedEntry};
use super::store::MetaStore;
use super::{MAX_PATH_LENGTH, ObjectMetadata};
use crate::cadapter::client::ObjectInfo;
use crate::error::{FsError, Result};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub const CACHE_ID_PREFIX: &str = "blobfs:uri:";
pub const CACHE_TAG: &str = "blobfs";
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(30);

pub fn cache_id(path: &str) -> String {
    format!("{CACHE_ID_PREFIX}{path}")
}

pub struct MetadataCache {
    store: Arc<dyn MetaStore>,
    shared: Arc<dyn SharedCache>,
    local: RwLock<HashMap<String, ObjectMetadata>>,
    locks: NamedLocks,
    lock_wait: Duration,
    max_path_length: usize,
}

impl MetadataCache {
    pub fn new(store: Arc<dyn MetaStore>, shared: Arc<dyn SharedCache>) -> Self {
        Self {
            store,
            shared,
            local: RwLock::new(HashMap::new()),
            locks: NamedLocks::new(),
            lock_wait: DEFAULT_LOCK_WAIT,
            max_path_length: MAX_PATH_LENGTH,
        }
    }

    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    /// Longest path the store accepts, in characters.
    pub fn with_max_path_length(mut self, max_path_length: usize) -> Self {
        self.max_path_length = max_path_length;
        self
    }

    pub fn max_path_length(&self) -> usize {
        self.max_path_length
    }

    pub fn store(&self) -> &Arc<dyn MetaStore> {
        &self.store
    }

    pub fn locks(&self) -> &NamedLocks {
        &self.locks
    }

    pub async fn get(&self, path: &str) -> Result<Option<ObjectMetadata>> {
        self.get_or_fetch(path, || async { Ok(None) }).await
    }

    /// Like [`get`](Self::get), but when the store has no record `fetch` is
    /// run under the same lock and a found record is persisted.
    pub async fn get_or_fetch<F, Fut>(&self, path: &str, fetch: F) -> Result<Option<ObjectMetadata>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<ObjectMetadata>>>,
    {
        if let Some(hit) = self.local.read().await.get(path) {
            return Ok(Some(hit.clone()));
        }
        let id = cache_id(path);
        if let Some(entry) = self.shared_get(&id).await {
            return Ok(self.remember(entry.value).await);
        }

        match self.locks.try_acquire(&id) {
            Some(_guard) => {
                // The previous holder may have filled the bin since our read.
                if let Some(entry) = self.shared_get(&id).await {
                    return Ok(self.remember(entry.value).await);
                }
                let found = match self.store.select(path).await? {
                    Some(meta) => Some(meta),
                    None => match fetch().await? {
                        Some(meta) => {
                            self.store.insert(&meta).await?;
                            Some(meta)
                        }
                        None => None,
                    },
                };
                self.shared_set(&id, found.clone()).await;
                Ok(self.remember(found).await)
            }
            None => {
                if self.locks.wait(&id, self.lock_wait).await {
                    if let Some(entry) = self.shared_get(&id).await {
                        return Ok(self.remember(entry.value).await);
                    }
                } else {
                    debug!(path, "gave up waiting for metadata lock");
                }
                match self.store.select(path).await? {
                    Some(meta) => Ok(Some(meta)),
                    None => fetch().await,
                }
            }
        }
    }

    pub async fn set(&self, path: &str, file_size: u64, is_directory: bool) -> Result<()> {
        let meta = ObjectMetadata {
            path: path.to_string(),
            file_size,
            is_directory,
            created_at: Utc::now(),
        };
        self.put(meta).await
    }

    /// Replace the record for `meta.path` in every tier.
    pub async fn put(&self, meta: ObjectMetadata) -> Result<()> {
        if meta.path.chars().count() > self.max_path_length {
            return Err(FsError::PathTooLong {
                path: meta.path,
                limit: self.max_path_length,
            });
        }
        self.delete(&meta.path).await?;
        self.store.insert(&meta).await?;
        self.shared_set(&cache_id(&meta.path), Some(meta.clone()))
            .await;
        self.local.write().await.insert(meta.path.clone(), meta);
        Ok(())
    }

    /// Remove `path` from every tier. A missing path is a no-op.
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.store.delete(path).await?;
        if let Err(e) = self.shared.delete(&cache_id(path)).await {
            warn!(path, error = %e, "shared cache delete failed");
        }
        self.local.write().await.remove(path);
        Ok(())
    }

    /// Drop everything cached above the persistent store.
    pub async fn invalidate_all(&self) {
        if let Err(e) = self.shared.invalidate_tag(CACHE_TAG).await {
            warn!(error = %e, "shared cache tag invalidation failed");
        }
        self.local.write().await.clear();
    }

    /// Rebuild the store from a full listing of the bucket. Returns the number
    /// of records written.
    pub async fn refresh_from(&self, objects: &[ObjectInfo]) -> Result<usize> {
        let mut records: BTreeMap<String, ObjectMetadata> = BTreeMap::new();
        for obj in objects {
            let is_directory = obj.key.ends_with('/');
            let path = obj.key.trim_end_matches('/');
            if path.is_empty() {
                continue;
            }
            if path.chars().count() > self.max_path_length {
                warn!(key = %obj.key, "skipping key longer than the metadata limit");
                continue;
            }
            let created_at = obj.created.or(obj.last_modified).unwrap_or_else(Utc::now);
            records.insert(
                path.to_string(),
                ObjectMetadata {
                    path: path.to_string(),
                    file_size: if is_directory { 0 } else { obj.size },
                    is_directory,
                    created_at,
                },
            );
            let mut parent = path;
            while let Some(idx) = parent.rfind('/') {
                parent = &parent[..idx];
                records
                    .entry(parent.to_string())
                    .or_insert_with(|| ObjectMetadata {
                        created_at,
                        ..ObjectMetadata::directory(parent)
                    });
            }
        }

        let records: Vec<ObjectMetadata> = records.into_values().collect();
        self.store.clear().await?;
        self.store.insert_many(&records).await?;
        self.invalidate_all().await;
        Ok(records.len())
    }

    pub async fn cached_locally(&self, path: &str) -> bool {
        self.local.read().await.contains_key(path)
    }

    async fn remember(&self, value: Option<ObjectMetadata>) -> Option<ObjectMetadata> {
        if let Some(meta) = &value {
            self.local
                .write()
                .await
                .insert(meta.path.clone(), meta.clone());
        }
        value
    }

    async fn shared_get(&self, id: &str) -> Option<SharedEntry> {
        match self.shared.get(id).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(id, error = %e, "shared cache read failed");
                None
            }
        }
    }

    async fn shared_set(&self, id: &str, value: Option<ObjectMetadata>) {
        if let Err(e) = self.shared.set(id, value, &[CACHE_TAG]).await {
            warn!(id, error = %e, "shared cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::shared::MokaSharedCache;
    use crate::meta::store::InMemoryMetaStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store wrapper that counts selects and makes each one slow.
    struct SlowStore {
        inner: InMemoryMetaStore,
        selects: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl MetaStore for SlowStore {
        async fn select(&self, path: &str) -> Result<Option<ObjectMetadata>> {
            self.selects.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.inner.select(path).await
        }
        async fn insert(&self, meta: &ObjectMetadata) -> Result<()> {
            self.inner.insert(meta).await
        }
        async fn delete(&self, path: &str) -> Result<bool> {
            self.inner.delete(path).await
        }
        async fn clear(&self) -> Result<()> {
            self.inner.clear().await
        }
    }

    fn cache_with(store: Arc<dyn MetaStore>) -> (MetadataCache, Arc<MokaSharedCache>) {
        let shared = Arc::new(MokaSharedCache::default());
        (MetadataCache::new(store, shared.clone()), shared)
    }

    #[tokio::test]
    async fn test_set_then_get_returns_record() {
        let (cache, _) = cache_with(Arc::new(InMemoryMetaStore::new()));
        cache.set("a/b.txt", 12, false).await.unwrap();
        let got = cache.get("a/b.txt").await.unwrap().unwrap();
        assert_eq!(got.file_size, 12);
        assert!(!got.is_directory);
        assert!(cache.cached_locally("a/b.txt").await);
    }

    #[tokio::test]
    async fn test_delete_clears_every_tier() {
        let store = Arc::new(InMemoryMetaStore::new());
        let (cache, shared) = cache_with(store.clone());
        cache.set("x", 1, false).await.unwrap();
        cache.delete("x").await.unwrap();

        assert!(!cache.cached_locally("x").await);
        assert!(shared.get(&cache_id("x")).await.unwrap().is_none());
        assert!(store.select("x").await.unwrap().is_none());
        assert!(cache.get("x").await.unwrap().is_none());

        // deleting again is fine
        cache.delete("x").await.unwrap();
    }

    #[tokio::test]
    async fn test_negative_result_cached_in_shared_bin_only() {
        let (cache, shared) = cache_with(Arc::new(InMemoryMetaStore::new()));
        assert!(cache.get("nope").await.unwrap().is_none());
        let entry = shared.get(&cache_id("nope")).await.unwrap().unwrap();
        assert!(entry.value.is_none());
        assert!(!cache.cached_locally("nope").await);
    }

    #[tokio::test]
    async fn test_set_replaces_cached_negative() {
        let (cache, _) = cache_with(Arc::new(InMemoryMetaStore::new()));
        assert!(cache.get("f").await.unwrap().is_none());
        cache.set("f", 3, false).await.unwrap();
        assert_eq!(cache.get("f").await.unwrap().unwrap().file_size, 3);
    }

    #[tokio::test]
    async fn test_concurrent_misses_select_once() {
        let store = Arc::new(SlowStore {
            inner: InMemoryMetaStore::new(),
            selects: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
        });
        store
            .inner
            .insert(&ObjectMetadata::file("hot", 9))
            .await
            .unwrap();
        let (cache, _) = cache_with(store.clone());
        let cache = Arc::new(cache);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get("hot").await })
            })
            .collect();
        for t in futures::future::join_all(tasks).await {
            assert_eq!(t.unwrap().unwrap().unwrap().file_size, 9);
        }
        assert_eq!(store.selects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_fetch_persists_found_object() {
        let store = Arc::new(InMemoryMetaStore::new());
        let (cache, _) = cache_with(store.clone());
        let got = cache
            .get_or_fetch("remote.bin", || async {
                Ok(Some(ObjectMetadata::file("remote.bin", 77)))
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.file_size, 77);
        assert_eq!(store.select("remote.bin").await.unwrap().unwrap().file_size, 77);
    }

    #[tokio::test]
    async fn test_lock_timeout_falls_back_to_direct_read() {
        let store = Arc::new(InMemoryMetaStore::new());
        store.insert(&ObjectMetadata::file("p", 5)).await.unwrap();
        let (cache, _) = cache_with(store);
        let cache = cache.with_lock_wait(Duration::from_millis(10));

        let _held = cache.locks().try_acquire(&cache_id("p")).unwrap();
        let got = cache.get("p").await.unwrap().unwrap();
        assert_eq!(got.file_size, 5);
        // a direct read does not populate the caches
        assert!(!cache.cached_locally("p").await);
    }

    #[tokio::test]
    async fn test_refresh_registers_implicit_parents() {
        let store = Arc::new(InMemoryMetaStore::new());
        let (cache, _) = cache_with(store.clone());
        cache.set("stale", 1, false).await.unwrap();

        let objects = vec![
            ObjectInfo::new("styles/thumb/a.png", 10),
            ObjectInfo::new("empty/", 0),
            ObjectInfo::new("top.txt", 3),
        ];
        let written = cache.refresh_from(&objects).await.unwrap();
        assert_eq!(written, 5);

        assert!(cache.get("styles").await.unwrap().unwrap().is_directory);
        assert!(cache.get("styles/thumb").await.unwrap().unwrap().is_directory);
        assert!(cache.get("empty").await.unwrap().unwrap().is_directory);
        assert_eq!(cache.get("styles/thumb/a.png").await.unwrap().unwrap().file_size, 10);
        assert!(cache.get("stale").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_rejects_overlong_path() {
        let (cache, _) = cache_with(Arc::new(InMemoryMetaStore::new()));
        let long = "x".repeat(MAX_PATH_LENGTH + 1);
        let err = cache.set(&long, 0, false).await.unwrap_err();
        assert!(matches!(err, FsError::PathTooLong { .. }));
    }

    #[tokio::test]
    async fn test_raised_path_limit_accepts_longer_records() {
        let cache = MetadataCache::new(
            Arc::new(InMemoryMetaStore::new()),
            Arc::new(MokaSharedCache::default()),
        )
        .with_max_path_length(300);
        let long = "y".repeat(260);
        cache.set(&long, 4, false).await.unwrap();
        assert_eq!(cache.get(&long).await.unwrap().unwrap().file_size, 4);
        let err = cache.set(&"y".repeat(301), 0, false).await.unwrap_err();
        assert!(matches!(err, FsError::PathTooLong { limit: 300, .. }));
    }
}
