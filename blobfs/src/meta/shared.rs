//! Shared cache bin: a keyed cache with tag-based bulk invalidation.

use super::ObjectMetadata;
use crate::error::{FsError, Result};
use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

/// A cached value; `None` records a confirmed miss.
#[derive(Clone, Debug)]
pub struct SharedEntry {
    pub value: Option<ObjectMetadata>,
    pub tags: Arc<[String]>,
}

#[async_trait]
pub trait SharedCache: Send + Sync {
    /// `Ok(None)` is a cache miss; `Ok(Some(entry))` with `entry.value == None`
    /// is a cached negative result.
    async fn get(&self, id: &str) -> Result<Option<SharedEntry>>;

    async fn set(&self, id: &str, value: Option<ObjectMetadata>, tags: &[&str]) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn invalidate_tag(&self, tag: &str) -> Result<()>;
}

pub struct MokaSharedCache {
    entries: Cache<String, SharedEntry>,
}

impl MokaSharedCache {
    pub fn new(capacity: u64) -> Self {
        Self::with_ttl(capacity, None)
    }

    pub fn with_ttl(capacity: u64, ttl: Option<Duration>) -> Self {
        let mut builder = Cache::builder()
            .max_capacity(capacity)
            .support_invalidation_closures();
        if let Some(ttl) = ttl {
            builder = builder.time_to_live(ttl);
        }
        Self {
            entries: builder.build(),
        }
    }
}

impl Default for MokaSharedCache {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl SharedCache for MokaSharedCache {
    async fn get(&self, id: &str) -> Result<Option<SharedEntry>> {
        Ok(self.entries.get(id).await)
    }

    async fn set(&self, id: &str, value: Option<ObjectMetadata>, tags: &[&str]) -> Result<()> {
        let tags: Arc<[String]> = tags.iter().map(|t| t.to_string()).collect();
        self.entries
            .insert(id.to_string(), SharedEntry { value, tags })
            .await;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.entries.invalidate(id).await;
        Ok(())
    }

    async fn invalidate_tag(&self, tag: &str) -> Result<()> {
        let tag = tag.to_string();
        self.entries
            .invalidate_entries_if(move |_, entry| entry.tags.iter().any(|t| *t == tag))
            .map_err(|e| FsError::unknown(format!("cache invalidation failed: {e}")))?;
        // Predicates are applied lazily; flush so later reads see the result.
        self.entries.run_pending_tasks().await;
        Ok(())
    }
}
