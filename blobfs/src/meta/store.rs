use super::ObjectMetadata;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Persistent metadata store. The source of truth for `ObjectMetadata`.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn select(&self, path: &str) -> Result<Option<ObjectMetadata>>;

    /// Insert or replace the record for `meta.path`.
    async fn insert(&self, meta: &ObjectMetadata) -> Result<()>;

    /// Returns `false` if there was no record.
    async fn delete(&self, path: &str) -> Result<bool>;

    async fn clear(&self) -> Result<()>;

    async fn insert_many(&self, records: &[ObjectMetadata]) -> Result<()> {
        for meta in records {
            self.insert(meta).await?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryMetaStore {
    records: RwLock<HashMap<String, ObjectMetadata>>,
}

impl InMemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl MetaStore for InMemoryMetaStore {
    async fn select(&self, path: &str) -> Result<Option<ObjectMetadata>> {
        Ok(self.records.read().await.get(path).cloned())
    }

    async fn insert(&self, meta: &ObjectMetadata) -> Result<()> {
        self.records
            .write()
            .await
            .insert(meta.path.clone(), meta.clone());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        Ok(self.records.write().await.remove(path).is_some())
    }

    async fn clear(&self) -> Result<()> {
        self.records.write().await.clear();
        Ok(())
    }
}
