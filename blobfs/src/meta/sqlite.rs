//! SQLite-backed metadata store.

use super::{MetaStore, ObjectMetadata};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS object_metadata (
    path TEXT PRIMARY KEY NOT NULL,
    file_size INTEGER NOT NULL DEFAULT 0,
    directory INTEGER NOT NULL DEFAULT 0,
    created INTEGER NOT NULL DEFAULT 0
)";

#[derive(sqlx::FromRow)]
struct MetadataRow {
    path: String,
    file_size: i64,
    directory: i64,
    created: i64,
}

impl From<MetadataRow> for ObjectMetadata {
    fn from(row: MetadataRow) -> Self {
        Self {
            path: row.path,
            file_size: row.file_size.max(0) as u64,
            is_directory: row.directory != 0,
            created_at: DateTime::<Utc>::from_timestamp(row.created, 0).unwrap_or_default(),
        }
    }
}

pub struct SqliteMetaStore {
    pool: Arc<SqlitePool>,
}

impl SqliteMetaStore {
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    /// Open `url` (e.g. `sqlite::memory:` or `sqlite://meta.db`) and create the
    /// table if needed.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let in_memory = url.contains(":memory:");
        // Every connection to `:memory:` is a separate database, so pin the
        // pool to one long-lived connection.
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(8)
                .connect_with(options)
                .await?
        };
        let store = Self::new(Arc::new(pool));
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE).execute(self.pool.as_ref()).await?;
        Ok(())
    }
}

#[async_trait]
impl MetaStore for SqliteMetaStore {
    async fn select(&self, path: &str) -> Result<Option<ObjectMetadata>> {
        let row = sqlx::query_as::<_, MetadataRow>(
            "SELECT path, file_size, directory, created FROM object_metadata WHERE path = $1",
        )
        .bind(path)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(row.map(ObjectMetadata::from))
    }

    async fn insert(&self, meta: &ObjectMetadata) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO object_metadata (path, file_size, directory, created) VALUES ($1, $2, $3, $4)",
        )
        .bind(&meta.path)
        .bind(meta.file_size.min(i64::MAX as u64) as i64)
        .bind(meta.is_directory as i64)
        .bind(meta.created_at.timestamp())
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM object_metadata WHERE path = $1")
            .bind(path)
            .execute(self.pool.as_ref())
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM object_metadata")
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn insert_many(&self, records: &[ObjectMetadata]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for meta in records {
            sqlx::query(
                "INSERT OR REPLACE INTO object_metadata (path, file_size, directory, created) VALUES ($1, $2, $3, $4)",
            )
            .bind(&meta.path)
            .bind(meta.file_size.min(i64::MAX as u64) as i64)
            .bind(meta.is_directory as i64)
            .bind(meta.created_at.timestamp())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
