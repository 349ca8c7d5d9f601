//! Metadata layer
//!
//! Responsibilities:
//! - Keep one `ObjectMetadata` record per path so `stat` and directory checks
//!   do not have to go to the object store.
//! - Layer the persistent store behind a shared cache bin and a process-local
//!   map, guarded by per-path named locks so concurrent misses hit the store once.
//!
//! Submodules:
//! - `store`: persistent store trait and the in-memory implementation
//! - `sqlite`: SQLx-backed persistent store
//! - `shared`: shared cache bin with tag invalidation
//! - `lock`: named locks with bounded wait
//! - `cache`: the three-tier `MetadataCache`
pub mod cache;
pub mod lock;
pub mod shared;
pub mod sqlite;
pub mod store;

pub use cache::MetadataCache;
pub use lock::NamedLocks;
pub use shared::{MokaSharedCache, SharedCache};
pub use sqlite::SqliteMetaStore;
pub use store::{InMemoryMetaStore, MetaStore};

use chrono::{DateTime, Utc};

/// Longest path the metadata store accepts, in characters.
pub const MAX_PATH_LENGTH: usize = 255;

/// One record per path. Directories are synthetic and explicitly flagged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub path: String,
    pub file_size: u64,
    pub is_directory: bool,
    pub created_at: DateTime<Utc>,
}

impl ObjectMetadata {
    pub fn file(path: impl Into<String>, file_size: u64) -> Self {
        Self {
            path: path.into(),
            file_size,
            is_directory: false,
            created_at: Utc::now(),
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            file_size: 0,
            is_directory: true,
            created_at: Utc::now(),
        }
    }
}
