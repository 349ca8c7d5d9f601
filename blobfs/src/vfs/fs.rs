//! Filesystem facade: path-based operations over an object store.
//!
//! `BlobFs` is built from explicit dependencies (client, metadata cache,
//! resolver) and hands out `BlobStream` and `DirIterator` handles.

use super::dir::{DELIMITER, DirIterator};
use super::stat::FileStat;
use super::stream::{BlobStream, OpenMode, OpenOptions, StreamContext};
use crate::cadapter::client::{ListRequest, ObjectBackend, ObjectClient, ObjectInfo};
use crate::config::Config;
use crate::error::{FsError, Result};
use crate::meta::{
    MetaStore, MetadataCache, MokaSharedCache, ObjectMetadata, SqliteMetaStore,
};
use crate::path::{PathResolver, VirtualPath};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct FsOptions {
    pub scheme: String,
    pub part_size: usize,
    pub list_page_size: usize,
    pub max_path_length: usize,
    /// Protocol used for external URLs when `cdn_host` is set.
    pub protocol: String,
    pub cdn_host: Option<String>,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            scheme: "blob".to_string(),
            part_size: super::upload::DEFAULT_PART_SIZE,
            list_page_size: super::dir::DEFAULT_PAGE_SIZE,
            max_path_length: crate::meta::MAX_PATH_LENGTH,
            protocol: "https".to_string(),
            cdn_host: None,
        }
    }
}

impl From<&Config> for FsOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            scheme: cfg.scheme.clone(),
            part_size: cfg.part_size,
            list_page_size: cfg.list_page_size,
            max_path_length: cfg.max_path_length,
            protocol: cfg.protocol.clone(),
            cdn_host: cfg.cdn_host.clone(),
        }
    }
}

pub struct BlobFs<B: ObjectBackend> {
    ctx: StreamContext<B>,
    resolver: Arc<PathResolver>,
    options: FsOptions,
    writable: OnceCell<bool>,
}

fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

impl<B: ObjectBackend> BlobFs<B> {
    pub fn new(
        client: Arc<ObjectClient<B>>,
        metadata: Arc<MetadataCache>,
        resolver: Arc<PathResolver>,
        mut options: FsOptions,
    ) -> Self {
        // Nothing longer than the metadata store accepts may reach the backend.
        if options.max_path_length > metadata.max_path_length() {
            warn!(
                requested = options.max_path_length,
                limit = metadata.max_path_length(),
                "max_path_length capped by the metadata store"
            );
            options.max_path_length = metadata.max_path_length();
        }
        Self {
            ctx: StreamContext {
                client,
                metadata,
                part_size: options.part_size,
                max_path_length: options.max_path_length,
            },
            resolver,
            options,
            writable: OnceCell::new(),
        }
    }

    /// Wire up the metadata store and caches described by `cfg` around `backend`.
    pub async fn from_config(backend: B, cfg: &Config) -> Result<Self> {
        let store: Arc<dyn MetaStore> = Arc::new(SqliteMetaStore::connect(&cfg.metadata_url).await?);
        let metadata = MetadataCache::new(store, Arc::new(MokaSharedCache::default()))
            .with_lock_wait(Duration::from_millis(cfg.lock_wait_ms))
            .with_max_path_length(cfg.max_path_length);
        Ok(Self::new(
            Arc::new(ObjectClient::new(backend)),
            Arc::new(metadata),
            Arc::new(PathResolver::default()),
            FsOptions::from(cfg),
        ))
    }

    pub fn client(&self) -> &Arc<ObjectClient<B>> {
        &self.ctx.client
    }

    pub fn metadata(&self) -> &Arc<MetadataCache> {
        &self.ctx.metadata
    }

    pub fn options(&self) -> &FsOptions {
        &self.options
    }

    pub fn resolve(&self, uri: &str) -> Result<VirtualPath> {
        let path = self.resolver.resolve(uri)?;
        if path.scheme != self.options.scheme {
            return Err(FsError::InvalidUri(uri.to_string()));
        }
        Ok(path)
    }

    fn check_length(&self, path: &VirtualPath) -> Result<()> {
        if path.target_len() > self.options.max_path_length {
            return Err(FsError::PathTooLong {
                path: path.to_string(),
                limit: self.options.max_path_length,
            });
        }
        Ok(())
    }

    /// Whether the bucket accepts writes. Probed once per filesystem.
    async fn writable(&self) -> bool {
        match self
            .writable
            .get_or_try_init(|| self.ctx.client.bucket_writable())
            .await
        {
            Ok(w) => *w,
            Err(_) => false,
        }
    }

    pub async fn open(&self, uri: &str, mode: &str) -> Result<BlobStream<B>> {
        self.open_with(uri, mode, OpenOptions::default()).await
    }

    pub async fn open_with(
        &self,
        uri: &str,
        mode: &str,
        options: OpenOptions,
    ) -> Result<BlobStream<B>> {
        let mode = OpenMode::parse(mode)?;
        let path = self.resolve(uri)?;
        BlobStream::open(self.ctx.clone(), path, mode, options).await
    }

    /// `None` when nothing lives at `uri`. Failures are logged, not returned.
    pub async fn stat(&self, uri: &str) -> Option<FileStat> {
        match self.try_stat(uri).await {
            Ok(stat) => stat,
            Err(e) => {
                warn!(uri, error = %e, "stat failed");
                None
            }
        }
    }

    async fn try_stat(&self, uri: &str) -> Result<Option<FileStat>> {
        let path = self.resolve(uri)?;
        let writable = self.writable().await;
        if path.is_root() {
            return Ok(Some(FileStat::directory(writable)));
        }
        if path.target_len() > self.options.max_path_length {
            return Ok(None);
        }

        let client = &self.ctx.client;
        let target = path.target.as_str();
        let record = self
            .ctx
            .metadata
            .get_or_fetch(target, || async move {
                Ok(client.head_object(target).await?.map(|info| ObjectMetadata {
                    path: target.to_string(),
                    file_size: info.size,
                    is_directory: false,
                    created_at: info.created.or(info.last_modified).unwrap_or_else(Utc::now),
                }))
            })
            .await?;

        match record {
            Some(meta) => {
                let stat = if meta.is_directory {
                    FileStat::directory(writable)
                } else {
                    FileStat::file(writable, meta.file_size)
                };
                Ok(Some(stat.with_times(Some(meta.created_at), Some(meta.created_at))))
            }
            None if self.has_children(&path).await? => Ok(Some(FileStat::directory(writable))),
            None => Ok(None),
        }
    }

    async fn has_children(&self, path: &VirtualPath) -> Result<bool> {
        let req = ListRequest::new(format!("{}{DELIMITER}", path.target))
            .delimiter(DELIMITER)
            .max_keys(1);
        Ok(!self.ctx.client.list_objects(&req).await?.is_empty())
    }

    pub async fn mkdir(&self, uri: &str) -> Result<()> {
        let path = self.resolve(uri)?;
        self.check_length(&path)?;
        if path.is_root() {
            return Ok(());
        }

        let mut level = String::new();
        for seg in path.target.split('/') {
            if !level.is_empty() {
                level.push('/');
            }
            level.push_str(seg);
            match self.ctx.metadata.get(&level).await? {
                Some(meta) if meta.is_directory => continue,
                Some(_) => {
                    return Err(FsError::unknown(format!(
                        "{level} exists and is not a directory"
                    )));
                }
                None => {}
            }
            self.ctx
                .client
                .put_object(&format!("{level}{DELIMITER}"), Bytes::new(), None)
                .await?;
            self.ctx.metadata.set(&level, 0, true).await?;
            debug!(dir = %level, "created directory placeholder");
        }
        Ok(())
    }

    pub async fn rmdir(&self, uri: &str) -> Result<()> {
        let path = self.resolve(uri)?;
        if path.is_root() {
            return Err(FsError::NotSupported("removing the root directory"));
        }
        let placeholder = format!("{}{DELIMITER}", path.target);
        let has_placeholder = self.ctx.client.object_exists(&placeholder).await?;
        let has_record = self
            .ctx
            .metadata
            .get(&path.target)
            .await?
            .is_some_and(|m| m.is_directory);

        let page = self
            .ctx
            .client
            .list_objects(
                &ListRequest::new(placeholder.clone())
                    .delimiter(DELIMITER)
                    .max_keys(2),
            )
            .await?;
        let has_children = !page.common_prefixes.is_empty()
            || page.objects.iter().any(|o| o.key != placeholder);

        if !has_placeholder && !has_record && !has_children {
            return Err(FsError::NotFound(path.to_string()));
        }
        if has_children {
            return Err(FsError::DirectoryNotEmpty(path.to_string()));
        }
        if has_placeholder {
            self.ctx.client.delete_object(&placeholder).await?;
        }
        self.ctx.metadata.delete(&path.target).await
    }

    pub async fn unlink(&self, uri: &str) -> Result<()> {
        let path = self.resolve(uri)?;
        if path.is_root() {
            return Err(FsError::NotSupported("unlinking the root directory"));
        }
        let existed = self.ctx.client.delete_object(&path.target).await?;
        self.ctx.metadata.delete(&path.target).await?;
        if existed {
            Ok(())
        } else {
            Err(FsError::NotFound(path.to_string()))
        }
    }

    /// Move `from` (an object, a directory, or both) to `to` key by key.
    ///
    /// Not atomic: the first failure stops the walk and already-moved keys
    /// stay moved.
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        self.check_length(&dst)?;
        if src.is_root() || dst.is_root() {
            return Err(FsError::NotSupported("renaming the root directory"));
        }

        let mut keys: Vec<ObjectInfo> = Vec::new();
        if let Some(info) = self.ctx.client.head_object(&src.target).await? {
            keys.push(info);
        }
        let listing = self
            .ctx
            .client
            .list_all(
                ListRequest::new(format!("{}{DELIMITER}", src.target))
                    .max_keys(self.options.list_page_size),
            )
            .await?;
        keys.extend(listing.objects);
        if keys.is_empty() {
            return Err(FsError::NotFound(src.to_string()));
        }

        let total = keys.len();
        for (moved, info) in keys.iter().enumerate() {
            let new_key = format!("{}{}", dst.target, &info.key[src.target.len()..]);
            if let Err(source) = self.move_key(info, &new_key).await {
                return Err(FsError::RenameIncomplete {
                    from: src.to_string(),
                    moved,
                    total,
                    source: Box::new(source),
                });
            }
        }

        // An implicit directory may have a record without a placeholder.
        if let Some(record) = self.ctx.metadata.get(&src.target).await? {
            self.ctx.metadata.delete(&src.target).await?;
            self.ctx
                .metadata
                .put(ObjectMetadata {
                    path: dst.target.clone(),
                    ..record
                })
                .await?;
        }
        info!(from = %src, to = %dst, objects = total, "renamed");
        Ok(())
    }

    async fn move_key(&self, info: &ObjectInfo, new_key: &str) -> Result<()> {
        if !self.ctx.client.copy_object(&info.key, new_key).await? {
            return Err(FsError::NotFound(info.key.clone()));
        }
        self.ctx.client.delete_object(&info.key).await?;

        let old_path = info.key.trim_end_matches(DELIMITER);
        let new_path = new_key.trim_end_matches(DELIMITER);
        let record = self.ctx.metadata.get(old_path).await?;
        self.ctx.metadata.delete(old_path).await?;
        let moved = match record {
            Some(r) => ObjectMetadata {
                path: new_path.to_string(),
                ..r
            },
            None if info.key.ends_with(DELIMITER) => ObjectMetadata::directory(new_path),
            None => ObjectMetadata::file(new_path, info.size),
        };
        self.ctx.metadata.put(moved).await
    }

    /// `None` when nothing lives under `uri`.
    pub async fn opendir(&self, uri: &str) -> Result<Option<DirIterator<B>>> {
        let path = self.resolve(uri)?;
        DirIterator::open(self.ctx.client.clone(), &path, self.options.list_page_size).await
    }

    pub fn dirname(&self, uri: &str) -> Result<String> {
        Ok(self.resolve(uri)?.dirname().to_string())
    }

    /// Public URL of the object, through the CDN host when one is configured.
    pub fn external_url(&self, uri: &str) -> Result<String> {
        let path = self.resolve(uri)?;
        Ok(match &self.options.cdn_host {
            Some(host) => format!(
                "{}://{}/{}",
                self.options.protocol,
                host.trim_end_matches('/'),
                encode_key(&path.target)
            ),
            None => self.ctx.client.object_url(&path.target),
        })
    }

    /// Rebuild the metadata store from a full listing of the bucket.
    pub async fn refresh_metadata(&self) -> Result<usize> {
        let listing = self
            .ctx
            .client
            .list_all(ListRequest::new("").max_keys(self.options.list_page_size))
            .await?;
        let written = self.ctx.metadata.refresh_from(&listing.objects).await?;
        info!(objects = listing.objects.len(), records = written, "metadata refreshed");
        Ok(written)
    }

    pub async fn touch(&self, _uri: &str) -> Result<()> {
        Err(FsError::NotSupported("touch"))
    }

    pub async fn read(&self, uri: &str) -> Result<Bytes> {
        let mut stream = self.open(uri, "r").await?;
        let data = stream.read_to_end().await?;
        stream.close().await?;
        Ok(data)
    }

    pub async fn write(&self, uri: &str, data: &[u8]) -> Result<()> {
        let mut stream = self.open(uri, "w").await?;
        stream.write(data).await?;
        stream.close().await
    }

    pub async fn append(&self, uri: &str, data: &[u8]) -> Result<()> {
        let mut stream = self.open(uri, "a").await?;
        stream.write(data).await?;
        stream.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::memory::MemoryBackend;
    use crate::meta::InMemoryMetaStore;
    use crate::vfs::stat::{MODE_DIR_READONLY, MODE_FILE_WRITABLE};

    fn fs_with(backend: MemoryBackend, options: FsOptions) -> BlobFs<MemoryBackend> {
        let metadata = MetadataCache::new(
            Arc::new(InMemoryMetaStore::new()),
            Arc::new(MokaSharedCache::default()),
        );
        BlobFs::new(
            Arc::new(ObjectClient::new(backend)),
            Arc::new(metadata),
            Arc::new(PathResolver::default()),
            FsOptions {
                scheme: "gs".into(),
                ..options
            },
        )
    }

    fn fs() -> BlobFs<MemoryBackend> {
        fs_with(MemoryBackend::new("bucket"), FsOptions::default())
    }

    #[tokio::test]
    async fn test_stat_file_directory_and_missing() {
        let fs = fs();
        fs.write("gs://docs/a.txt", b"hello").await.unwrap();

        let file = fs.stat("gs://docs/a.txt").await.unwrap();
        assert_eq!(file.mode, MODE_FILE_WRITABLE);
        assert_eq!(file.size, 5);
        assert!(file.mtime.is_some());

        // implicit directory: no placeholder, but it has children
        assert!(fs.stat("gs://docs").await.unwrap().is_dir());
        assert!(fs.stat("gs://").await.unwrap().is_dir());
        assert!(fs.stat("gs://nope").await.is_none());
        assert!(fs.stat("other://docs").await.is_none());
    }

    #[tokio::test]
    async fn test_stat_on_read_only_bucket() {
        let backend = MemoryBackend::new("bucket");
        backend.set_writable(false);
        let fs = fs_with(backend, FsOptions::default());
        assert_eq!(fs.stat("gs://").await.unwrap().mode, MODE_DIR_READONLY);
    }

    #[tokio::test]
    async fn test_stat_picks_up_objects_written_elsewhere() {
        let fs = fs();
        fs.client()
            .put_object("external.bin", Bytes::from_static(b"1234"), None)
            .await
            .unwrap();
        assert_eq!(fs.stat("gs://external.bin").await.unwrap().size, 4);
        assert!(fs.metadata().store().select("external.bin").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rmdir_rules() {
        let fs = fs();
        assert!(fs.rmdir("gs://missing").await.unwrap_err().is_not_found());

        fs.mkdir("gs://d/sub").await.unwrap();
        assert!(matches!(
            fs.rmdir("gs://d").await,
            Err(FsError::DirectoryNotEmpty(_))
        ));
        fs.rmdir("gs://d/sub").await.unwrap();
        fs.rmdir("gs://d").await.unwrap();
        assert!(fs.stat("gs://d").await.is_none());
        assert!(fs.client().backend().keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_unlink() {
        let fs = fs();
        fs.write("gs://f.txt", b"x").await.unwrap();
        fs.unlink("gs://f.txt").await.unwrap();
        assert!(fs.stat("gs://f.txt").await.is_none());
        assert!(fs.unlink("gs://f.txt").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rename_file_and_directory() {
        let fs = fs();
        fs.write("gs://one.txt", b"1").await.unwrap();
        fs.rename("gs://one.txt", "gs://two.txt").await.unwrap();
        assert!(fs.stat("gs://one.txt").await.is_none());
        assert_eq!(&fs.read("gs://two.txt").await.unwrap()[..], b"1");

        fs.mkdir("gs://src").await.unwrap();
        fs.write("gs://src/a", b"a").await.unwrap();
        fs.write("gs://src/deep/b", b"b").await.unwrap();
        fs.rename("gs://src", "gs://dst").await.unwrap();

        let keys = fs.client().backend().keys().await;
        assert_eq!(keys, vec!["dst/", "dst/a", "dst/deep/b", "two.txt"]);
        assert!(fs.stat("gs://dst").await.unwrap().is_dir());
        assert!(fs.metadata().get("src").await.unwrap().is_none());
        assert!(fs.rename("gs://src", "gs://x").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_external_url_and_dirname() {
        let fs = fs_with(
            MemoryBackend::new("bucket"),
            FsOptions {
                protocol: "http".into(),
                cdn_host: Some("cdn.example.com".into()),
                ..FsOptions::default()
            },
        );
        assert_eq!(
            fs.external_url("gs://styles/a b/ü.png").unwrap(),
            "http://cdn.example.com/styles/a%20b/%C3%BC.png"
        );
        assert_eq!(fs.dirname("gs://styles/a b/x.png").unwrap(), "gs://styles/a b");

        let plain = self::fs();
        assert_eq!(plain.external_url("gs://x").unwrap(), "memory://bucket/x");
    }

    #[tokio::test]
    async fn test_touch_is_not_supported() {
        assert!(matches!(
            fs().touch("gs://x").await,
            Err(FsError::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_metadata_rebuilds_records() {
        let fs = fs();
        fs.client()
            .put_object("a/b/c.txt", Bytes::from_static(b"abc"), None)
            .await
            .unwrap();
        assert_eq!(fs.refresh_metadata().await.unwrap(), 3);
        assert!(fs.metadata().get("a/b").await.unwrap().unwrap().is_directory);
        assert_eq!(fs.metadata().get("a/b/c.txt").await.unwrap().unwrap().file_size, 3);
    }

    #[tokio::test]
    async fn test_path_limit_capped_by_metadata_store() {
        let fs = fs_with(
            MemoryBackend::new("bucket"),
            FsOptions {
                max_path_length: 300,
                ..FsOptions::default()
            },
        );
        assert_eq!(fs.options().max_path_length, crate::meta::MAX_PATH_LENGTH);

        let uri = format!("gs://{}", "x".repeat(260));
        assert!(matches!(
            fs.write(&uri, b"data").await,
            Err(FsError::PathTooLong { limit: 255, .. })
        ));
        assert_eq!(fs.client().backend().calls().total(), 0);
        assert!(fs.client().backend().keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_configured_path_limit_reaches_metadata() {
        let cfg = Config::from_yaml(
            "scheme: gs\nbackend:\n  type: memory\n  bucket: b\nmax_path_length: 300\n",
        )
        .unwrap();
        let fs = BlobFs::from_config(MemoryBackend::new("b"), &cfg).await.unwrap();
        assert_eq!(fs.options().max_path_length, 300);

        let target = "x".repeat(260);
        fs.write(&format!("gs://{target}"), b"data").await.unwrap();
        let meta = fs.metadata().get(&target).await.unwrap().unwrap();
        assert_eq!(meta.file_size, 4);
        assert!(matches!(
            fs.write(&format!("gs://{}", "x".repeat(301)), b"").await,
            Err(FsError::PathTooLong { limit: 300, .. })
        ));
    }
}
