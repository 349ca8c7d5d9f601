use blobfs::FsError;
use blobfs::cadapter::client::{ObjectBackend, ObjectClient};
use blobfs::cadapter::localfs::LocalFsBackend;
use blobfs::cadapter::memory::MemoryBackend;
use blobfs::meta::cache::cache_id;
use blobfs::meta::{
    InMemoryMetaStore, MetaStore, MetadataCache, MokaSharedCache, SharedCache, SqliteMetaStore,
};
use blobfs::path::PathResolver;
use blobfs::vfs::{BlobFs, FsOptions};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn options() -> FsOptions {
    FsOptions {
        scheme: "gs".into(),
        part_size: 16,
        list_page_size: 3,
        ..FsOptions::default()
    }
}

fn memory_fs(backend: MemoryBackend) -> BlobFs<MemoryBackend> {
    let metadata = MetadataCache::new(
        Arc::new(InMemoryMetaStore::new()),
        Arc::new(MokaSharedCache::default()),
    );
    BlobFs::new(
        Arc::new(ObjectClient::new(backend)),
        Arc::new(metadata),
        Arc::new(PathResolver::default()),
        options(),
    )
}

#[test]
fn resolve_is_idempotent_for_messy_paths() {
    let resolver = PathResolver::default();
    let segments = ["a", ".", "..", "", "b.txt", "v1.2", "..", "c"];
    for i in 0..segments.len() {
        for j in 0..segments.len() {
            for k in 0..segments.len() {
                let uri = format!("gs://{}/{}//{}", segments[i], segments[j], segments[k]);
                let once = resolver.resolve(&uri).unwrap();
                let twice = resolver.resolve(&once.to_string()).unwrap();
                assert_eq!(once, twice, "{uri}");
                assert!(!once.target.starts_with('/'));
                assert!(!once.target.contains("//"));
            }
        }
    }
}

#[tokio::test]
async fn set_then_get_answers_from_every_tier() {
    let store: Arc<dyn MetaStore> = Arc::new(SqliteMetaStore::connect("sqlite::memory:").await.unwrap());
    let shared = Arc::new(MokaSharedCache::default());

    let writer = MetadataCache::new(store.clone(), shared.clone());
    writer.set("p/file.bin", 1234, false).await.unwrap();

    // process-local tier
    let got = writer.get("p/file.bin").await.unwrap().unwrap();
    assert_eq!((got.file_size, got.is_directory), (1234, false));

    // shared tier: a second process-local map, same bin
    let sibling = MetadataCache::new(store.clone(), shared.clone());
    let got = sibling.get("p/file.bin").await.unwrap().unwrap();
    assert_eq!((got.file_size, got.is_directory), (1234, false));

    // persistent tier: fresh caches on the same store
    let cold = MetadataCache::new(store.clone(), Arc::new(MokaSharedCache::default()));
    let got = cold.get("p/file.bin").await.unwrap().unwrap();
    assert_eq!((got.file_size, got.is_directory), (1234, false));
}

#[tokio::test]
async fn delete_then_get_is_not_found_at_every_tier() {
    let store = Arc::new(InMemoryMetaStore::new());
    let shared = Arc::new(MokaSharedCache::default());
    let cache = MetadataCache::new(store.clone(), shared.clone());

    cache.set("gone", 1, false).await.unwrap();
    cache.get("gone").await.unwrap();
    cache.delete("gone").await.unwrap();

    assert!(!cache.cached_locally("gone").await);
    assert!(shared.get(&cache_id("gone")).await.unwrap().is_none());
    assert!(store.select("gone").await.unwrap().is_none());
    assert!(cache.get("gone").await.unwrap().is_none());
}

#[tokio::test]
async fn write_close_read_round_trip() {
    let fs = memory_fs(MemoryBackend::new("bucket"));
    let payload: Vec<u8> = (0..100u8).collect();

    let mut w = fs.open("gs://bucket/data/blob.bin", "wb").await.unwrap();
    for chunk in payload.chunks(7) {
        assert_eq!(w.write(chunk).await.unwrap(), chunk.len());
    }
    w.close().await.unwrap();

    let mut r = fs.open("gs://bucket/data/blob.bin", "rb").await.unwrap();
    assert_eq!(&r.read_to_end().await.unwrap()[..], &payload[..]);
    r.close().await.unwrap();

    // larger than one part, so it went up as a multipart upload
    let calls = fs.client().backend().calls();
    assert!(calls.upload_part.load(Ordering::SeqCst) > 1);
    assert_eq!(fs.stat("gs://bucket/data/blob.bin").await.unwrap().size, 100);
}

#[tokio::test]
async fn append_composes_original_and_new_bytes() {
    let fs = memory_fs(MemoryBackend::new("bucket"));
    fs.write("gs://logs/app.log", b"original;").await.unwrap();

    let mut s = fs.open("gs://logs/app.log", "a").await.unwrap();
    assert!(s.is_composing());
    s.write(b"appended").await.unwrap();
    s.flush().await.unwrap();

    assert_eq!(
        &fs.read("gs://logs/app.log").await.unwrap()[..],
        b"original;appended"
    );

    s.close().await.unwrap();
    let backend = fs.client().backend();
    assert!(backend.contents("logs/app.log~").await.is_none());
    assert_eq!(
        backend.contents("logs/app.log").await.unwrap(),
        Bytes::from_static(b"original;appended")
    );
    assert_eq!(fs.stat("gs://logs/app.log").await.unwrap().size, 17);
}

#[tokio::test]
async fn append_preserves_content_type() {
    let fs = memory_fs(MemoryBackend::new("bucket"));
    fs.write("gs://page.html", b"<p>").await.unwrap();
    fs.append("gs://page.html", b"</p>").await.unwrap();
    let info = fs.client().head_object("page.html").await.unwrap().unwrap();
    assert_eq!(info.content_type.as_deref(), Some("text/html"));
}

#[tokio::test]
async fn append_to_missing_object_behaves_like_write() {
    let fs = memory_fs(MemoryBackend::new("bucket"));
    let mut s = fs.open("gs://new.txt", "a").await.unwrap();
    assert!(!s.is_composing());
    s.write(b"first").await.unwrap();
    s.close().await.unwrap();
    assert_eq!(&fs.read("gs://new.txt").await.unwrap()[..], b"first");
    assert_eq!(fs.client().backend().calls().compose.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn concurrent_stat_fetches_once() {
    let backend = MemoryBackend::new("bucket").with_latency(Duration::from_millis(50));
    backend
        .put_object("hot.bin", Bytes::from_static(b"0123456789"), None)
        .await
        .unwrap();
    let fs = Arc::new(memory_fs(backend));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let fs = fs.clone();
            tokio::spawn(async move { fs.stat("gs://hot.bin").await })
        })
        .collect();
    for task in futures::future::join_all(tasks).await {
        assert_eq!(task.unwrap().unwrap().size, 10);
    }
    assert_eq!(fs.client().backend().calls().head.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn opendir_distinguishes_missing_from_empty() {
    let fs = memory_fs(MemoryBackend::new("bucket"));
    assert!(fs.opendir("gs://nowhere").await.unwrap().is_none());

    fs.mkdir("gs://empty").await.unwrap();
    let mut dir = fs.opendir("gs://empty").await.unwrap().unwrap();
    assert!(dir.next().await.unwrap().is_none());
}

#[tokio::test]
async fn mkdir_then_readdir_yields_child_once() {
    let fs = memory_fs(MemoryBackend::new("bucket"));
    fs.mkdir("gs://bucket/a/b").await.unwrap();

    let mut dir = fs.opendir("gs://bucket/a").await.unwrap().unwrap();
    assert_eq!(dir.next().await.unwrap().as_deref(), Some("b"));
    assert!(dir.next().await.unwrap().is_none());

    dir.rewind().await.unwrap();
    assert_eq!(dir.next().await.unwrap().as_deref(), Some("b"));
    assert!(fs.stat("gs://bucket/a/b").await.unwrap().is_dir());
}

#[tokio::test]
async fn overlong_path_is_rejected_without_backend_calls() {
    let fs = memory_fs(MemoryBackend::new("bucket"));
    let uri = format!("gs://{}", "x".repeat(256));

    let err = fs.open(&uri, "w").await.err().unwrap();
    assert!(matches!(err, FsError::PathTooLong { limit: 255, .. }));
    assert!(matches!(
        fs.mkdir(&uri).await,
        Err(FsError::PathTooLong { .. })
    ));
    assert!(matches!(
        fs.rename("gs://a", &uri).await,
        Err(FsError::PathTooLong { .. })
    ));
    assert_eq!(fs.client().backend().calls().total(), 0);

    // exactly at the limit is fine
    let ok = format!("gs://{}", "y".repeat(255));
    fs.write(&ok, b"").await.unwrap();
}

#[tokio::test]
async fn failed_directory_rename_leaves_both_trees() {
    let fs = memory_fs(MemoryBackend::new("bucket"));
    for name in ["a", "b", "c"] {
        fs.write(&format!("gs://dir/{name}"), name.as_bytes())
            .await
            .unwrap();
    }
    fs.client().backend().fail_copy_of("dir/b").await;

    match fs.rename("gs://dir", "gs://moved").await {
        Err(FsError::RenameIncomplete { moved, total, .. }) => {
            assert_eq!((moved, total), (1, 3));
        }
        other => panic!("expected a partial rename, got {other:?}"),
    }

    let keys = fs.client().backend().keys().await;
    assert_eq!(keys, vec!["dir/b", "dir/c", "moved/a"]);
    assert_eq!(&fs.read("gs://moved/a").await.unwrap()[..], b"a");
    assert_eq!(&fs.read("gs://dir/b").await.unwrap()[..], b"b");
    assert!(fs.stat("gs://dir/a").await.is_none());
}

#[tokio::test]
async fn local_backend_with_sqlite_metadata() {
    let root = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", db.path().join("meta.db").display());

    let store: Arc<dyn MetaStore> = Arc::new(SqliteMetaStore::connect(&url).await.unwrap());
    let fs = BlobFs::new(
        Arc::new(ObjectClient::new(LocalFsBackend::new(root.path()))),
        Arc::new(MetadataCache::new(store, Arc::new(MokaSharedCache::default()))),
        Arc::new(PathResolver::default()),
        options(),
    );

    fs.mkdir("gs://site/styles").await.unwrap();
    fs.write("gs://site/styles/logo.png", b"png-bytes").await.unwrap();
    fs.append("gs://site/styles/logo.png", b"+more").await.unwrap();

    assert_eq!(
        &fs.read("gs://site/styles/logo.png").await.unwrap()[..],
        b"png-bytes+more"
    );
    assert!(!root.path().join("site/styles/logo.png~").exists());

    let mut dir = fs.opendir("gs://site").await.unwrap().unwrap();
    assert_eq!(dir.next().await.unwrap().as_deref(), Some("styles"));
    assert!(dir.next().await.unwrap().is_none());

    assert_eq!(fs.refresh_metadata().await.unwrap(), 3);
    assert_eq!(fs.stat("gs://site/styles/logo.png").await.unwrap().size, 14);
}

#[tokio::test]
async fn stat_never_fails_on_backend_faults() {
    struct Broken;

    #[async_trait::async_trait]
    impl ObjectBackend for Broken {
        async fn get_object(
            &self,
            _key: &str,
        ) -> blobfs::Result<Option<blobfs::cadapter::client::ObjectDownload>> {
            Err(FsError::BackendUnavailable("down".into()))
        }
        async fn head_object(
            &self,
            _key: &str,
        ) -> blobfs::Result<Option<blobfs::cadapter::client::ObjectInfo>> {
            Err(FsError::BackendUnavailable("down".into()))
        }
        async fn put_object(&self, _key: &str, _data: Bytes, _content_type: Option<&str>) -> blobfs::Result<()> {
            Err(FsError::BackendUnavailable("down".into()))
        }
        async fn delete_object(&self, _key: &str) -> blobfs::Result<bool> {
            Err(FsError::BackendUnavailable("down".into()))
        }
        async fn list_objects(
            &self,
            _req: &blobfs::cadapter::client::ListRequest,
        ) -> blobfs::Result<blobfs::cadapter::client::ListPage> {
            Err(FsError::BackendUnavailable("down".into()))
        }
        async fn copy_object(&self, _src: &str, _dst: &str) -> blobfs::Result<bool> {
            Err(FsError::BackendUnavailable("down".into()))
        }
        async fn compose_objects(
            &self,
            _sources: &[String],
            _dst: &str,
            _content_type: Option<&str>,
        ) -> blobfs::Result<Option<blobfs::cadapter::client::ObjectInfo>> {
            Err(FsError::BackendUnavailable("down".into()))
        }
        async fn create_upload(&self, _key: &str, _content_type: Option<&str>) -> blobfs::Result<String> {
            Err(FsError::BackendUnavailable("down".into()))
        }
        async fn upload_part(
            &self,
            _key: &str,
            _upload_id: &str,
            _part_number: i32,
            _data: Bytes,
        ) -> blobfs::Result<blobfs::cadapter::client::CompletedPart> {
            Err(FsError::BackendUnavailable("down".into()))
        }
        async fn complete_upload(
            &self,
            _key: &str,
            _upload_id: &str,
            _parts: Vec<blobfs::cadapter::client::CompletedPart>,
        ) -> blobfs::Result<()> {
            Err(FsError::BackendUnavailable("down".into()))
        }
        async fn abort_upload(&self, _key: &str, _upload_id: &str) -> blobfs::Result<()> {
            Ok(())
        }
        async fn bucket_exists(&self) -> blobfs::Result<bool> {
            Err(FsError::BackendUnavailable("down".into()))
        }
        async fn bucket_writable(&self) -> blobfs::Result<bool> {
            Err(FsError::BackendUnavailable("down".into()))
        }
        fn object_url(&self, key: &str) -> String {
            key.to_string()
        }
    }

    let fs = BlobFs::new(
        Arc::new(ObjectClient::new(Broken)),
        Arc::new(MetadataCache::new(
            Arc::new(InMemoryMetaStore::new()),
            Arc::new(MokaSharedCache::default()),
        )),
        Arc::new(PathResolver::default()),
        options(),
    );
    assert!(fs.stat("gs://anything").await.is_none());
    assert!(matches!(
        fs.open("gs://anything", "r").await,
        Err(FsError::BackendUnavailable(_))
    ));
}
