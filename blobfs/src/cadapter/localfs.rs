//! Local directory backend, used to mock an object store (implements ObjectBackend).
//!
//! Keys map to paths under `root`. A key with a trailing `/` is stored as a
//! directory, which is how placeholder objects round-trip.

use super::client::{
    CompletedPart, ListPage, ListRequest, ObjectBackend, ObjectBody, ObjectDownload, ObjectInfo,
    paginate_listing,
};
use crate::error::{FsError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tokio::{fs, io::AsyncWriteExt};

type PartMap = BTreeMap<i32, Bytes>;

pub struct LocalFsBackend {
    root: PathBuf,
    uploads: Mutex<HashMap<String, (String, PartMap)>>,
}

fn io_fault(key: &str, e: std::io::Error) -> FsError {
    match e.kind() {
        ErrorKind::PermissionDenied => FsError::PermissionDenied(key.to_string()),
        _ => FsError::Io(e),
    }
}

impl LocalFsBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            uploads: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_end_matches('/'))
    }

    async fn info_for(&self, key: &str) -> Result<Option<ObjectInfo>> {
        let meta = match fs::metadata(self.path_for(key)).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_fault(key, e)),
        };
        // `a/` is only an object if `a` is a directory, and vice versa.
        if meta.is_dir() != key.ends_with('/') {
            return Ok(None);
        }
        let mut info = ObjectInfo::new(key, if meta.is_dir() { 0 } else { meta.len() });
        info.last_modified = meta.modified().ok().map(DateTime::<Utc>::from);
        info.created = meta.created().ok().map(DateTime::<Utc>::from);
        Ok(Some(info))
    }

    /// Every key under the root, sorted.
    async fn all_keys(&self) -> Result<Vec<ObjectInfo>> {
        let mut out = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];
        while let Some((dir, prefix)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_fault(&prefix, e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let meta = entry.metadata().await?;
                let mut info = if meta.is_dir() {
                    let key = format!("{prefix}{name}/");
                    pending.push((entry.path(), key.clone()));
                    ObjectInfo::new(key, 0)
                } else {
                    ObjectInfo::new(format!("{prefix}{name}"), meta.len())
                };
                info.last_modified = meta.modified().ok().map(DateTime::<Utc>::from);
                out.push(info);
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn write_file(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        if key.ends_with('/') {
            return fs::create_dir_all(path).await.map_err(|e| io_fault(key, e));
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await.map_err(|e| io_fault(key, e))?;
        }
        let mut f = fs::File::create(path).await.map_err(|e| io_fault(key, e))?;
        f.write_all(data).await?;
        f.flush().await?;
        Ok(())
    }

    async fn read_file(&self, key: &str) -> Result<Option<Bytes>> {
        if key.ends_with('/') {
            return Ok(self.info_for(key).await?.map(|_| Bytes::new()));
        }
        match fs::read(self.path_for(key)).await {
            Ok(buf) => Ok(Some(Bytes::from(buf))),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::IsADirectory) => Ok(None),
            Err(e) => Err(io_fault(key, e)),
        }
    }
}

#[async_trait]
impl ObjectBackend for LocalFsBackend {
    async fn get_object(&self, key: &str) -> Result<Option<ObjectDownload>> {
        let Some(info) = self.info_for(key).await? else {
            return Ok(None);
        };
        let Some(data) = self.read_file(key).await? else {
            return Ok(None);
        };
        Ok(Some(ObjectDownload {
            info,
            body: ObjectBody::Buffered(data),
        }))
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectInfo>> {
        self.info_for(key).await
    }

    async fn put_object(&self, key: &str, data: Bytes, _content_type: Option<&str>) -> Result<()> {
        self.write_file(key, &data).await
    }

    async fn delete_object(&self, key: &str) -> Result<bool> {
        if self.info_for(key).await?.is_none() {
            return Ok(false);
        }
        let path = self.path_for(key);
        let res = if key.ends_with('/') {
            // Only an empty directory can go; children keep the prefix alive.
            match fs::remove_dir(&path).await {
                Err(e) if e.kind() == ErrorKind::DirectoryNotEmpty => return Ok(true),
                other => other,
            }
        } else {
            fs::remove_file(&path).await
        };
        match res {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_fault(key, e)),
        }
    }

    async fn list_objects(&self, req: &ListRequest) -> Result<ListPage> {
        let all = self.all_keys().await?;
        Ok(paginate_listing(&all, req))
    }

    async fn copy_object(&self, src: &str, dst: &str) -> Result<bool> {
        match self.read_file(src).await? {
            Some(data) => {
                self.write_file(dst, &data).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn compose_objects(
        &self,
        sources: &[String],
        dst: &str,
        _content_type: Option<&str>,
    ) -> Result<Option<ObjectInfo>> {
        let mut merged = BytesMut::new();
        for src in sources {
            match self.read_file(src).await? {
                Some(data) => merged.extend_from_slice(&data),
                None => return Ok(None),
            }
        }
        self.write_file(dst, &merged).await?;
        self.info_for(dst).await
    }

    async fn create_upload(&self, key: &str, _content_type: Option<&str>) -> Result<String> {
        let upload_id = uuid::Uuid::new_v4().to_string();
        self.uploads
            .lock()
            .await
            .insert(upload_id.clone(), (key.to_string(), PartMap::new()));
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<CompletedPart> {
        let mut uploads = self.uploads.lock().await;
        let (_, parts) = uploads
            .get_mut(upload_id)
            .ok_or_else(|| FsError::NotFound(format!("upload {upload_id}")))?;
        parts.insert(part_number, data);
        Ok(CompletedPart {
            part_number,
            e_tag: None,
        })
    }

    async fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()> {
        let (_, stored) = self
            .uploads
            .lock()
            .await
            .remove(upload_id)
            .ok_or_else(|| FsError::NotFound(format!("upload {upload_id}")))?;
        let mut merged = BytesMut::new();
        for part in parts {
            if let Some(data) = stored.get(&part.part_number) {
                merged.extend_from_slice(data);
            }
        }
        self.write_file(key, &merged).await
    }

    async fn abort_upload(&self, _key: &str, upload_id: &str) -> Result<()> {
        self.uploads.lock().await.remove(upload_id);
        Ok(())
    }

    async fn bucket_exists(&self) -> Result<bool> {
        Ok(fs::metadata(&self.root).await.is_ok_and(|m| m.is_dir()))
    }

    async fn bucket_writable(&self) -> Result<bool> {
        let probe = self.root.join(format!(".blobfs-probe-{}", uuid::Uuid::new_v4()));
        match fs::write(&probe, b"").await {
            Ok(()) => {
                fs::remove_file(&probe).await?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::PermissionDenied => Ok(false),
            Err(e) => Err(FsError::Io(e)),
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("file://{}", self.root.join(key).display())
    }
}
