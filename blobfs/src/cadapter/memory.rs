//! In-memory object store. Used for development and tests: every operation is
//! counted, latency can be injected, and copy/compose can be made to fail.

use super::client::{
    CompletedPart, ListPage, ListRequest, ObjectBackend, ObjectBody, ObjectDownload, ObjectInfo,
    paginate_listing,
};
use crate::error::{FsError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

#[derive(Clone)]
struct StoredObject {
    info: ObjectInfo,
    data: Bytes,
}

struct PendingUpload {
    key: String,
    content_type: Option<String>,
    parts: BTreeMap<i32, Bytes>,
}

/// Per-operation call counters.
#[derive(Default, Debug)]
pub struct CallCounts {
    pub get: AtomicUsize,
    pub head: AtomicUsize,
    pub put: AtomicUsize,
    pub delete: AtomicUsize,
    pub list: AtomicUsize,
    pub copy: AtomicUsize,
    pub compose: AtomicUsize,
    pub upload_part: AtomicUsize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        [
            &self.get,
            &self.head,
            &self.put,
            &self.delete,
            &self.list,
            &self.copy,
            &self.compose,
            &self.upload_part,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }
}

pub struct MemoryBackend {
    bucket: String,
    objects: RwLock<BTreeMap<String, StoredObject>>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    calls: CallCounts,
    latency: Option<Duration>,
    streaming: bool,
    writable: AtomicBool,
    failing_copies: Mutex<HashSet<String>>,
    fail_compose: AtomicBool,
}

impl MemoryBackend {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(BTreeMap::new()),
            uploads: Mutex::new(HashMap::new()),
            calls: CallCounts::default(),
            latency: None,
            streaming: false,
            writable: AtomicBool::new(true),
            failing_copies: Mutex::new(HashSet::new()),
            fail_compose: AtomicBool::new(false),
        }
    }

    /// Delay every head/get by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Hand out forward-only bodies instead of buffered ones.
    pub fn with_streaming_bodies(mut self) -> Self {
        self.streaming = true;
        self
    }

    pub fn calls(&self) -> &CallCounts {
        &self.calls
    }

    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    /// Make `copy_object` fail for `src` with a backend fault.
    pub async fn fail_copy_of(&self, src: impl Into<String>) {
        self.failing_copies.lock().await.insert(src.into());
    }

    pub fn set_fail_compose(&self, fail: bool) {
        self.fail_compose.store(fail, Ordering::SeqCst);
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    pub async fn contents(&self, key: &str) -> Option<Bytes> {
        self.objects.read().await.get(key).map(|o| o.data.clone())
    }

    pub async fn pending_uploads(&self) -> usize {
        self.uploads.lock().await.len()
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn ensure_writable(&self, key: &str) -> Result<()> {
        if self.writable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(FsError::PermissionDenied(key.to_string()))
        }
    }

    fn stored(key: &str, data: Bytes, content_type: Option<&str>) -> StoredObject {
        let now = Utc::now();
        StoredObject {
            info: ObjectInfo {
                key: key.to_string(),
                size: data.len() as u64,
                content_type: content_type.map(str::to_string),
                last_modified: Some(now),
                created: Some(now),
            },
            data,
        }
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn get_object(&self, key: &str) -> Result<Option<ObjectDownload>> {
        self.calls.get.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let Some(obj) = self.objects.read().await.get(key).cloned() else {
            return Ok(None);
        };
        let body = if self.streaming {
            ObjectBody::Stream(Box::pin(Cursor::new(obj.data.to_vec())))
        } else {
            ObjectBody::Buffered(obj.data)
        };
        Ok(Some(ObjectDownload {
            info: obj.info,
            body,
        }))
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectInfo>> {
        self.calls.head.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        Ok(self.objects.read().await.get(key).map(|o| o.info.clone()))
    }

    async fn put_object(&self, key: &str, data: Bytes, content_type: Option<&str>) -> Result<()> {
        self.calls.put.fetch_add(1, Ordering::SeqCst);
        self.ensure_writable(key)?;
        self.objects
            .write()
            .await
            .insert(key.to_string(), Self::stored(key, data, content_type));
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<bool> {
        self.calls.delete.fetch_add(1, Ordering::SeqCst);
        self.ensure_writable(key)?;
        Ok(self.objects.write().await.remove(key).is_some())
    }

    async fn list_objects(&self, req: &ListRequest) -> Result<ListPage> {
        self.calls.list.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.read().await;
        Ok(paginate_listing(objects.values().map(|o| &o.info), req))
    }

    async fn copy_object(&self, src: &str, dst: &str) -> Result<bool> {
        self.calls.copy.fetch_add(1, Ordering::SeqCst);
        self.ensure_writable(dst)?;
        if self.failing_copies.lock().await.contains(src) {
            return Err(FsError::BackendUnavailable(format!("injected copy fault on {src}")));
        }
        let mut objects = self.objects.write().await;
        let Some(source) = objects.get(src).cloned() else {
            return Ok(false);
        };
        let copy = Self::stored(dst, source.data, source.info.content_type.as_deref());
        objects.insert(dst.to_string(), copy);
        Ok(true)
    }

    async fn compose_objects(
        &self,
        sources: &[String],
        dst: &str,
        content_type: Option<&str>,
    ) -> Result<Option<ObjectInfo>> {
        self.calls.compose.fetch_add(1, Ordering::SeqCst);
        self.ensure_writable(dst)?;
        if self.fail_compose.load(Ordering::SeqCst) {
            return Err(FsError::BackendUnavailable(format!("injected compose fault on {dst}")));
        }
        let mut objects = self.objects.write().await;
        let mut merged = BytesMut::new();
        for src in sources {
            match objects.get(src) {
                Some(obj) => merged.extend_from_slice(&obj.data),
                None => return Ok(None),
            }
        }
        let stored = Self::stored(dst, merged.freeze(), content_type);
        let info = stored.info.clone();
        objects.insert(dst.to_string(), stored);
        Ok(Some(info))
    }

    async fn create_upload(&self, key: &str, content_type: Option<&str>) -> Result<String> {
        self.ensure_writable(key)?;
        let upload_id = uuid::Uuid::new_v4().to_string();
        self.uploads.lock().await.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                content_type: content_type.map(str::to_string),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<CompletedPart> {
        self.calls.upload_part.fetch_add(1, Ordering::SeqCst);
        let mut uploads = self.uploads.lock().await;
        let upload = uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| FsError::NotFound(format!("upload {upload_id}")))?;
        let e_tag = hex::encode(md5::compute(&data).0);
        upload.parts.insert(part_number, data);
        Ok(CompletedPart {
            part_number,
            e_tag: Some(e_tag),
        })
    }

    async fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()> {
        let upload = self
            .uploads
            .lock()
            .await
            .remove(upload_id)
            .ok_or_else(|| FsError::NotFound(format!("upload {upload_id}")))?;
        let mut merged = BytesMut::new();
        for part in &parts {
            let data = upload.parts.get(&part.part_number).ok_or_else(|| {
                FsError::unknown(format!("part {} was never uploaded", part.part_number))
            })?;
            merged.extend_from_slice(data);
        }
        self.objects.write().await.insert(
            key.to_string(),
            Self::stored(key, merged.freeze(), upload.content_type.as_deref()),
        );
        Ok(())
    }

    async fn abort_upload(&self, _key: &str, upload_id: &str) -> Result<()> {
        self.uploads.lock().await.remove(upload_id);
        Ok(())
    }

    async fn bucket_exists(&self) -> Result<bool> {
        Ok(true)
    }

    async fn bucket_writable(&self) -> Result<bool> {
        Ok(self.writable.load(Ordering::SeqCst))
    }

    fn object_url(&self, key: &str) -> String {
        format!("memory://{}/{}", self.bucket, key)
    }
}
