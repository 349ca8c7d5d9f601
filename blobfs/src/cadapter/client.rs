//! Backend trait and the client wrapper used by the vfs layer.
//!
//! Backends translate their SDK errors into [`FsError`] themselves; the
//! [`ObjectClient`] is the only place that logs a failed backend call, so a
//! failure is reported exactly once regardless of how far up it travels.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::pin::Pin;
use tokio::io::AsyncRead;
use tracing::{debug, error};

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Object properties as reported by head/list calls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
}

impl ObjectInfo {
    pub fn new(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
            content_type: None,
            last_modified: None,
            created: None,
        }
    }
}

/// Object content handed to a read stream.
pub enum ObjectBody {
    /// Fully buffered content; seekable.
    Buffered(Bytes),
    /// A network body; forward-only.
    Stream(Pin<Box<dyn AsyncRead + Send>>),
}

pub struct ObjectDownload {
    pub info: ObjectInfo,
    pub body: ObjectBody,
}

/// One page of a prefix/delimiter listing.
#[derive(Clone, Debug, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectInfo>,
    pub common_prefixes: Vec<String>,
    pub next_token: Option<String>,
}

impl ListPage {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.common_prefixes.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListRequest {
    pub prefix: String,
    pub delimiter: Option<String>,
    pub page_token: Option<String>,
    pub max_keys: usize,
}

impl ListRequest {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            delimiter: None,
            page_token: None,
            max_keys: 1000,
        }
    }

    pub fn delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = Some(delimiter.into());
        self
    }

    pub fn page_token(mut self, token: Option<String>) -> Self {
        self.page_token = token;
        self
    }

    pub fn max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = max_keys.max(1);
        self
    }
}

/// A committed part of a multipart upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub e_tag: Option<String>,
}

/// Primitive operations of an object store.
///
/// `Ok(None)` / `Ok(false)` mean "no such object"; `Err` is always a fault.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    async fn get_object(&self, key: &str) -> Result<Option<ObjectDownload>>;

    async fn head_object(&self, key: &str) -> Result<Option<ObjectInfo>>;

    async fn put_object(&self, key: &str, data: Bytes, content_type: Option<&str>) -> Result<()>;

    /// Returns `false` if the object did not exist.
    async fn delete_object(&self, key: &str) -> Result<bool>;

    async fn list_objects(&self, req: &ListRequest) -> Result<ListPage>;

    /// Returns `false` if the source did not exist.
    async fn copy_object(&self, src: &str, dst: &str) -> Result<bool>;

    /// Concatenate `sources` server side into `dst`. `None` if a source is
    /// missing.
    async fn compose_objects(
        &self,
        sources: &[String],
        dst: &str,
        content_type: Option<&str>,
    ) -> Result<Option<ObjectInfo>>;

    async fn create_upload(&self, key: &str, content_type: Option<&str>) -> Result<String>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<CompletedPart>;

    async fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()>;

    async fn abort_upload(&self, key: &str, upload_id: &str) -> Result<()>;

    async fn bucket_exists(&self) -> Result<bool>;

    /// Whether the credentials in use may write to the bucket.
    async fn bucket_writable(&self) -> Result<bool>;

    fn object_url(&self, key: &str) -> String;
}

/// Logging wrapper around a backend. Every operation of the vfs layer goes
/// through here.
pub struct ObjectClient<B: ObjectBackend> {
    backend: B,
}

fn log_failure<T>(op: &'static str, key: &str, res: Result<T>) -> Result<T> {
    if let Err(e) = &res {
        error!(op, key, error = %e, "object backend call failed");
    }
    res
}

impl<B: ObjectBackend> ObjectClient<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn get_object(&self, key: &str) -> Result<Option<ObjectDownload>> {
        log_failure("get_object", key, self.backend.get_object(key).await)
    }

    pub async fn head_object(&self, key: &str) -> Result<Option<ObjectInfo>> {
        log_failure("head_object", key, self.backend.head_object(key).await)
    }

    pub async fn object_exists(&self, key: &str) -> Result<bool> {
        Ok(self.head_object(key).await?.is_some())
    }

    pub async fn put_object(&self, key: &str, data: Bytes, content_type: Option<&str>) -> Result<()> {
        debug!(key, len = data.len(), "put_object");
        log_failure(
            "put_object",
            key,
            self.backend.put_object(key, data, content_type).await,
        )
    }

    pub async fn delete_object(&self, key: &str) -> Result<bool> {
        log_failure("delete_object", key, self.backend.delete_object(key).await)
    }

    pub async fn list_objects(&self, req: &ListRequest) -> Result<ListPage> {
        log_failure("list_objects", &req.prefix, self.backend.list_objects(req).await)
    }

    /// Follow continuation tokens until the listing is exhausted.
    pub async fn list_all(&self, req: ListRequest) -> Result<ListPage> {
        let mut out = ListPage::default();
        let mut req = req;
        loop {
            let page = self.list_objects(&req).await?;
            out.objects.extend(page.objects);
            out.common_prefixes.extend(page.common_prefixes);
            match page.next_token {
                Some(token) => req = req.page_token(Some(token)),
                None => break,
            }
        }
        Ok(out)
    }

    pub async fn copy_object(&self, src: &str, dst: &str) -> Result<bool> {
        log_failure("copy_object", src, self.backend.copy_object(src, dst).await)
    }

    pub async fn compose_objects(
        &self,
        sources: &[String],
        dst: &str,
        content_type: Option<&str>,
    ) -> Result<Option<ObjectInfo>> {
        log_failure(
            "compose_objects",
            dst,
            self.backend.compose_objects(sources, dst, content_type).await,
        )
    }

    pub async fn create_upload(&self, key: &str, content_type: Option<&str>) -> Result<String> {
        log_failure(
            "create_upload",
            key,
            self.backend.create_upload(key, content_type).await,
        )
    }

    pub async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<CompletedPart> {
        debug!(key, part_number, len = data.len(), "upload_part");
        log_failure(
            "upload_part",
            key,
            self.backend
                .upload_part(key, upload_id, part_number, data)
                .await,
        )
    }

    pub async fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()> {
        log_failure(
            "complete_upload",
            key,
            self.backend.complete_upload(key, upload_id, parts).await,
        )
    }

    pub async fn abort_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        log_failure(
            "abort_upload",
            key,
            self.backend.abort_upload(key, upload_id).await,
        )
    }

    pub async fn bucket_exists(&self) -> Result<bool> {
        log_failure("bucket_exists", "", self.backend.bucket_exists().await)
    }

    pub async fn bucket_writable(&self) -> Result<bool> {
        log_failure("bucket_writable", "", self.backend.bucket_writable().await)
    }

    pub fn object_url(&self, key: &str) -> String {
        self.backend.object_url(key)
    }
}

/// Apply prefix/delimiter/pagination semantics to a sorted key space. Used by
/// the backends that keep their own key index.
pub(crate) fn paginate_listing<'a, I>(entries: I, req: &ListRequest) -> ListPage
where
    I: IntoIterator<Item = &'a ObjectInfo>,
{
    let mut page = ListPage::default();
    let mut last_emitted: Option<String> = None;
    let mut truncated = false;

    for info in entries {
        if !info.key.starts_with(&req.prefix) {
            continue;
        }
        let rest = &info.key[req.prefix.len()..];
        let (entry_key, is_prefix) = match req.delimiter.as_deref() {
            Some(d) if !d.is_empty() => match rest.find(d) {
                Some(idx) => (format!("{}{}", req.prefix, &rest[..idx + d.len()]), true),
                None => (info.key.clone(), false),
            },
            _ => (info.key.clone(), false),
        };

        if let Some(token) = &req.page_token {
            if entry_key.as_str() <= token.as_str() {
                continue;
            }
        }
        if last_emitted.as_deref() == Some(entry_key.as_str()) {
            continue;
        }
        if page.objects.len() + page.common_prefixes.len() >= req.max_keys {
            truncated = true;
            break;
        }

        if is_prefix {
            page.common_prefixes.push(entry_key.clone());
        } else {
            page.objects.push(info.clone());
        }
        last_emitted = Some(entry_key);
    }

    if truncated {
        page.next_token = last_emitted;
    }
    page
}
