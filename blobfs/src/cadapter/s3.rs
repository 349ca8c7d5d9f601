//! S3 backend built on aws-sdk-s3.
//!
//! Small objects go up with a single `PutObject`; the upload pipe drives
//! multipart uploads for large ones. Every upload carries a Content-MD5.

use super::client::{
    CompletedPart, ListPage, ListRequest, ObjectBackend, ObjectBody, ObjectDownload, ObjectInfo,
};
use crate::error::{FsError, Result};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tracing::debug;

/// Smallest part S3 accepts for every part except the last.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    /// Custom endpoint (MinIO, rustfs, ...). `None` uses AWS.
    pub endpoint: Option<String>,
    pub region: String,
    pub force_path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            endpoint: None,
            region: "us-east-1".to_string(),
            force_path_style: false,
        }
    }
}

pub struct S3Backend {
    client: Client,
    config: S3Config,
}

fn md5_base64(data: &[u8]) -> String {
    B64.encode(md5::compute(data).0)
}

fn status_of<E>(err: &SdkError<E, HttpResponse>) -> Option<u16> {
    err.raw_response().map(|r| r.status().as_u16())
}

fn is_missing<E>(err: &SdkError<E, HttpResponse>) -> bool {
    status_of(err) == Some(404)
}

/// Map an SDK failure onto the filesystem taxonomy.
fn classify<E>(op: &str, key: &str, err: SdkError<E, HttpResponse>) -> FsError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let detail = format!("{op} {key}: {}", DisplayErrorContext(&err));
    if matches!(
        err,
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_)
    ) {
        return FsError::BackendUnavailable(detail);
    }
    match status_of(&err) {
        Some(401 | 403) => FsError::PermissionDenied(detail),
        Some(429) => FsError::BackendUnavailable(detail),
        Some(s) if s >= 500 => FsError::BackendUnavailable(detail),
        _ => FsError::Unknown(detail),
    }
}

fn to_chrono(t: Option<&aws_sdk_s3::primitives::DateTime>) -> Option<DateTime<Utc>> {
    t.and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()))
}

impl S3Backend {
    pub async fn new(config: S3Config) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .credentials_provider(
                aws_config::environment::EnvironmentVariableCredentialsProvider::new(),
            )
            .region(aws_config::Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;
        let s3_conf = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.force_path_style)
            .build();
        Ok(Self {
            client: Client::from_conf(s3_conf),
            config,
        })
    }

    fn bucket(&self) -> &str {
        &self.config.bucket
    }

    async fn download(&self, key: &str) -> Result<Option<Bytes>> {
        let Some(obj) = self.get_object(key).await? else {
            return Ok(None);
        };
        match obj.body {
            ObjectBody::Buffered(b) => Ok(Some(b)),
            ObjectBody::Stream(mut body) => {
                use tokio::io::AsyncReadExt;
                let mut buf = Vec::with_capacity(obj.info.size as usize);
                body.read_to_end(&mut buf).await?;
                Ok(Some(Bytes::from(buf)))
            }
        }
    }

    /// Server-side concatenation with `UploadPartCopy`.
    async fn compose_by_part_copy(
        &self,
        sources: &[String],
        dst: &str,
        content_type: Option<&str>,
    ) -> Result<()> {
        let upload_id = self.create_upload(dst, content_type).await?;
        let mut parts = Vec::with_capacity(sources.len());
        for (i, src) in sources.iter().enumerate() {
            let part_number = i as i32 + 1;
            let res = self
                .client
                .upload_part_copy()
                .bucket(self.bucket())
                .key(dst)
                .upload_id(&upload_id)
                .part_number(part_number)
                .copy_source(self.copy_source(src))
                .send()
                .await;
            match res {
                Ok(out) => parts.push(CompletedPart {
                    part_number,
                    e_tag: out
                        .copy_part_result()
                        .and_then(|r| r.e_tag())
                        .map(str::to_string),
                }),
                Err(e) => {
                    let err = classify("upload_part_copy", src, e);
                    self.abort_upload(dst, &upload_id).await?;
                    return Err(err);
                }
            }
        }
        self.complete_upload(dst, &upload_id, parts).await
    }

    fn copy_source(&self, key: &str) -> String {
        format!("{}/{}", self.bucket(), urlencoding::encode(key))
    }
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn get_object(&self, key: &str) -> Result<Option<ObjectDownload>> {
        let resp = self
            .client
            .get_object()
            .bucket(self.bucket())
            .key(key)
            .send()
            .await;
        match resp {
            Ok(o) => {
                let mut info = ObjectInfo::new(key, o.content_length().unwrap_or(0).max(0) as u64);
                info.content_type = o.content_type().map(str::to_string);
                info.last_modified = to_chrono(o.last_modified());
                Ok(Some(ObjectDownload {
                    info,
                    body: ObjectBody::Stream(Box::pin(o.body.into_async_read())),
                }))
            }
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(classify("get_object", key, e)),
        }
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectInfo>> {
        let resp = self
            .client
            .head_object()
            .bucket(self.bucket())
            .key(key)
            .send()
            .await;
        match resp {
            Ok(o) => {
                let mut info = ObjectInfo::new(key, o.content_length().unwrap_or(0).max(0) as u64);
                info.content_type = o.content_type().map(str::to_string);
                info.last_modified = to_chrono(o.last_modified());
                Ok(Some(info))
            }
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(classify("head_object", key, e)),
        }
    }

    async fn put_object(&self, key: &str, data: Bytes, content_type: Option<&str>) -> Result<()> {
        let checksum = md5_base64(&data);
        self.client
            .put_object()
            .bucket(self.bucket())
            .key(key)
            .set_content_type(content_type.map(str::to_string))
            .content_md5(checksum)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| classify("put_object", key, e))?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<bool> {
        // S3 deletes are idempotent, so existence has to be checked first.
        if self.head_object(key).await?.is_none() {
            return Ok(false);
        }
        self.client
            .delete_object()
            .bucket(self.bucket())
            .key(key)
            .send()
            .await
            .map_err(|e| classify("delete_object", key, e))?;
        Ok(true)
    }

    async fn list_objects(&self, req: &ListRequest) -> Result<ListPage> {
        let out = self
            .client
            .list_objects_v2()
            .bucket(self.bucket())
            .prefix(&req.prefix)
            .set_delimiter(req.delimiter.clone())
            .set_continuation_token(req.page_token.clone())
            .max_keys(req.max_keys.min(i32::MAX as usize) as i32)
            .send()
            .await
            .map_err(|e| classify("list_objects", &req.prefix, e))?;

        let objects = out
            .contents()
            .iter()
            .filter_map(|o| {
                let mut info = ObjectInfo::new(o.key()?, o.size().unwrap_or(0).max(0) as u64);
                info.last_modified = to_chrono(o.last_modified());
                Some(info)
            })
            .collect();
        let common_prefixes = out
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix().map(str::to_string))
            .collect();
        let next_token = if out.is_truncated().unwrap_or(false) {
            out.next_continuation_token().map(str::to_string)
        } else {
            None
        };
        Ok(ListPage {
            objects,
            common_prefixes,
            next_token,
        })
    }

    async fn copy_object(&self, src: &str, dst: &str) -> Result<bool> {
        let resp = self
            .client
            .copy_object()
            .bucket(self.bucket())
            .key(dst)
            .copy_source(self.copy_source(src))
            .send()
            .await;
        match resp {
            Ok(_) => Ok(true),
            Err(e) if is_missing(&e) => Ok(false),
            Err(e) => Err(classify("copy_object", src, e)),
        }
    }

    async fn compose_objects(
        &self,
        sources: &[String],
        dst: &str,
        content_type: Option<&str>,
    ) -> Result<Option<ObjectInfo>> {
        let mut sizes = Vec::with_capacity(sources.len());
        for src in sources {
            match self.head_object(src).await? {
                Some(info) => sizes.push(info.size),
                None => return Ok(None),
            }
        }

        let copyable = sizes.len() > 1
            && sizes[..sizes.len() - 1]
                .iter()
                .all(|s| *s >= MIN_PART_SIZE);
        if copyable {
            debug!(dst, parts = sources.len(), "compose via upload_part_copy");
            self.compose_by_part_copy(sources, dst, content_type).await?;
        } else {
            let mut merged = BytesMut::with_capacity(sizes.iter().sum::<u64>() as usize);
            for src in sources {
                match self.download(src).await? {
                    Some(data) => merged.extend_from_slice(&data),
                    None => return Ok(None),
                }
            }
            self.put_object(dst, merged.freeze(), content_type).await?;
        }
        self.head_object(dst).await
    }

    async fn create_upload(&self, key: &str, content_type: Option<&str>) -> Result<String> {
        let out = self
            .client
            .create_multipart_upload()
            .bucket(self.bucket())
            .key(key)
            .set_content_type(content_type.map(str::to_string))
            .send()
            .await
            .map_err(|e| classify("create_multipart_upload", key, e))?;
        out.upload_id()
            .map(str::to_string)
            .ok_or_else(|| FsError::unknown(format!("no upload id returned for {key}")))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<CompletedPart> {
        let checksum = md5_base64(&data);
        let out = self
            .client
            .upload_part()
            .bucket(self.bucket())
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .content_md5(checksum)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| classify("upload_part", key, e))?;
        Ok(CompletedPart {
            part_number,
            e_tag: out.e_tag().map(str::to_string),
        })
    }

    async fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .into_iter()
                    .map(|p| {
                        S3CompletedPart::builder()
                            .part_number(p.part_number)
                            .set_e_tag(p.e_tag)
                            .build()
                    })
                    .collect(),
            ))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(self.bucket())
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| classify("complete_multipart_upload", key, e))?;
        Ok(())
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(self.bucket())
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify("abort_multipart_upload", key, e))?;
        Ok(())
    }

    async fn bucket_exists(&self) -> Result<bool> {
        match self.client.head_bucket().bucket(self.bucket()).send().await {
            Ok(_) => Ok(true),
            Err(e) if is_missing(&e) => Ok(false),
            Err(e) => Err(classify("head_bucket", self.bucket(), e)),
        }
    }

    async fn bucket_writable(&self) -> Result<bool> {
        let probe = format!(".blobfs-write-probe-{}", uuid::Uuid::new_v4());
        match self.put_object(&probe, Bytes::new(), None).await {
            Ok(()) => {
                self.client
                    .delete_object()
                    .bucket(self.bucket())
                    .key(&probe)
                    .send()
                    .await
                    .map_err(|e| classify("delete_object", &probe, e))?;
                Ok(true)
            }
            Err(FsError::PermissionDenied(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn object_url(&self, key: &str) -> String {
        let key = key
            .split('/')
            .map(|s| urlencoding::encode(s).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        match &self.config.endpoint {
            Some(endpoint) if self.config.force_path_style => {
                format!("{}/{}/{}", endpoint.trim_end_matches('/'), self.bucket(), key)
            }
            Some(endpoint) => {
                let (scheme, host) = endpoint
                    .split_once("://")
                    .unwrap_or(("https", endpoint.as_str()));
                format!("{scheme}://{}.{}/{key}", self.bucket(), host.trim_end_matches('/'))
            }
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{key}",
                self.bucket(),
                self.config.region
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_base64_matches_known_digest() {
        // md5("hello") = 5d41402abc4b2a76b9719d911017c592
        assert_eq!(md5_base64(b"hello"), "XUFAKrxLKna5cZ2REBfFkg==");
    }

    #[tokio::test]
    async fn test_object_url_styles() {
        let path_style = S3Backend::new(S3Config {
            bucket: "media".into(),
            endpoint: Some("http://127.0.0.1:9000/".into()),
            region: "us-east-1".into(),
            force_path_style: true,
        })
        .await
        .unwrap();
        assert_eq!(
            path_style.object_url("a b/c.png"),
            "http://127.0.0.1:9000/media/a%20b/c.png"
        );

        let aws = S3Backend::new(S3Config {
            bucket: "media".into(),
            ..S3Config::default()
        })
        .await
        .unwrap();
        assert_eq!(
            aws.object_url("x.txt"),
            "https://media.s3.us-east-1.amazonaws.com/x.txt"
        );
    }
}
