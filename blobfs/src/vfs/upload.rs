//! Buffered upload of one object.
//!
//! Bytes are buffered until a full part is available, at which point a
//! multipart upload is started (lazily) and the part is sent. Objects that
//! never fill a part go up with a single put on [`UploadPipe::finish`].

use crate::cadapter::client::{CompletedPart, ObjectBackend, ObjectClient};
use crate::error::{FsError, Result};
use bytes::BytesMut;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

pub struct UploadPipe<B: ObjectBackend> {
    client: Arc<ObjectClient<B>>,
    key: String,
    content_type: Option<String>,
    part_size: usize,
    buffer: BytesMut,
    upload_id: Option<String>,
    parts: Vec<CompletedPart>,
    written: u64,
    failed: bool,
}

impl<B: ObjectBackend> UploadPipe<B> {
    pub fn new(
        client: Arc<ObjectClient<B>>,
        key: impl Into<String>,
        content_type: Option<String>,
        part_size: usize,
    ) -> Self {
        let part_size = part_size.max(1);
        Self {
            client,
            key: key.into(),
            content_type,
            part_size,
            buffer: BytesMut::with_capacity(part_size.min(DEFAULT_PART_SIZE)),
            upload_id: None,
            parts: Vec::new(),
            written: 0,
            failed: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Bytes accepted so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.failed {
            return Err(FsError::unknown(format!(
                "upload of {} already failed",
                self.key
            )));
        }
        self.buffer.extend_from_slice(data);
        self.written += data.len() as u64;
        while self.buffer.len() >= self.part_size {
            if let Err(e) = self.send_part().await {
                self.fail().await;
                return Err(e);
            }
        }
        Ok(data.len())
    }

    async fn send_part(&mut self) -> Result<()> {
        let upload_id = match &self.upload_id {
            Some(id) => id.clone(),
            None => {
                let id = self
                    .client
                    .create_upload(&self.key, self.content_type.as_deref())
                    .await?;
                debug!(key = %self.key, upload_id = %id, "started multipart upload");
                self.upload_id = Some(id.clone());
                id
            }
        };
        let take = self.part_size.min(self.buffer.len());
        let chunk = self.buffer.split_to(take).freeze();
        let part_number = self.parts.len() as i32 + 1;
        let part = self
            .client
            .upload_part(&self.key, &upload_id, part_number, chunk)
            .await?;
        self.parts.push(part);
        Ok(())
    }

    async fn fail(&mut self) {
        self.failed = true;
        let Some(upload_id) = self.upload_id.take() else {
            return;
        };
        if let Err(e) = self.client.abort_upload(&self.key, &upload_id).await {
            warn!(key = %self.key, error = %e, "failed to abort multipart upload");
        }
    }

    /// Commit everything written so far as the object. Returns the object size.
    pub async fn finish(mut self) -> Result<u64> {
        if self.failed {
            return Err(FsError::unknown(format!(
                "upload of {} already failed",
                self.key
            )));
        }
        if self.upload_id.is_none() {
            let data = self.buffer.split().freeze();
            self.client
                .put_object(&self.key, data, self.content_type.as_deref())
                .await?;
            return Ok(self.written);
        }

        if !self.buffer.is_empty() {
            if let Err(e) = self.send_part().await {
                self.fail().await;
                return Err(e);
            }
        }
        let upload_id = self.upload_id.take().unwrap_or_default();
        let parts = std::mem::take(&mut self.parts);
        if let Err(e) = self
            .client
            .complete_upload(&self.key, &upload_id, parts)
            .await
        {
            self.upload_id = Some(upload_id);
            self.fail().await;
            return Err(e);
        }
        Ok(self.written)
    }

    /// Drop buffered data and abort any started upload.
    pub async fn abort(mut self) {
        self.fail().await;
    }
}
