//! One open handle on an object.
//!
//! Object stores have no append, so append and mid-stream flushes write a
//! suffix object (`target~`) and compose `[target, target~]` back into the
//! target. Each flush commits one segment; close removes the suffix.

use super::mime::content_type_for;
use super::reader::ReadHandle;
use super::stat::FileStat;
use super::upload::UploadPipe;
use crate::cadapter::client::{DEFAULT_CONTENT_TYPE, ObjectBackend, ObjectClient};
use crate::error::{FsError, Result};
use crate::meta::MetadataCache;
use crate::path::VirtualPath;
use bytes::{Bytes, BytesMut};
use std::io::SeekFrom;
use std::sync::Arc;
use tracing::{debug, warn};

pub const SUFFIX_MARKER: char = '~';

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    Append,
}

impl OpenMode {
    /// Parse `r`, `w` or `a`, optionally followed by `b` or `t`.
    pub fn parse(mode: &str) -> Result<Self> {
        let base = mode
            .strip_suffix('b')
            .or_else(|| mode.strip_suffix('t'))
            .unwrap_or(mode);
        match base {
            "r" => Ok(Self::Read),
            "w" => Ok(Self::Write),
            "a" => Ok(Self::Append),
            _ => Err(FsError::NotSupported("open mode")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct OpenOptions {
    /// Wrap forward-only bodies so the stream can seek.
    pub must_seek: bool,
}

pub(crate) struct StreamContext<B: ObjectBackend> {
    pub client: Arc<ObjectClient<B>>,
    pub metadata: Arc<MetadataCache>,
    pub part_size: usize,
    pub max_path_length: usize,
}

impl<B: ObjectBackend> Clone for StreamContext<B> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            metadata: self.metadata.clone(),
            part_size: self.part_size,
            max_path_length: self.max_path_length,
        }
    }
}

struct WriteState<B: ObjectBackend> {
    pipe: Option<UploadPipe<B>>,
    dirty: bool,
    composing: bool,
    committed: bool,
    merged: bool,
    content_type: String,
    base_size: u64,
    accepted: u64,
}

enum StreamState<B: ObjectBackend> {
    Reading { handle: ReadHandle, size: u64 },
    Writing(WriteState<B>),
    Closed,
}

pub struct BlobStream<B: ObjectBackend> {
    ctx: StreamContext<B>,
    path: VirtualPath,
    mode: OpenMode,
    state: StreamState<B>,
    /// Size seen when the stream closed.
    closed_size: u64,
}

fn suffix_key(target: &str) -> String {
    format!("{target}{SUFFIX_MARKER}")
}

impl<B: ObjectBackend> BlobStream<B> {
    pub(crate) async fn open(
        ctx: StreamContext<B>,
        path: VirtualPath,
        mode: OpenMode,
        options: OpenOptions,
    ) -> Result<Self> {
        if path.target_len() > ctx.max_path_length {
            return Err(FsError::PathTooLong {
                path: path.to_string(),
                limit: ctx.max_path_length,
            });
        }
        if path.is_root() {
            return Err(FsError::NotSupported("opening the root as a file"));
        }

        let state = match mode {
            OpenMode::Read => {
                let download = ctx
                    .client
                    .get_object(&path.target)
                    .await?
                    .ok_or_else(|| FsError::NotFound(path.to_string()))?;
                StreamState::Reading {
                    handle: ReadHandle::new(download.body, options.must_seek),
                    size: download.info.size,
                }
            }
            OpenMode::Append => match ctx.client.head_object(&path.target).await? {
                Some(info) if info.size > 0 => {
                    debug!(path = %path, size = info.size, "append enters composing mode");
                    let content_type = info
                        .content_type
                        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
                    StreamState::Writing(WriteState {
                        pipe: Some(UploadPipe::new(
                            ctx.client.clone(),
                            suffix_key(&path.target),
                            Some(content_type.clone()),
                            ctx.part_size,
                        )),
                        dirty: false,
                        composing: true,
                        committed: false,
                        merged: false,
                        content_type,
                        base_size: info.size,
                        accepted: 0,
                    })
                }
                _ => StreamState::Writing(Self::fresh_write(&ctx, &path)),
            },
            OpenMode::Write => StreamState::Writing(Self::fresh_write(&ctx, &path)),
        };

        Ok(Self {
            ctx,
            path,
            mode,
            state,
            closed_size: 0,
        })
    }

    fn fresh_write(ctx: &StreamContext<B>, path: &VirtualPath) -> WriteState<B> {
        let content_type = content_type_for(&path.target).map(str::to_string);
        WriteState {
            pipe: Some(UploadPipe::new(
                ctx.client.clone(),
                path.target.clone(),
                content_type.clone(),
                ctx.part_size,
            )),
            dirty: false,
            composing: false,
            committed: false,
            merged: false,
            content_type: content_type.unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            base_size: 0,
            accepted: 0,
        }
    }

    pub fn path(&self) -> &VirtualPath {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, StreamState::Closed)
    }

    pub fn is_dirty(&self) -> bool {
        matches!(&self.state, StreamState::Writing(w) if w.dirty)
    }

    pub fn is_composing(&self) -> bool {
        matches!(&self.state, StreamState::Writing(w) if w.composing)
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let w = match &mut self.state {
            StreamState::Writing(w) => w,
            StreamState::Reading { .. } => {
                return Err(FsError::NotSupported("write on a read stream"));
            }
            StreamState::Closed => return Err(FsError::NotSupported("write on a closed stream")),
        };
        let pipe = w
            .pipe
            .as_mut()
            .ok_or_else(|| FsError::unknown(format!("{} has a failed upload", self.path)))?;
        let n = pipe.write(data).await?;
        w.accepted += n as u64;
        w.dirty = true;
        Ok(n)
    }

    /// Commit buffered writes. A no-op unless the stream is dirty.
    pub async fn flush(&mut self) -> Result<()> {
        let StreamState::Writing(w) = &mut self.state else {
            return Ok(());
        };
        if !w.dirty {
            return Ok(());
        }
        let pipe = w
            .pipe
            .take()
            .ok_or_else(|| FsError::unknown(format!("{} has a failed upload", self.path)))?;
        pipe.finish().await?;

        let target = &self.path.target;
        if w.composing {
            let sources = [target.clone(), suffix_key(target)];
            let composed = self
                .ctx
                .client
                .compose_objects(&sources, target, Some(&w.content_type))
                .await?;
            if composed.is_none() {
                return Err(FsError::NotFound(format!(
                    "{} disappeared before compose",
                    self.path
                )));
            }
            w.merged = true;
        }

        w.committed = true;
        w.composing = true;
        w.dirty = false;
        w.pipe = Some(UploadPipe::new(
            self.ctx.client.clone(),
            suffix_key(target),
            Some(w.content_type.clone()),
            self.ctx.part_size,
        ));
        Ok(())
    }

    /// Idempotent. Commits pending writes and records the object's metadata.
    pub async fn close(&mut self) -> Result<()> {
        let flushed = self.flush().await;
        let state = std::mem::replace(&mut self.state, StreamState::Closed);
        let mut w = match state {
            StreamState::Writing(w) => w,
            StreamState::Reading { size, .. } => {
                self.closed_size = size;
                return Ok(());
            }
            StreamState::Closed => return Ok(()),
        };
        self.closed_size = w.base_size + w.accepted;
        flushed?;

        let target = &self.path.target;
        if let Some(pipe) = w.pipe.take() {
            if !w.committed && !w.composing {
                pipe.finish().await?;
            } else {
                pipe.abort().await;
            }
        }
        if w.merged {
            if let Err(e) = self.ctx.client.delete_object(&suffix_key(target)).await {
                warn!(path = %self.path, error = %e, "failed to remove suffix object");
            }
        }

        let size = match self.ctx.client.head_object(target).await? {
            Some(info) => info.size,
            None => w.base_size + w.accepted,
        };
        self.closed_size = size;
        self.ctx.metadata.set(target, size, false).await
    }

    pub async fn read(&mut self, n: usize) -> Result<Bytes> {
        match &mut self.state {
            StreamState::Reading { handle, .. } => handle.read(n).await,
            StreamState::Writing(_) => Err(FsError::NotSupported("read on a write stream")),
            StreamState::Closed => Err(FsError::NotSupported("read on a closed stream")),
        }
    }

    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        loop {
            let chunk = self.read(64 * 1024).await?;
            if chunk.is_empty() {
                return Ok(out.freeze());
            }
            out.extend_from_slice(&chunk);
        }
    }

    pub async fn seek(&mut self, to: SeekFrom) -> Result<u64> {
        match &mut self.state {
            StreamState::Reading { handle, .. } => handle.seek(to).await,
            _ => Err(FsError::NotSupported("seek on a write stream")),
        }
    }

    pub fn tell(&self) -> u64 {
        match &self.state {
            StreamState::Reading { handle, .. } => handle.tell(),
            StreamState::Writing(w) => w.base_size + w.accepted,
            StreamState::Closed => 0,
        }
    }

    pub fn eof(&self) -> bool {
        match &self.state {
            StreamState::Reading { handle, .. } => handle.eof(),
            _ => false,
        }
    }

    pub fn stat(&self) -> FileStat {
        match &self.state {
            StreamState::Reading { size, .. } => FileStat::file(false, *size),
            StreamState::Writing(w) => FileStat::file(true, w.base_size + w.accepted),
            StreamState::Closed => FileStat::file(self.mode != OpenMode::Read, self.closed_size),
        }
    }

    pub fn truncate(&mut self, _size: u64) -> Result<()> {
        Err(FsError::NotSupported("truncate"))
    }

    pub fn lock(&mut self) -> Result<()> {
        Err(FsError::NotSupported("lock"))
    }

    pub fn set_option(&mut self, _option: &str, _value: &str) -> Result<()> {
        Err(FsError::NotSupported("set_option"))
    }
}
