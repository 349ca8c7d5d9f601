//! Download side of a stream: the content handle fetched at open time.

use crate::cadapter::client::ObjectBody;
use crate::error::{FsError, Result};
use bytes::Bytes;
use std::io::SeekFrom;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 64 * 1024;

type Body = Pin<Box<dyn AsyncRead + Send>>;

/// Read `want` bytes from `body` unless it ends first.
async fn fill(body: &mut Body, want: usize, out: &mut Vec<u8>) -> Result<bool> {
    let mut chunk = vec![0u8; want.clamp(1, READ_CHUNK)];
    let mut remaining = want;
    while remaining > 0 {
        let cap = remaining.min(chunk.len());
        let n = body.read(&mut chunk[..cap]).await?;
        if n == 0 {
            return Ok(true);
        }
        out.extend_from_slice(&chunk[..n]);
        remaining -= n;
    }
    Ok(false)
}

fn resolve_seek(pos: u64, len: Option<u64>, to: SeekFrom) -> Result<u64> {
    let target = match to {
        SeekFrom::Start(off) => Some(off as i128),
        SeekFrom::Current(delta) => Some(pos as i128 + delta as i128),
        SeekFrom::End(delta) => len.map(|l| l as i128 + delta as i128),
    };
    match target {
        Some(t) if t >= 0 => Ok(t.min(u64::MAX as i128) as u64),
        Some(_) => Err(FsError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "seek before start of stream",
        ))),
        None => Err(FsError::NotSupported("seek from end of unbounded stream")),
    }
}

/// Wraps a forward-only body and keeps what has been read so it can seek.
pub struct CachingReader {
    body: Body,
    cache: Vec<u8>,
    pos: usize,
    exhausted: bool,
}

impl CachingReader {
    pub fn new(body: Body) -> Self {
        Self {
            body,
            cache: Vec::new(),
            pos: 0,
            exhausted: false,
        }
    }

    async fn ensure(&mut self, upto: usize) -> Result<()> {
        if !self.exhausted && self.cache.len() < upto {
            let want = upto - self.cache.len();
            self.exhausted = fill(&mut self.body, want, &mut self.cache).await?;
        }
        Ok(())
    }

    async fn drain(&mut self) -> Result<()> {
        if !self.exhausted {
            self.body.read_to_end(&mut self.cache).await?;
            self.exhausted = true;
        }
        Ok(())
    }

    pub async fn read(&mut self, n: usize) -> Result<Bytes> {
        let upto = self.pos.saturating_add(n);
        self.ensure(upto).await?;
        let end = upto.min(self.cache.len());
        let start = self.pos.min(end);
        self.pos = end;
        Ok(Bytes::copy_from_slice(&self.cache[start..end]))
    }

    pub async fn seek(&mut self, to: SeekFrom) -> Result<u64> {
        if matches!(to, SeekFrom::End(_)) {
            self.drain().await?;
        }
        let len = self.exhausted.then_some(self.cache.len() as u64);
        let target = resolve_seek(self.pos as u64, len, to)?;
        let target = usize::try_from(target)
            .map_err(|_| FsError::NotSupported("seek beyond addressable range"))?;
        self.ensure(target).await?;
        self.pos = target.min(self.cache.len());
        Ok(self.pos as u64)
    }

    fn eof(&self) -> bool {
        self.exhausted && self.pos >= self.cache.len()
    }
}

pub enum ReadHandle {
    Buffered { data: Bytes, pos: usize },
    Stream { body: Body, pos: u64, eof: bool },
    Caching(CachingReader),
}

impl ReadHandle {
    pub fn new(body: ObjectBody, must_seek: bool) -> Self {
        match body {
            ObjectBody::Buffered(data) => Self::Buffered { data, pos: 0 },
            ObjectBody::Stream(body) if must_seek => Self::Caching(CachingReader::new(body)),
            ObjectBody::Stream(body) => Self::Stream {
                body,
                pos: 0,
                eof: false,
            },
        }
    }

    pub fn is_seekable(&self) -> bool {
        !matches!(self, Self::Stream { .. })
    }

    pub async fn read(&mut self, n: usize) -> Result<Bytes> {
        match self {
            Self::Buffered { data, pos } => {
                let start = (*pos).min(data.len());
                let end = start.saturating_add(n).min(data.len());
                *pos = end;
                Ok(data.slice(start..end))
            }
            Self::Stream { body, pos, eof } => {
                if *eof || n == 0 {
                    return Ok(Bytes::new());
                }
                let mut out = Vec::with_capacity(n.min(READ_CHUNK));
                *eof = fill(body, n, &mut out).await?;
                *pos += out.len() as u64;
                Ok(Bytes::from(out))
            }
            Self::Caching(reader) => reader.read(n).await,
        }
    }

    pub async fn seek(&mut self, to: SeekFrom) -> Result<u64> {
        match self {
            Self::Buffered { data, pos } => {
                let target = resolve_seek(*pos as u64, Some(data.len() as u64), to)?;
                *pos = usize::try_from(target).unwrap_or(usize::MAX).min(data.len());
                Ok(*pos as u64)
            }
            Self::Stream { .. } => Err(FsError::NotSupported("seek on a non-seekable stream")),
            Self::Caching(reader) => reader.seek(to).await,
        }
    }

    pub fn tell(&self) -> u64 {
        match self {
            Self::Buffered { pos, .. } => *pos as u64,
            Self::Stream { pos, .. } => *pos,
            Self::Caching(reader) => reader.pos as u64,
        }
    }

    pub fn eof(&self) -> bool {
        match self {
            Self::Buffered { data, pos } => *pos >= data.len(),
            Self::Stream { eof, .. } => *eof,
            Self::Caching(reader) => reader.eof(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn stream(data: &'static [u8]) -> ObjectBody {
        ObjectBody::Stream(Box::pin(Cursor::new(data)))
    }

    #[tokio::test]
    async fn test_buffered_read_and_seek() {
        let mut h = ReadHandle::new(ObjectBody::Buffered(Bytes::from_static(b"abcdef")), false);
        assert_eq!(&h.read(4).await.unwrap()[..], b"abcd");
        assert_eq!(h.seek(SeekFrom::End(-1)).await.unwrap(), 5);
        assert_eq!(&h.read(10).await.unwrap()[..], b"f");
        assert!(h.eof());
        assert!(h.read(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_is_forward_only() {
        let mut h = ReadHandle::new(stream(b"hello world"), false);
        assert!(!h.is_seekable());
        assert_eq!(&h.read(5).await.unwrap()[..], b"hello");
        assert!(matches!(
            h.seek(SeekFrom::Start(0)).await,
            Err(FsError::NotSupported(_))
        ));
        assert_eq!(&h.read(100).await.unwrap()[..], b" world");
        assert!(h.eof());
        assert_eq!(h.tell(), 11);
    }

    #[tokio::test]
    async fn test_caching_reader_seeks_backwards_and_from_end() {
        let mut h = ReadHandle::new(stream(b"0123456789"), true);
        assert!(h.is_seekable());
        assert_eq!(&h.read(3).await.unwrap()[..], b"012");
        assert_eq!(h.seek(SeekFrom::Start(1)).await.unwrap(), 1);
        assert_eq!(&h.read(2).await.unwrap()[..], b"12");
        assert_eq!(h.seek(SeekFrom::Current(4)).await.unwrap(), 7);
        assert_eq!(&h.read(1).await.unwrap()[..], b"7");
        assert_eq!(h.seek(SeekFrom::End(-2)).await.unwrap(), 8);
        assert_eq!(&h.read(5).await.unwrap()[..], b"89");
        assert!(h.eof());
    }

    #[tokio::test]
    async fn test_caching_reader_unbounded_read_after_offset() {
        let mut h = ReadHandle::new(stream(b"0123456789"), true);
        assert_eq!(&h.read(3).await.unwrap()[..], b"012");
        assert_eq!(&h.read(usize::MAX).await.unwrap()[..], b"3456789");
        assert_eq!(h.tell(), 10);
        assert!(h.eof());
        assert!(h.read(usize::MAX).await.unwrap().is_empty());
        assert_eq!(h.tell(), 10);
    }
}
