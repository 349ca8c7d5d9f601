//! VFS layer (virtual filesystem)
//!
//! Maps POSIX-like operations onto an object store that has no directories,
//! no rename and no append.
//!
//! Submodules:
//! - `fs`: the `BlobFs` facade (stat, mkdir, rmdir, unlink, rename, opendir, ...)
//! - `stream`: `BlobStream`, one open handle with its write/append state machine
//! - `upload`: buffered single-put / multipart upload pipe
//! - `reader`: download handles, including the seekable caching wrapper
//! - `dir`: `DirIterator` over delimiter listings
//! - `stat`: `FileStat` and mode bits
//! - `mime`: content type by file extension
pub mod dir;
pub mod fs;
pub mod mime;
pub mod reader;
pub mod stat;
pub mod stream;
pub mod upload;

pub use dir::DirIterator;
pub use fs::{BlobFs, FsOptions};
pub use stat::{FileStat, FileType};
pub use stream::{BlobStream, OpenMode, OpenOptions};
