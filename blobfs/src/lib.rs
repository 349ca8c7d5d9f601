//! blobfs: POSIX-like file streams, directories and metadata over object storage.

pub mod cadapter;
pub mod config;
pub mod error;
pub mod meta;
pub mod path;
pub mod vfs;

pub use error::{FsError, Result};
pub use vfs::{BlobFs, BlobStream, DirIterator, FileStat, FsOptions};
