//! Object store adapter (cAdapter)
//!
//! Submodules:
//! - `client`: the `ObjectBackend` trait and the logging `ObjectClient` used by the vfs layer
//! - `s3`: S3-compatible backend
//! - `localfs`: local directory backend, used as a mock store
//! - `memory`: in-memory backend with call counters and fault injection
//!
//! Absence of an object is reported as a value. Backends map vendor faults to
//! `FsError`; retries are left to the SDK.
pub mod client;
pub mod localfs;
pub mod memory;
pub mod s3;
