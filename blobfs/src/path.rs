//! Path resolver: turns `scheme://a/./b/../c` into a canonical [`VirtualPath`].
//!
//! Resolution is pure. The resolver memoises results per input string so hot
//! paths (stat, open) do not re-parse the same URI; the cache is owned by the
//! resolver instance and injected wherever it is needed.

use crate::error::{FsError, Result};
use moka::sync::Cache;
use std::fmt;

const SCHEME_SEPARATOR: &str = "://";

/// A resolved URI. `target` never has a leading slash, empty segments, `.` or
/// `..` segments.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VirtualPath {
    pub scheme: String,
    pub target: String,
}

impl VirtualPath {
    pub fn new(scheme: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            target: target.into(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.target.is_empty()
    }

    /// Parent of this path; the parent of a top level entry is `scheme://`.
    pub fn dirname(&self) -> VirtualPath {
        let parent = match self.target.rfind('/') {
            Some(idx) => &self.target[..idx],
            None => "",
        };
        VirtualPath::new(self.scheme.clone(), parent)
    }

    /// Last segment of the target, empty for the root.
    pub fn file_name(&self) -> &str {
        match self.target.rfind('/') {
            Some(idx) => &self.target[idx + 1..],
            None => &self.target,
        }
    }

    pub fn join(&self, name: &str) -> VirtualPath {
        let target = if self.target.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.target, name)
        };
        VirtualPath::new(self.scheme.clone(), target)
    }

    /// Number of characters in the target, as checked against the metadata
    /// key limit.
    pub fn target_len(&self) -> usize {
        self.target.chars().count()
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.scheme, SCHEME_SEPARATOR, self.target)
    }
}

/// Split and normalise a URI without consulting any cache.
pub fn resolve_uncached(uri: &str) -> Result<VirtualPath> {
    let (scheme, rest) = uri
        .split_once(SCHEME_SEPARATOR)
        .ok_or_else(|| FsError::InvalidUri(uri.to_string()))?;
    if scheme.is_empty() {
        return Err(FsError::InvalidUri(uri.to_string()));
    }

    let mut kept: Vec<&str> = Vec::new();
    for part in rest.split('/') {
        match part {
            "" | "." => {}
            // Excess `..` is ignored rather than reported, so a bad relative
            // reference cannot fail an unrelated call.
            ".." => {
                kept.pop();
            }
            seg => kept.push(seg),
        }
    }

    Ok(VirtualPath::new(scheme, kept.join("/")))
}

pub struct PathResolver {
    resolved: Cache<String, VirtualPath>,
}

impl PathResolver {
    pub fn new(capacity: u64) -> Self {
        Self {
            resolved: Cache::new(capacity),
        }
    }

    pub fn resolve(&self, uri: &str) -> Result<VirtualPath> {
        if let Some(hit) = self.resolved.get(uri) {
            return Ok(hit);
        }
        let path = resolve_uncached(uri)?;
        self.resolved.insert(uri.to_string(), path.clone());
        Ok(path)
    }
}

impl Default for PathResolver {
    fn default() -> Self {
        Self::new(10_000)
    }
}
