// Copyright 2024 The StratumDB Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The storage abstraction (C1): a uniform byte-oriented interface over a
//! path namespace, implemented by [`local::LocalBackend`],
//! [`memory::MemoryBackend`] and the read-only [`http::HttpBackend`].

pub mod http;
pub mod local;
pub mod memory;

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use chrono::Utc;

use crate::error::Error;
use crate::error::Result;

/// Rejects absolute paths and `..` traversal; storage paths are always
/// relative, forward-slash-separated strings.
pub fn validate_path(path: &str) -> Result<()> {
    if path.starts_with('/') {
        return Err(Error::Validation(format!(
            "storage path must not start with '/': {path}"
        )));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(Error::Validation(format!(
            "storage path must not contain '..': {path}"
        )));
    }
    Ok(())
}

/// Metadata about a stored blob, as returned by [`Backend::stat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub etag: Option<String>,
    pub content_type: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
}

/// Options accepted by [`Backend::write`] / [`Backend::write_atomic`].
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Fails the write if any blob already exists at the path. The only
    /// value currently recognized is `"*"`, mirroring the HTTP
    /// `If-None-Match` convention named in the spec.
    pub if_none_match: Option<String>,
    /// Fails the write unless the stored blob's current etag matches
    /// exactly.
    pub if_match: Option<String>,
    pub content_type: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
    /// Explicit mtime to stamp the write with, honored by backends that can
    /// (the in-memory backend always honors it; it is required for
    /// `newest`-strategy sync tests to be deterministic).
    pub mtime: Option<DateTime<Utc>>,
}

/// Result of a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub etag: String,
    pub size: u64,
}

/// Paging and filtering options for [`Backend::list`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    pub delimiter: Option<String>,
    pub include_metadata: bool,
}

/// Result of [`Backend::list`].
#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub files: Vec<String>,
    pub has_more: bool,
    pub cursor: Option<String>,
    pub prefixes: Option<Vec<String>>,
    pub stats: Option<HashMap<String, Stat>>,
}

/// Resolves a half-open `[start, end)` byte range against a blob of `size`
/// bytes. Negative `start`/`end` are interpreted as offsets from the end
/// (suffix mode), per the spec's `readRange` contract. Returns `(start,
/// end)` clamped to `[0, size]`, with `start <= end` always holding (an
/// out-of-order or empty range collapses to an empty slice rather than an
/// error).
pub fn resolve_range(size: u64, start: i64, end: i64) -> (u64, u64) {
    let size_i = size as i64;
    let resolve = |v: i64| -> i64 {
        if v < 0 {
            (size_i + v).max(0)
        } else {
            v.min(size_i)
        }
    };
    let resolved_start = resolve(start) as u64;
    let resolved_end = resolve(end) as u64;
    if resolved_start >= resolved_end {
        (resolved_start.min(size), resolved_start.min(size))
    } else {
        (resolved_start, resolved_end)
    }
}

/// The polymorphic storage interface. Every mutating operation on a
/// read-only backend (see [`http::HttpBackend`]) fails with
/// [`Error::ReadOnly`].
#[async_trait]
pub trait Backend: Any + Send + Sync + Debug {
    /// A short, stable name for diagnostics.
    fn name(&self) -> &str;

    /// Whether this backend rejects mutating operations.
    fn read_only(&self) -> bool {
        false
    }

    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Half-open byte range read. `start`/`end` may be negative (suffix
    /// offset from the end of the blob). Returns an empty slice when the
    /// resolved range is empty rather than erroring.
    async fn read_range(&self, path: &str, start: i64, end: i64) -> Result<Bytes>;

    async fn stat(&self, path: &str) -> Result<Option<Stat>>;

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.stat(path).await?.is_some())
    }

    async fn write(&self, path: &str, data: Bytes, opts: WriteOptions) -> Result<WriteOutcome>;

    /// Like [`Backend::write`], but guarantees that concurrent readers never
    /// observe partial content: the new bytes become visible atomically.
    async fn write_atomic(
        &self,
        path: &str,
        data: Bytes,
        opts: WriteOptions,
    ) -> Result<WriteOutcome>;

    /// Writes only if the blob's current etag equals `expected_etag`
    /// (`None` meaning "must not currently exist").
    async fn write_conditional(
        &self,
        path: &str,
        data: Bytes,
        expected_etag: Option<&str>,
    ) -> Result<WriteOutcome> {
        let opts = match expected_etag {
            None => WriteOptions {
                if_none_match: Some("*".to_string()),
                ..Default::default()
            },
            Some(etag) => WriteOptions {
                if_match: Some(etag.to_string()),
                ..Default::default()
            },
        };
        self.write_atomic(path, data, opts).await
    }

    async fn append(&self, path: &str, data: Bytes) -> Result<u64>;

    async fn delete(&self, path: &str) -> Result<()>;

    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    async fn list(&self, prefix: &str, opts: ListOptions) -> Result<ListResult>;

    async fn mkdir(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        self.delete_prefix(path).await.map(|_| ())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let data = self.read(from).await?;
        self.write_atomic(to, data, WriteOptions::default())
            .await?;
        Ok(())
    }

    async fn move_(&self, from: &str, to: &str) -> Result<()> {
        self.copy(from, to).await?;
        self.delete(from).await
    }
}

impl dyn Backend {
    /// Returns a reference to the concrete implementation type, mirroring
    /// the downcast escape hatch offered for trait objects elsewhere in the
    /// crate.
    pub fn downcast_ref<T: Backend>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_absolute_and_traversal_paths() {
        assert!(validate_path("a/b.json").is_ok());
        assert!(validate_path("/a/b.json").is_err());
        assert!(validate_path("a/../b.json").is_err());
    }

    #[test]
    fn range_suffix_mode() {
        assert_eq!(resolve_range(1024, 1024 - 8, 1024), (1016, 1024));
        assert_eq!(resolve_range(1024, -8, 1024), (1016, 1024));
        assert_eq!(resolve_range(1024, 0, 1024), (0, 1024));
    }

    #[test]
    fn range_empty_when_start_at_or_past_end() {
        assert_eq!(resolve_range(100, 50, 50), (50, 50));
        assert_eq!(resolve_range(100, 60, 50), (60, 60));
    }
}
