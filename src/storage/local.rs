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

//! Local-filesystem storage backend. Writes go through a same-directory
//! [`tempfile::NamedTempFile`] that is fsynced and then renamed into place,
//! so concurrent readers never observe partial content.

use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use chrono::Utc;
use tempfile::NamedTempFile;

use crate::content_hash::sha256_hex;
use crate::error::Error;
use crate::error::Result;
use crate::storage::Backend;
use crate::storage::ListOptions;
use crate::storage::ListResult;
use crate::storage::Stat;
use crate::storage::WriteOptions;
use crate::storage::WriteOutcome;
use crate::storage::resolve_range;
use crate::storage::validate_path;

#[derive(Debug)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn full_path(&self, path: &str) -> Result<PathBuf> {
        validate_path(path)?;
        Ok(self.root.join(path))
    }

    fn stat_sync(path: &Path) -> std::io::Result<Option<Stat>> {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        let mtime: DateTime<Utc> = meta.modified()?.into();
        let bytes = fs::read(path)?;
        Ok(Some(Stat {
            size: meta.len(),
            mtime,
            etag: Some(sha256_hex(&bytes)),
            content_type: None,
            metadata: None,
        }))
    }
}

fn map_io_err(err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound(err.to_string())
    } else {
        Error::Internal(err.to_string())
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        let full = self.full_path(path)?;
        let bytes = tokio::task::spawn_blocking(move || fs::read(&full))
            .await
            .map_err(|err| Error::Internal(err.to_string()))?
            .map_err(map_io_err)?;
        Ok(Bytes::from(bytes))
    }

    async fn read_range(&self, path: &str, start: i64, end: i64) -> Result<Bytes> {
        let bytes = self.read(path).await?;
        let (s, e) = resolve_range(bytes.len() as u64, start, end);
        Ok(bytes.slice(s as usize..e as usize))
    }

    async fn stat(&self, path: &str) -> Result<Option<Stat>> {
        let full = self.full_path(path)?;
        tokio::task::spawn_blocking(move || Self::stat_sync(&full))
            .await
            .map_err(|err| Error::Internal(err.to_string()))?
            .map_err(map_io_err)
    }

    async fn write(&self, path: &str, data: Bytes, opts: WriteOptions) -> Result<WriteOutcome> {
        self.write_atomic(path, data, opts).await
    }

    async fn write_atomic(
        &self,
        path: &str,
        data: Bytes,
        opts: WriteOptions,
    ) -> Result<WriteOutcome> {
        let full = self.full_path(path)?;
        let path_owned = path.to_string();
        let etag = sha256_hex(&data);
        let size = data.len() as u64;
        let mtime = opts.mtime;
        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent).map_err(map_io_err)?;
            }
            let mut temp = NamedTempFile::new_in(full.parent().unwrap()).map_err(map_io_err)?;
            temp.write_all(&data).map_err(map_io_err)?;
            temp.as_file().sync_data().map_err(map_io_err)?;

            // The none-match and etag-match checks happen here, immediately
            // before the write that makes them true, with no `.await` (and
            // therefore no other task's interleaved write) in between.
            let file = if opts.if_none_match.is_some() {
                // A hard link fails atomically with AlreadyExists if `full`
                // is already occupied, unlike `persist`, which overwrites
                // unconditionally — so two concurrent none-match writers can
                // never both succeed.
                match fs::hard_link(temp.path(), &full) {
                    Ok(()) => {
                        let file = fs::File::open(&full).map_err(map_io_err)?;
                        let _ = temp.close();
                        file
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                        return Err(Error::Conflict(format!("{path_owned} already exists")));
                    }
                    Err(err) => return Err(map_io_err(err)),
                }
            } else {
                if let Some(expected) = &opts.if_match {
                    match Self::stat_sync(&full).map_err(map_io_err)? {
                        Some(stat) if stat.etag.as_deref() == Some(expected.as_str()) => {}
                        _ => return Err(Error::Conflict(format!("etag mismatch for {path_owned}"))),
                    }
                }
                temp.persist(&full).map_err(|e| map_io_err(e.error))?
            };
            if let Some(mtime) = mtime {
                let ft = filetime_from(mtime);
                let _ = file.set_modified(ft);
            }
            Ok(())
        })
        .await
        .map_err(|err| Error::Internal(err.to_string()))??;
        Ok(WriteOutcome { etag, size })
    }

    async fn append(&self, path: &str, data: Bytes) -> Result<u64> {
        let full = self.full_path(path)?;
        tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&full)?;
            file.write_all(&data)?;
            Ok(file.metadata()?.len())
        })
        .await
        .map_err(|err| Error::Internal(err.to_string()))?
        .map_err(map_io_err)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.full_path(path)?;
        tokio::task::spawn_blocking(move || match fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        })
        .await
        .map_err(|err| Error::Internal(err.to_string()))?
        .map_err(map_io_err)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let listed = self.list(prefix, ListOptions::default()).await?;
        let mut count = 0;
        for file in listed.files {
            self.delete(&file).await?;
            count += 1;
        }
        Ok(count)
    }

    async fn list(&self, prefix: &str, opts: ListOptions) -> Result<ListResult> {
        validate_path(prefix)?;
        let root = self.root.clone();
        let prefix_owned = prefix.to_string();
        let mut files: Vec<String> = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<String>> {
            let mut out = Vec::new();
            let walk_root = root.join(&prefix_owned);
            if !walk_root.exists() {
                return Ok(out);
            }
            let mut stack = vec![walk_root];
            while let Some(dir) = stack.pop() {
                for entry in fs::read_dir(&dir)? {
                    let entry = entry?;
                    let path = entry.path();
                    if path.is_dir() {
                        stack.push(path);
                    } else {
                        let rel = path.strip_prefix(&root).unwrap();
                        out.push(rel.to_string_lossy().replace('\\', "/"));
                    }
                }
            }
            Ok(out)
        })
        .await
        .map_err(|err| Error::Internal(err.to_string()))?
        .map_err(map_io_err)?;
        files.sort();
        let total = files.len();
        let start = opts
            .cursor
            .as_deref()
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        let limit = opts.limit.unwrap_or(total);
        let end = (start + limit).min(total);
        let page = files[start.min(total)..end].to_vec();
        let has_more = end < total;
        Ok(ListResult {
            files: page,
            has_more,
            cursor: has_more.then(|| end.to_string()),
            prefixes: None,
            stats: None,
        })
    }
}

fn filetime_from(dt: DateTime<Utc>) -> std::time::SystemTime {
    std::time::UNIX_EPOCH + std::time::Duration::from_millis(dt.timestamp_millis().max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        (dir, backend)
    }

    #[tokio::test]
    async fn round_trip_write_read() {
        let (_dir, backend) = backend();
        backend
            .write_atomic("a/b.json", Bytes::from_static(b"hello"), WriteOptions::default())
            .await
            .unwrap();
        let bytes = backend.read("a/b.json").await.unwrap();
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn range_read_matches_full_read_slice() {
        let (_dir, backend) = backend();
        let data: Vec<u8> = (0..1024u32).map(|i| (i % 256) as u8).collect();
        backend
            .write_atomic("t.bin", Bytes::from(data.clone()), WriteOptions::default())
            .await
            .unwrap();
        let tail = backend.read_range("t.bin", 1024 - 8, 1024).await.unwrap();
        assert_eq!(&tail[..], &data[1016..1024]);
        let full = backend.read_range("t.bin", 0, 1024).await.unwrap();
        assert_eq!(&full[..], &data[..]);
        let empty = backend.read_range("t.bin", 512, 512).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn conditional_write_conflict() {
        let (_dir, backend) = backend();
        backend
            .write_conditional("lock", Bytes::from_static(b"owner-a"), None)
            .await
            .unwrap();
        let err = backend
            .write_conditional("lock", Bytes::from_static(b"owner-b"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let (_dir, backend) = backend();
        let err = backend.read("../escape").await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }
}
