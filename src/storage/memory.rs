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

//! In-memory storage backend, mainly for tests and embedded single-process
//! use. `read` always returns an owned copy so callers cannot corrupt stored
//! bytes by mutating the returned buffer.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use chrono::Utc;

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

#[derive(Debug, Clone)]
struct Blob {
    data: Bytes,
    mtime: DateTime<Utc>,
    etag: String,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    blobs: Mutex<BTreeMap<String, Blob>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        validate_path(path)?;
        let blobs = self.blobs.lock().unwrap();
        blobs
            .get(path)
            .map(|b| b.data.clone())
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    async fn read_range(&self, path: &str, start: i64, end: i64) -> Result<Bytes> {
        let bytes = self.read(path).await?;
        let (s, e) = resolve_range(bytes.len() as u64, start, end);
        Ok(bytes.slice(s as usize..e as usize))
    }

    async fn stat(&self, path: &str) -> Result<Option<Stat>> {
        validate_path(path)?;
        let blobs = self.blobs.lock().unwrap();
        Ok(blobs.get(path).map(|b| Stat {
            size: b.data.len() as u64,
            mtime: b.mtime,
            etag: Some(b.etag.clone()),
            content_type: None,
            metadata: None,
        }))
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
        validate_path(path)?;
        let mut blobs = self.blobs.lock().unwrap();
        if opts.if_none_match.is_some() && blobs.contains_key(path) {
            return Err(Error::Conflict(format!("{path} already exists")));
        }
        if let Some(expected) = &opts.if_match {
            match blobs.get(path) {
                Some(blob) if &blob.etag == expected => {}
                _ => return Err(Error::Conflict(format!("etag mismatch for {path}"))),
            }
        }
        let etag = sha256_hex(&data);
        let size = data.len() as u64;
        let mtime = opts.mtime.unwrap_or_else(Utc::now);
        blobs.insert(
            path.to_string(),
            Blob {
                data,
                mtime,
                etag: etag.clone(),
            },
        );
        Ok(WriteOutcome { etag, size })
    }

    async fn append(&self, path: &str, data: Bytes) -> Result<u64> {
        validate_path(path)?;
        let mut blobs = self.blobs.lock().unwrap();
        let entry = blobs.entry(path.to_string()).or_insert_with(|| Blob {
            data: Bytes::new(),
            mtime: Utc::now(),
            etag: sha256_hex(b""),
        });
        let mut combined = Vec::with_capacity(entry.data.len() + data.len());
        combined.extend_from_slice(&entry.data);
        combined.extend_from_slice(&data);
        entry.data = Bytes::from(combined);
        entry.mtime = Utc::now();
        entry.etag = sha256_hex(&entry.data);
        Ok(entry.data.len() as u64)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        self.blobs.lock().unwrap().remove(path);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        validate_path(prefix)?;
        let mut blobs = self.blobs.lock().unwrap();
        let to_remove: Vec<String> = blobs
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &to_remove {
            blobs.remove(key);
        }
        Ok(to_remove.len() as u64)
    }

    async fn list(&self, prefix: &str, opts: ListOptions) -> Result<ListResult> {
        validate_path(prefix)?;
        let blobs = self.blobs.lock().unwrap();
        let mut files: Vec<String> = blobs
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_returns_owned_copy() {
        let backend = MemoryBackend::new();
        backend
            .write_atomic("p", Bytes::from_static(b"abc"), WriteOptions::default())
            .await
            .unwrap();
        let mut copy = backend.read("p").await.unwrap().to_vec();
        copy[0] = b'z';
        let fresh = backend.read("p").await.unwrap();
        assert_eq!(&fresh[..], b"abc");
    }

    #[tokio::test]
    async fn mtime_is_preserved_when_supplied() {
        let backend = MemoryBackend::new();
        let ts = DateTime::parse_from_rfc3339("2024-01-02T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        backend
            .write_atomic(
                "p",
                Bytes::from_static(b"abc"),
                WriteOptions {
                    mtime: Some(ts),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let stat = backend.stat("p").await.unwrap().unwrap();
        assert_eq!(stat.mtime, ts);
    }

    #[tokio::test]
    async fn append_grows_blob() {
        let backend = MemoryBackend::new();
        backend.append("log", Bytes::from_static(b"a\n")).await.unwrap();
        backend.append("log", Bytes::from_static(b"b\n")).await.unwrap();
        let bytes = backend.read("log").await.unwrap();
        assert_eq!(&bytes[..], b"a\nb\n");
    }
}
