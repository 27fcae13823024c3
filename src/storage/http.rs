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

//! Read-only HTTP storage backend. `list` is derived from a fetched
//! `_meta/manifest.json`; every mutating operation fails with
//! [`Error::ReadOnly`]. Stat results are cached keyed by path; the cache is
//! cleared whenever the auth token changes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use chrono::Utc;
use reqwest::Client;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::Error;
use crate::error::Result;
use crate::storage::Backend;
use crate::storage::ListOptions;
use crate::storage::ListResult;
use crate::storage::Stat;
use crate::storage::WriteOptions;
use crate::storage::WriteOutcome;
use crate::storage::validate_path;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

#[derive(Debug)]
pub struct HttpBackend {
    base_url: String,
    token: Mutex<Option<String>>,
    client: Client,
    timeout: Duration,
    stat_cache: Mutex<HashMap<String, Stat>>,
}

#[derive(Deserialize)]
struct ManifestFile {
    size: u64,
    #[serde(rename = "modifiedAt")]
    modified_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct ManifestDoc {
    files: HashMap<String, ManifestFile>,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: Mutex::new(None),
            client: Client::new(),
            timeout: DEFAULT_TIMEOUT,
            stat_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the bearer auth token, clearing the stat cache (per-token cache
    /// invalidation named in the spec).
    pub fn set_token(&self, token: Option<String>) {
        *self.token.lock().unwrap() = token;
        self.stat_cache.lock().unwrap().clear();
    }

    fn url_for(&self, path: &str) -> Result<String> {
        validate_path(path)?;
        Ok(format!("{}/{}", self.base_url.trim_end_matches('/'), path))
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, url).timeout(self.timeout);
        if let Some(token) = self.token.lock().unwrap().clone() {
            req = req.bearer_auth(token);
        }
        req
    }

    fn map_status(status: StatusCode) -> Error {
        match status {
            StatusCode::NOT_FOUND => Error::NotFound(status.to_string()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Error::PermissionDenied(status.to_string())
            }
            _ => Error::Network(format!("unexpected status {status}")),
        }
    }

    fn map_transport_err(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Network(format!(
                "request exceeded configured timeout of {:?}",
                self.timeout
            ))
        } else if err.status().map(|s| s.is_server_error()).unwrap_or(false) {
            Error::Network(err.to_string())
        } else {
            Error::Network(err.to_string())
        }
    }

    async fn fetch_manifest(&self) -> Result<ManifestDoc> {
        let url = self.url_for("_meta/manifest.json")?;
        let resp = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .map_err(|e| self.map_transport_err(e))?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status()));
        }
        resp.json().await.map_err(|e| self.map_transport_err(e))
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &str {
        "http-readonly"
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        let url = self.url_for(path)?;
        let resp = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .map_err(|e| self.map_transport_err(e))?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status()));
        }
        resp.bytes().await.map_err(|e| self.map_transport_err(e))
    }

    async fn read_range(&self, path: &str, start: i64, end: i64) -> Result<Bytes> {
        let (start, end) = if end < 0 {
            let stat = self
                .stat(path)
                .await?
                .ok_or_else(|| Error::NotFound(path.to_string()))?;
            let size = stat.size as i64;
            (
                if start < 0 { size + start } else { start },
                size + end,
            )
        } else {
            (start, end)
        };
        if start >= end {
            return Ok(Bytes::new());
        }
        let url = self.url_for(path)?;
        // HTTP Range headers are inclusive-end; convert from our half-open
        // interval.
        let range_header = format!("bytes={}-{}", start, end - 1);
        let resp = self
            .request(reqwest::Method::GET, &url)
            .header(reqwest::header::RANGE, range_header)
            .send()
            .await
            .map_err(|e| self.map_transport_err(e))?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status()));
        }
        resp.bytes().await.map_err(|e| self.map_transport_err(e))
    }

    async fn stat(&self, path: &str) -> Result<Option<Stat>> {
        validate_path(path)?;
        if let Some(cached) = self.stat_cache.lock().unwrap().get(path).cloned() {
            return Ok(Some(cached));
        }
        let url = self.url_for(path)?;
        let resp = self
            .request(reqwest::Method::HEAD, &url)
            .send()
            .await
            .map_err(|e| self.map_transport_err(e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status()));
        }
        let size = resp
            .content_length()
            .ok_or_else(|| Error::Network("missing Content-Length".to_string()))?;
        let mtime = resp
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let etag = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let stat = Stat {
            size,
            mtime,
            etag,
            content_type: resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            metadata: None,
        };
        self.stat_cache
            .lock()
            .unwrap()
            .insert(path.to_string(), stat.clone());
        Ok(Some(stat))
    }

    async fn write(&self, _path: &str, _data: Bytes, _opts: WriteOptions) -> Result<WriteOutcome> {
        Err(Error::ReadOnly)
    }

    async fn write_atomic(
        &self,
        _path: &str,
        _data: Bytes,
        _opts: WriteOptions,
    ) -> Result<WriteOutcome> {
        Err(Error::ReadOnly)
    }

    async fn append(&self, _path: &str, _data: Bytes) -> Result<u64> {
        Err(Error::ReadOnly)
    }

    async fn delete(&self, _path: &str) -> Result<()> {
        Err(Error::ReadOnly)
    }

    async fn delete_prefix(&self, _prefix: &str) -> Result<u64> {
        Err(Error::ReadOnly)
    }

    async fn list(&self, prefix: &str, opts: ListOptions) -> Result<ListResult> {
        validate_path(prefix)?;
        let manifest = self.fetch_manifest().await?;
        let mut files: Vec<String> = manifest
            .files
            .keys()
            .filter(|p| p.starts_with(prefix))
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
        let stats = if opts.include_metadata {
            Some(
                page.iter()
                    .filter_map(|p| {
                        manifest.files.get(p).map(|f| {
                            (
                                p.clone(),
                                Stat {
                                    size: f.size,
                                    mtime: f.modified_at,
                                    etag: None,
                                    content_type: None,
                                    metadata: None,
                                },
                            )
                        })
                    })
                    .collect(),
            )
        } else {
            None
        };
        Ok(ListResult {
            files: page,
            has_more,
            cursor: has_more.then(|| end.to_string()),
            prefixes: None,
            stats,
        })
    }
}
