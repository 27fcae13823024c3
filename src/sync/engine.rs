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

//! The Sync Engine (C7): push, pull and bidirectional sync over two
//! [`Backend`]s, coordinated by the §4.7 lock protocol and reported through
//! an optional progress callback.

pub use crate::sync::manifest::ConflictStrategy;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use indexmap::IndexMap;

use crate::error::Error;
use crate::error::Result;
use crate::storage::Backend;
use crate::storage::WriteOptions as StorageWriteOptions;
use crate::sync::lock::Lease;
use crate::sync::manifest;
use crate::sync::manifest::FileEntry;
use crate::sync::manifest::Manifest;
use crate::sync::manifest::Visibility;
use crate::sync::manifest::MANIFEST_PATH;

/// `{operation, total, processed, currentFile?}`, reported at every phase
/// transition.
#[derive(Debug, Clone)]
pub struct Progress {
    pub operation: Phase,
    pub total: usize,
    pub processed: usize,
    pub current_file: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Scanning,
    ComputingDiff,
    Uploading,
    Downloading,
    WritingManifest,
}

pub type ProgressCallback<'a> = dyn Fn(Progress) + Send + Sync + 'a;

/// One per-file failure, collected rather than aborting the whole
/// operation (§7: "batched in a result").
#[derive(Debug, Clone)]
pub struct SyncFileError {
    pub path: String,
    pub operation: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub success: bool,
    pub uploaded: Vec<String>,
    pub downloaded: Vec<String>,
    pub conflicts_pending: Vec<String>,
    pub errors: Vec<SyncFileError>,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub database_id: String,
    pub owner: String,
    pub conflict_strategy: ConflictStrategy,
    pub dry_run: bool,
    pub timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            database_id: "default".to_string(),
            owner: "local".to_string(),
            conflict_strategy: ConflictStrategy::Manual,
            dry_run: false,
            timeout: crate::config::DEFAULT_SYNC_TIMEOUT,
        }
    }
}

pub struct SyncEngine {
    local: Arc<dyn Backend>,
    remote: Arc<dyn Backend>,
    max_retries: u32,
}

impl SyncEngine {
    pub fn new(local: Arc<dyn Backend>, remote: Arc<dyn Backend>) -> Self {
        Self { local, remote, max_retries: 0 }
    }

    /// Sets the transient-lock-contention retry budget applied to lease
    /// acquisition in [`SyncEngine::push`]/[`SyncEngine::pull`]/
    /// [`SyncEngine::sync`] (§7). `Database` threads `Config::
    /// max_transient_retries` through here.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    async fn load_manifest(backend: &Arc<dyn Backend>) -> Result<Option<Manifest>> {
        match backend.read(MANIFEST_PATH).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }

    async fn write_manifest(
        backend: &Arc<dyn Backend>,
        database_id: &str,
        files: IndexMap<String, FileEntry>,
    ) -> Result<()> {
        let existing = Self::load_manifest(backend).await?;
        let manifest = Manifest {
            version: 1,
            database_id: database_id.to_string(),
            name: existing.as_ref().map(|m| m.name.clone()).unwrap_or_else(|| database_id.to_string()),
            visibility: existing.map(|m| m.visibility).unwrap_or(Visibility::Private),
            last_synced_at: Utc::now(),
            files,
        };
        let bytes = bytes::Bytes::from(serde_json::to_vec_pretty(&manifest)?);
        backend.write_atomic(MANIFEST_PATH, bytes, StorageWriteOptions::default()).await?;
        Ok(())
    }

    async fn remote_files(&self) -> Result<IndexMap<String, FileEntry>> {
        Ok(Self::load_manifest(&self.remote).await?.map(|m| m.files).unwrap_or_default())
    }

    /// Uploads every local file the diff names, applying the given
    /// conflict strategy to resolve conflicting entries first.
    pub async fn push(
        &self,
        opts: &SyncOptions,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Result<SyncResult> {
        let lease_local =
            Lease::acquire_with_retry(self.local.clone(), &opts.database_id, &opts.owner, self.max_retries)
                .await?;
        let lease_remote_result =
            Lease::acquire_with_retry(self.remote.clone(), &opts.database_id, &opts.owner, self.max_retries)
                .await;
        let lease_remote = match lease_remote_result {
            Ok(l) => l,
            Err(err) => {
                let _ = lease_local.release().await;
                return Err(err);
            }
        };

        let result = with_timeout(opts.timeout, self.push_locked(opts, on_progress)).await;

        let _ = lease_local.release().await;
        let _ = lease_remote.release().await;
        result
    }

    async fn push_locked(
        &self,
        opts: &SyncOptions,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Result<SyncResult> {
        tracing::debug!(database_id = %opts.database_id, "push starting");
        report(on_progress, Phase::Scanning, 0, 0, None);
        let local_files = manifest::build(self.local.as_ref()).await?;
        let remote_files = self.remote_files().await?;

        report(on_progress, Phase::ComputingDiff, 0, 0, None);
        let diff = manifest::diff(&local_files, &remote_files, opts.conflict_strategy);

        if opts.dry_run {
            return Ok(SyncResult {
                success: true,
                uploaded: Vec::new(),
                downloaded: Vec::new(),
                conflicts_pending: diff.conflicts,
                errors: Vec::new(),
            });
        }

        let mut result = SyncResult::default();
        let total = diff.to_upload.len();
        for (i, path) in diff.to_upload.iter().enumerate() {
            report(on_progress, Phase::Uploading, total, i, Some(path.clone()));
            match self.local.read(path).await {
                Ok(bytes) => {
                    if let Err(err) =
                        self.remote.write_atomic(path, bytes, StorageWriteOptions::default()).await
                    {
                        result.errors.push(SyncFileError {
                            path: path.clone(),
                            operation: "upload".to_string(),
                            error: err.to_string(),
                        });
                        continue;
                    }
                    result.uploaded.push(path.clone());
                }
                Err(err) => {
                    result.errors.push(SyncFileError {
                        path: path.clone(),
                        operation: "upload".to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }

        report(on_progress, Phase::WritingManifest, 0, 0, None);
        let fresh_local = manifest::build(self.local.as_ref()).await?;
        Self::write_manifest(&self.local, &opts.database_id, fresh_local.clone()).await?;
        Self::write_manifest(&self.remote, &opts.database_id, fresh_local).await?;

        result.conflicts_pending = diff.conflicts;
        result.success = result.errors.is_empty();
        Ok(result)
    }

    /// Downloads every remote file the diff names. Requires a remote
    /// manifest to already exist.
    pub async fn pull(
        &self,
        opts: &SyncOptions,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Result<SyncResult> {
        if Self::load_manifest(&self.remote).await?.is_none() {
            return Ok(SyncResult {
                success: false,
                errors: vec![SyncFileError {
                    path: MANIFEST_PATH.to_string(),
                    operation: "pull".to_string(),
                    error: "Remote manifest not found".to_string(),
                }],
                ..Default::default()
            });
        }

        let lease_local =
            Lease::acquire_with_retry(self.local.clone(), &opts.database_id, &opts.owner, self.max_retries)
                .await?;
        let lease_remote_result =
            Lease::acquire_with_retry(self.remote.clone(), &opts.database_id, &opts.owner, self.max_retries)
                .await;
        let lease_remote = match lease_remote_result {
            Ok(l) => l,
            Err(err) => {
                let _ = lease_local.release().await;
                return Err(err);
            }
        };

        let result = with_timeout(opts.timeout, self.pull_locked(opts, on_progress)).await;

        let _ = lease_local.release().await;
        let _ = lease_remote.release().await;
        result
    }

    async fn pull_locked(
        &self,
        opts: &SyncOptions,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Result<SyncResult> {
        tracing::debug!(database_id = %opts.database_id, "pull starting");
        report(on_progress, Phase::Scanning, 0, 0, None);
        let local_files = manifest::build(self.local.as_ref()).await?;
        let remote_files = self.remote_files().await?;

        report(on_progress, Phase::ComputingDiff, 0, 0, None);
        let diff = manifest::diff(&local_files, &remote_files, opts.conflict_strategy);

        if opts.dry_run {
            return Ok(SyncResult {
                success: true,
                conflicts_pending: diff.conflicts,
                ..Default::default()
            });
        }

        let mut result = SyncResult::default();
        let total = diff.to_download.len();
        for (i, path) in diff.to_download.iter().enumerate() {
            report(on_progress, Phase::Downloading, total, i, Some(path.clone()));
            match self.remote.read(path).await {
                Ok(bytes) => {
                    if let Err(err) =
                        self.local.write_atomic(path, bytes, StorageWriteOptions::default()).await
                    {
                        result.errors.push(SyncFileError {
                            path: path.clone(),
                            operation: "download".to_string(),
                            error: err.to_string(),
                        });
                        continue;
                    }
                    result.downloaded.push(path.clone());
                }
                Err(err) => {
                    result.errors.push(SyncFileError {
                        path: path.clone(),
                        operation: "download".to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }

        report(on_progress, Phase::WritingManifest, 0, 0, None);
        let fresh_local = manifest::build(self.local.as_ref()).await?;
        Self::write_manifest(&self.local, &opts.database_id, fresh_local.clone()).await?;
        Self::write_manifest(&self.remote, &opts.database_id, fresh_local).await?;

        result.conflicts_pending = diff.conflicts;
        result.success = result.errors.is_empty();
        Ok(result)
    }

    /// Bidirectional sync: diffs once, uploads `toUpload`, downloads
    /// `toDownload`, and applies the conflict strategy to `conflicts`. In
    /// `Manual` strategy, conflicts are left in `conflictsPending`.
    pub async fn sync(
        &self,
        opts: &SyncOptions,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Result<SyncResult> {
        let lease_local =
            Lease::acquire_with_retry(self.local.clone(), &opts.database_id, &opts.owner, self.max_retries)
                .await?;
        let lease_remote_result =
            Lease::acquire_with_retry(self.remote.clone(), &opts.database_id, &opts.owner, self.max_retries)
                .await;
        let lease_remote = match lease_remote_result {
            Ok(l) => l,
            Err(err) => {
                let _ = lease_local.release().await;
                return Err(err);
            }
        };

        let result = with_timeout(opts.timeout, self.sync_locked(opts, on_progress)).await;

        let _ = lease_local.release().await;
        let _ = lease_remote.release().await;
        result
    }

    async fn sync_locked(
        &self,
        opts: &SyncOptions,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Result<SyncResult> {
        tracing::debug!(database_id = %opts.database_id, strategy = ?opts.conflict_strategy, "sync starting");
        report(on_progress, Phase::Scanning, 0, 0, None);
        let local_files = manifest::build(self.local.as_ref()).await?;
        let remote_files = self.remote_files().await?;

        report(on_progress, Phase::ComputingDiff, 0, 0, None);
        let diff = manifest::diff(&local_files, &remote_files, opts.conflict_strategy);

        if opts.dry_run {
            return Ok(SyncResult {
                success: true,
                conflicts_pending: diff.conflicts,
                ..Default::default()
            });
        }

        let mut result = SyncResult::default();

        let upload_total = diff.to_upload.len();
        for (i, path) in diff.to_upload.iter().enumerate() {
            report(on_progress, Phase::Uploading, upload_total, i, Some(path.clone()));
            self.transfer(&self.local, &self.remote, path, "upload", &mut result.uploaded, &mut result.errors)
                .await;
        }

        let download_total = diff.to_download.len();
        for (i, path) in diff.to_download.iter().enumerate() {
            report(on_progress, Phase::Downloading, download_total, i, Some(path.clone()));
            self.transfer(
                &self.remote,
                &self.local,
                path,
                "download",
                &mut result.downloaded,
                &mut result.errors,
            )
            .await;
        }

        report(on_progress, Phase::WritingManifest, 0, 0, None);
        let fresh_local = manifest::build(self.local.as_ref()).await?;
        Self::write_manifest(&self.local, &opts.database_id, fresh_local.clone()).await?;
        Self::write_manifest(&self.remote, &opts.database_id, fresh_local).await?;

        result.conflicts_pending = diff.conflicts;
        result.success = result.errors.is_empty();
        Ok(result)
    }

    async fn transfer(
        &self,
        from: &Arc<dyn Backend>,
        to: &Arc<dyn Backend>,
        path: &str,
        operation: &str,
        succeeded: &mut Vec<String>,
        errors: &mut Vec<SyncFileError>,
    ) {
        match from.read(path).await {
            Ok(bytes) => match to.write_atomic(path, bytes, StorageWriteOptions::default()).await {
                Ok(_) => succeeded.push(path.to_string()),
                Err(err) => errors.push(SyncFileError {
                    path: path.to_string(),
                    operation: operation.to_string(),
                    error: err.to_string(),
                }),
            },
            Err(err) => errors.push(SyncFileError {
                path: path.to_string(),
                operation: operation.to_string(),
                error: err.to_string(),
            }),
        }
    }
}

/// Bounds a locked push/pull/sync body by `opts.timeout`, surfacing
/// `Error::Timeout` if it doesn't finish in time (§4.7).
async fn with_timeout<F>(timeout: Duration, fut: F) -> Result<SyncResult>
where
    F: std::future::Future<Output = Result<SyncResult>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(timeout)),
    }
}

fn report(
    callback: Option<&ProgressCallback<'_>>,
    operation: Phase,
    total: usize,
    processed: usize,
    current_file: Option<String>,
) {
    if let Some(cb) = callback {
        cb(Progress { operation, total, processed, current_file });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryBackend;
    use bytes::Bytes;
    use chrono::TimeZone;

    fn opts() -> SyncOptions {
        SyncOptions { conflict_strategy: ConflictStrategy::Newest, ..Default::default() }
    }

    #[tokio::test]
    async fn push_then_pull_leaves_both_sides_synced() {
        let local = Arc::new(MemoryBackend::new());
        let remote = Arc::new(MemoryBackend::new());
        local.write_atomic("a.txt", Bytes::from_static(b"hello"), StorageWriteOptions::default())
            .await
            .unwrap();
        let engine = SyncEngine::new(local.clone(), remote.clone());
        let push_result = engine.push(&opts(), None).await.unwrap();
        assert!(push_result.success);
        assert_eq!(push_result.uploaded, vec!["a.txt".to_string()]);

        remote
            .write_atomic("b.txt", Bytes::from_static(b"world"), StorageWriteOptions::default())
            .await
            .unwrap();
        // Remote's manifest needs to reflect b.txt for pull to see it.
        let remote_files = manifest::build(remote.as_ref()).await.unwrap();
        SyncEngine::write_manifest(&remote, "default", remote_files).await.unwrap();

        let engine = SyncEngine::new(local.clone(), remote.clone());
        let pull_result = engine.pull(&opts(), None).await.unwrap();
        assert!(pull_result.success);
        assert_eq!(pull_result.downloaded, vec!["b.txt".to_string()]);

        let local_manifest = SyncEngine::load_manifest(&local).await.unwrap().unwrap();
        let remote_manifest = SyncEngine::load_manifest(&remote).await.unwrap().unwrap();
        assert_eq!(local_manifest.files.len(), remote_manifest.files.len());
    }

    #[tokio::test]
    async fn pull_without_remote_manifest_reports_error() {
        let local = Arc::new(MemoryBackend::new());
        let remote = Arc::new(MemoryBackend::new());
        let engine = SyncEngine::new(local, remote);
        let result = engine.pull(&opts(), None).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.errors[0].error, "Remote manifest not found");
    }

    #[tokio::test]
    async fn sync_with_newest_strategy_downloads_remote_winner() {
        let local = Arc::new(MemoryBackend::new());
        let remote = Arc::new(MemoryBackend::new());

        let older = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let newer = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();

        local
            .write_atomic(
                "f.txt",
                Bytes::from_static(b"local-version"),
                StorageWriteOptions { mtime: Some(older), ..Default::default() },
            )
            .await
            .unwrap();
        remote
            .write_atomic(
                "f.txt",
                Bytes::from_static(b"remote-version"),
                StorageWriteOptions { mtime: Some(newer), ..Default::default() },
            )
            .await
            .unwrap();
        let remote_files = manifest::build(remote.as_ref()).await.unwrap();
        SyncEngine::write_manifest(&remote, "default", remote_files).await.unwrap();

        let engine = SyncEngine::new(local.clone(), remote.clone());
        let result = engine.sync(&opts(), None).await.unwrap();
        assert_eq!(result.downloaded, vec!["f.txt".to_string()]);
        assert!(result.uploaded.is_empty());

        let local_bytes = local.read("f.txt").await.unwrap();
        assert_eq!(&local_bytes[..], b"remote-version");
    }
}
