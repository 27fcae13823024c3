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

//! The Sync Manifest (C6): per-database file index and the pure
//! local/remote diff function.
//!
//! [`diff`] performs no I/O by construction (§9: "the single decision
//! point, MUST NOT perform I/O, so it is property-testable in isolation").

use chrono::DateTime;
use chrono::Utc;
use futures::StreamExt;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;

use crate::content_hash::sha256_hex;
use crate::error::Result;
use crate::storage::Backend;
use crate::storage::ListOptions;

pub const MANIFEST_PATH: &str = "_meta/manifest.json";

/// Per-file manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub hash: String,
    #[serde(rename = "hashAlgorithm")]
    pub hash_algorithm: String,
    #[serde(rename = "modifiedAt")]
    pub modified_at: DateTime<Utc>,
}

/// The persisted `_meta/manifest.json` document (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    #[serde(rename = "databaseId")]
    pub database_id: String,
    pub name: String,
    pub visibility: Visibility,
    #[serde(rename = "lastSyncedAt")]
    pub last_synced_at: DateTime<Utc>,
    pub files: IndexMap<String, FileEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Public,
}

/// Returns true if `path` should be excluded from the manifest: the
/// manifest file itself, transient locks, or a dot-directory segment.
fn is_excluded(path: &str) -> bool {
    if path == MANIFEST_PATH {
        return true;
    }
    if path.starts_with("_meta/locks/") {
        return true;
    }
    path.split('/').any(|segment| {
        segment.starts_with(".git")
            || segment == ".DS_Store"
            || segment == "node_modules"
            || (segment.starts_with('.') && !segment.is_empty())
    })
}

/// How many files this process hashes concurrently while building a
/// manifest; bounds backend request fan-out on large trees.
const HASH_CONCURRENCY: usize = 8;

/// Enumerates every retained path on `backend` and computes its manifest
/// entry. Hashing is I/O-bound (one `read` + one `stat` per file), so
/// entries within a page are computed concurrently.
pub async fn build(backend: &dyn Backend) -> Result<IndexMap<String, FileEntry>> {
    let mut files = IndexMap::new();
    let mut cursor = None;
    loop {
        let page = backend
            .list("", ListOptions { cursor: cursor.clone(), ..Default::default() })
            .await?;
        let retained: Vec<&String> = page.files.iter().filter(|p| !is_excluded(p)).collect();
        let entries: Vec<Result<(String, FileEntry)>> = futures::stream::iter(retained)
            .map(|path| async move {
                let bytes = backend.read(path).await?;
                let stat = backend
                    .stat(path)
                    .await?
                    .ok_or_else(|| crate::error::Error::internal(format!("listed but missing: {path}")))?;
                Ok((
                    path.clone(),
                    FileEntry {
                        path: path.clone(),
                        size: bytes.len() as u64,
                        hash: sha256_hex(&bytes),
                        hash_algorithm: "sha256".to_string(),
                        modified_at: stat.mtime,
                    },
                ))
            })
            .buffer_unordered(HASH_CONCURRENCY)
            .collect()
            .await;
        for entry in entries {
            let (path, file_entry) = entry?;
            files.insert(path, file_entry);
        }
        if !page.has_more {
            break;
        }
        cursor = page.cursor;
    }
    Ok(files)
}

/// The three-way diff result of comparing a local and remote manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    pub to_upload: Vec<String>,
    pub to_download: Vec<String>,
    pub conflicts: Vec<String>,
}

impl Diff {
    pub fn is_synced(&self) -> bool {
        self.to_upload.is_empty() && self.to_download.is_empty() && self.conflicts.is_empty()
    }
}

/// A strategy selector for resolving entries present on both sides with
/// differing hashes. `Newest`/`LocalWins`/`RemoteWins` move the conflict
/// into `to_upload`/`to_download` instead of `conflicts`; `Manual` leaves it
/// in `conflicts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStrategy {
    LocalWins,
    RemoteWins,
    Newest,
    Manual,
}

/// Pure diff of `local` against `remote`. Performs no I/O.
pub fn diff(
    local: &IndexMap<String, FileEntry>,
    remote: &IndexMap<String, FileEntry>,
    strategy: ConflictStrategy,
) -> Diff {
    let mut result = Diff::default();
    let mut paths: Vec<&String> = local.keys().chain(remote.keys()).collect();
    paths.sort();
    paths.dedup();

    for path in paths {
        match (local.get(path), remote.get(path)) {
            (Some(_), None) => result.to_upload.push(path.clone()),
            (None, Some(_)) => result.to_download.push(path.clone()),
            (Some(l), Some(r)) if l.hash != r.hash => classify(path, l, r, strategy, &mut result),
            _ => {}
        }
    }
    result
}

fn classify(
    path: &str,
    local: &FileEntry,
    remote: &FileEntry,
    strategy: ConflictStrategy,
    result: &mut Diff,
) {
    match strategy {
        ConflictStrategy::LocalWins => result.to_upload.push(path.to_string()),
        ConflictStrategy::RemoteWins => result.to_download.push(path.to_string()),
        ConflictStrategy::Newest => {
            // Strict inequality: an exact millisecond tie stays pending
            // rather than picking a side, matching the scenario this spec
            // names as its tie-break example.
            if local.modified_at > remote.modified_at {
                result.to_upload.push(path.to_string());
            } else if remote.modified_at > local.modified_at {
                result.to_download.push(path.to_string());
            } else {
                result.conflicts.push(path.to_string());
            }
        }
        ConflictStrategy::Manual => result.conflicts.push(path.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(hash: &str, millis: i64) -> FileEntry {
        FileEntry {
            path: "f".to_string(),
            size: 1,
            hash: hash.to_string(),
            hash_algorithm: "sha256".to_string(),
            modified_at: Utc.timestamp_millis_opt(millis).unwrap(),
        }
    }

    #[test]
    fn local_only_file_is_uploaded() {
        let mut local = IndexMap::new();
        local.insert("f".to_string(), entry("h1", 0));
        let remote = IndexMap::new();
        let d = diff(&local, &remote, ConflictStrategy::Manual);
        assert_eq!(d.to_upload, vec!["f".to_string()]);
        assert!(d.to_download.is_empty());
    }

    #[test]
    fn newest_strategy_strict_inequality_ties_remain_conflicts() {
        let mut local = IndexMap::new();
        local.insert("f".to_string(), entry("h1", 100));
        let mut remote = IndexMap::new();
        remote.insert("f".to_string(), entry("h2", 100));
        let d = diff(&local, &remote, ConflictStrategy::Newest);
        assert_eq!(d.conflicts, vec!["f".to_string()]);
    }

    #[test]
    fn newest_strategy_picks_later_remote() {
        let mut local = IndexMap::new();
        local.insert("f".to_string(), entry("h1", 100));
        let mut remote = IndexMap::new();
        remote.insert("f".to_string(), entry("h2", 200));
        let d = diff(&local, &remote, ConflictStrategy::Newest);
        assert_eq!(d.to_download, vec!["f".to_string()]);
        assert!(d.to_upload.is_empty());
        assert!(d.conflicts.is_empty());
    }

    #[test]
    fn identical_manifests_are_synced() {
        let mut local = IndexMap::new();
        local.insert("f".to_string(), entry("h1", 100));
        let remote = local.clone();
        let d = diff(&local, &remote, ConflictStrategy::Manual);
        assert!(d.is_synced());
    }
}
