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

//! Commit persistence ([`CommitStore`]) and graph queries: bidirectional-BFS
//! [`find_common_ancestor`], [`find_all_common_ancestors`], [`is_ancestor`].
//!
//! Traversal avoids recursion by construction (mandatory per §9) and is
//! expressed entirely over `hash -> parents` lookups, so it works the same
//! whether those lookups come from a cold [`CommitStore`] or a warm
//! [`AncestorCache`].

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use bytes::Bytes;
use itertools::Itertools;

use crate::commit::Commit;
use crate::commit::DatabaseState;
use crate::commit::DEFAULT_AUTHOR;
use crate::error::Error;
use crate::error::Result;
use crate::storage::Backend;
use crate::storage::WriteOptions as StorageWriteOptions;

fn commit_path(hash: &str) -> String {
    format!("_meta/commits/{hash}.json")
}

#[derive(Debug, Clone, Default)]
pub struct CreateCommitOptions {
    pub message: String,
    pub author: Option<String>,
    pub parents: Vec<String>,
}

#[derive(Debug)]
pub struct CommitStore {
    backend: Arc<dyn Backend>,
}

impl CommitStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Builds and hashes a new commit; does not persist it (see
    /// [`CommitStore::save`]).
    pub fn create(&self, state: DatabaseState, opts: CreateCommitOptions) -> Result<Commit> {
        let mut commit = Commit {
            hash: String::new(),
            parents: opts.parents,
            timestamp: chrono::Utc::now().timestamp_millis(),
            author: opts.author.unwrap_or_else(|| DEFAULT_AUTHOR.to_string()),
            message: opts.message,
            state,
        };
        commit.hash = commit.content_hash()?;
        Ok(commit)
    }

    /// Writes `commit` to `_meta/commits/<hash>.json` with atomic
    /// replacement.
    pub async fn save(&self, commit: &Commit) -> Result<()> {
        let bytes = Bytes::from(serde_json::to_vec_pretty(commit)?);
        self.backend
            .write_atomic(&commit_path(&commit.hash), bytes, StorageWriteOptions::default())
            .await?;
        Ok(())
    }

    /// Reads and parses a commit, then re-hashes its loaded fields,
    /// failing with `HASH_MISMATCH` on any discrepancy (protects against
    /// silent corruption or tampering).
    pub async fn load(&self, hash: &str) -> Result<Commit> {
        let bytes = self.backend.read(&commit_path(hash)).await?;
        let commit: Commit = serde_json::from_slice(&bytes)?;
        let recomputed = commit.content_hash()?;
        if recomputed != commit.hash {
            return Err(Error::HashMismatch {
                path: commit_path(hash),
                expected: commit.hash.clone(),
                computed: recomputed,
            });
        }
        Ok(commit)
    }

    async fn parents_of(&self, hash: &str) -> Result<Vec<String>> {
        Ok(self.load(hash).await?.parents)
    }
}

/// `(hash -> parents)` cache plus a not-found set, shared across
/// [`find_common_ancestor`] calls when `memoize: true` (§4.5). Both grow
/// monotonically.
#[derive(Debug, Default, Clone)]
pub struct AncestorCache {
    inner: Arc<Mutex<AncestorCacheInner>>,
}

#[derive(Debug, Default)]
struct AncestorCacheInner {
    parents: HashMap<String, Vec<String>>,
    not_found: HashSet<String>,
}

impl AncestorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every cached parent lookup, e.g. on database shutdown.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.parents.clear();
        inner.not_found.clear();
    }
}

async fn parents_cached(
    store: &CommitStore,
    cache: Option<&AncestorCache>,
    hash: &str,
) -> Result<Option<Vec<String>>> {
    if let Some(cache) = cache {
        let inner = cache.inner.lock().unwrap();
        if let Some(parents) = inner.parents.get(hash) {
            return Ok(Some(parents.clone()));
        }
        if inner.not_found.contains(hash) {
            return Ok(None);
        }
    }
    match store.parents_of(hash).await {
        Ok(parents) => {
            if let Some(cache) = cache {
                cache.inner.lock().unwrap().parents.insert(hash.to_string(), parents.clone());
            }
            Ok(Some(parents))
        }
        Err(Error::NotFound(_)) => {
            if let Some(cache) = cache {
                cache.inner.lock().unwrap().not_found.insert(hash.to_string());
            }
            Ok(None)
        }
        Err(other) => Err(other),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FindAncestorOptions {
    pub max_depth: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AncestorResult {
    pub ancestor: Option<String>,
    pub depth_from_commit1: u32,
    pub depth_from_commit2: u32,
    pub commits_traversed: u64,
}

/// Bidirectional BFS for the nearest common ancestor of `a` and `b`.
/// Expands the smaller frontier one hop at a time; whenever an expansion
/// discovers a hash already visited by the other side, that hash is the
/// answer. Caps expansion depth at `opts.max_depth` when set.
pub async fn find_common_ancestor(
    store: &CommitStore,
    a: &str,
    b: &str,
    opts: FindAncestorOptions,
    cache: Option<&AncestorCache>,
) -> Result<AncestorResult> {
    if a == b {
        return Ok(AncestorResult {
            ancestor: Some(a.to_string()),
            depth_from_commit1: 0,
            depth_from_commit2: 0,
            commits_traversed: 0,
        });
    }

    let mut visited1: HashMap<String, u32> = HashMap::from([(a.to_string(), 0)]);
    let mut visited2: HashMap<String, u32> = HashMap::from([(b.to_string(), 0)]);
    let mut frontier1: VecDeque<String> = VecDeque::from([a.to_string()]);
    let mut frontier2: VecDeque<String> = VecDeque::from([b.to_string()]);
    let mut traversed: HashSet<String> = HashSet::from([a.to_string(), b.to_string()]);
    let mut depth1 = 0u32;
    let mut depth2 = 0u32;

    loop {
        if frontier1.is_empty() && frontier2.is_empty() {
            return Ok(AncestorResult {
                ancestor: None,
                depth_from_commit1: depth1,
                depth_from_commit2: depth2,
                commits_traversed: traversed.len() as u64,
            });
        }

        let expand_first = match (frontier1.len(), frontier2.len()) {
            (0, _) => false,
            (_, 0) => true,
            (l1, l2) => l1 <= l2,
        };

        let (frontier, visited, other_visited, depth) = if expand_first {
            depth1 += 1;
            (&mut frontier1, &mut visited1, &visited2, depth1)
        } else {
            depth2 += 1;
            (&mut frontier2, &mut visited2, &visited1, depth2)
        };

        if let Some(max_depth) = opts.max_depth {
            if depth > max_depth {
                return Ok(AncestorResult {
                    ancestor: None,
                    depth_from_commit1: depth1,
                    depth_from_commit2: depth2,
                    commits_traversed: traversed.len() as u64,
                });
            }
        }

        let current_hop: Vec<String> = frontier.drain(..).collect();
        for hash in current_hop {
            let Some(parents) = parents_cached(store, cache, &hash).await? else {
                continue;
            };
            for parent in parents {
                if visited.contains_key(&parent) {
                    continue;
                }
                visited.insert(parent.clone(), depth);
                traversed.insert(parent.clone());
                if let Some(&other_depth) = other_visited.get(&parent) {
                    let (d1, d2) = if expand_first { (depth, other_depth) } else { (other_depth, depth) };
                    return Ok(AncestorResult {
                        ancestor: Some(parent),
                        depth_from_commit1: d1,
                        depth_from_commit2: d2,
                        commits_traversed: traversed.len() as u64,
                    });
                }
                frontier.push_back(parent);
            }
        }
    }
}

/// Every minimal common ancestor of `a` and `b` — a common ancestor none of
/// whose descendants is also a common ancestor. Used to detect criss-cross
/// merges with more than one merge base.
pub async fn find_all_common_ancestors(store: &CommitStore, a: &str, b: &str) -> Result<Vec<String>> {
    let ancestors_of = |start: String| {
        let store = store;
        async move {
            let mut seen = HashSet::new();
            let mut queue = VecDeque::from([start]);
            while let Some(hash) = queue.pop_front() {
                if !seen.insert(hash.clone()) {
                    continue;
                }
                for parent in store.parents_of(&hash).await? {
                    queue.push_back(parent);
                }
            }
            Result::<HashSet<String>>::Ok(seen)
        }
    };
    let ancestors_a = ancestors_of(a.to_string()).await?;
    let ancestors_b = ancestors_of(b.to_string()).await?;
    let common: HashSet<String> = ancestors_a.intersection(&ancestors_b).cloned().collect();

    let mut minimal = Vec::new();
    for candidate in &common {
        let mut is_minimal = true;
        for other in &common {
            if other == candidate {
                continue;
            }
            if is_ancestor(store, candidate, other).await? && !is_ancestor(store, other, candidate).await? {
                is_minimal = false;
                break;
            }
        }
        if is_minimal {
            minimal.push(candidate.clone());
        }
    }
    Ok(minimal.into_iter().sorted().collect())
}

/// True iff `x` is reachable from `y` by following parent edges
/// (reflexive: `is_ancestor(x, x) == true`).
pub async fn is_ancestor(store: &CommitStore, x: &str, y: &str) -> Result<bool> {
    if x == y {
        return Ok(true);
    }
    let mut queue = VecDeque::from([y.to_string()]);
    let mut seen = HashSet::new();
    while let Some(hash) = queue.pop_front() {
        if !seen.insert(hash.clone()) {
            continue;
        }
        let parents = store.parents_of(&hash).await?;
        if parents.iter().any(|p| p == x) {
            return Ok(true);
        }
        queue.extend(parents);
    }
    Ok(false)
}
