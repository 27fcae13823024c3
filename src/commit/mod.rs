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

//! The Commit DAG (C5): content-addressed [`Commit`] snapshots and
//! bidirectional-BFS ancestor search, in [`dag`].

pub mod dag;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;

/// Per-collection summary stored in a [`Commit`]'s state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionState {
    pub data_hash: String,
    pub schema_hash: String,
    pub row_count: u64,
}

/// Relationship-index summary.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RelationshipsState {
    pub forward_hash: String,
    pub reverse_hash: String,
}

/// The event log position a commit was taken at — the natural snapshot
/// marker for bounding future replay length (§9).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventLogPosition {
    pub segment_id: u64,
    pub offset: u64,
}

/// A full snapshot of database state at commit time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DatabaseState {
    pub collections: IndexMap<String, CollectionState>,
    pub relationships: RelationshipsState,
    pub event_log_position: EventLogPosition,
}

/// A content-addressed, immutable snapshot. `hash` is the SHA-256 of every
/// other field in canonical form; recomputed and checked on every load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    pub parents: Vec<String>,
    pub timestamp: i64,
    pub author: String,
    pub message: String,
    pub state: DatabaseState,
}

/// The subset of [`Commit`]'s fields that go into its content hash — every
/// field except `hash` itself.
#[derive(Serialize)]
struct Hashable<'a> {
    parents: &'a [String],
    timestamp: i64,
    author: &'a str,
    message: &'a str,
    state: &'a DatabaseState,
}

impl Commit {
    pub fn content_hash(&self) -> Result<String, serde_json::Error> {
        crate::content_hash::content_hash(&Hashable {
            parents: &self.parents,
            timestamp: self.timestamp,
            author: &self.author,
            message: &self.message,
            state: &self.state,
        })
    }
}

pub const DEFAULT_AUTHOR: &str = "anonymous";
