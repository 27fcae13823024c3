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

//! Ambient configuration for a [`crate::db::Database`] instance. Every field
//! has a spec-mandated or otherwise documented default so that
//! `Config::default()` alone is enough to open a database.

use std::time::Duration;

use crate::sync::manifest::ConflictStrategy;

/// Default per-operation timeout for sync lock acquisition and phases (§4.7).
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Default event-segment capacity before a namespace rolls to a new segment
/// file (§4.2 names "bounded size" without a constant; this is ours).
pub const DEFAULT_SEGMENT_CAPACITY: usize = 1_000;

#[derive(Debug, Clone)]
pub struct Config {
    pub segment_capacity: usize,
    /// Per-operation timeout applied to `Database::push`/`pull`/`sync` when
    /// building their default [`crate::sync::engine::SyncOptions`] (§4.7).
    pub sync_timeout: Duration,
    pub default_conflict_strategy: ConflictStrategy,
    /// Retry budget for transient lock contention during sync lease
    /// acquisition, per §7's "recovered locally" error class.
    pub max_transient_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segment_capacity: DEFAULT_SEGMENT_CAPACITY,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            default_conflict_strategy: ConflictStrategy::Manual,
            max_transient_retries: 3,
        }
    }
}
