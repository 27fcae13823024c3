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

//! [`Database`]: the facade that wires a [`Backend`] to the event log,
//! entity store and commit DAG, and exposes [`Database::sync`] against a
//! second backend. Every public operation documented in the other modules
//! is reachable from here; this is the crate's one entry point.

use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;

use crate::commit::Commit;
use crate::commit::DatabaseState;
use crate::commit::dag::AncestorCache;
use crate::commit::dag::CommitStore;
use crate::commit::dag::CreateCommitOptions;
use crate::config::Config;
use crate::entity::Entity;
use crate::entity::EntityId;
use crate::entity::store::EntityStore;
use crate::entity::store::FilterEvaluator;
use crate::entity::store::ReadOptions;
use crate::entity::store::WriteOptions;
use crate::entity::update_spec::UpdateSpec;
use crate::error::Result;
use crate::eventlog::Event;
use crate::eventlog::EventFilter;
use crate::eventlog::Page;
use crate::eventlog::codec::Codec;
use crate::eventlog::codec::JsonCodec;
use crate::eventlog::log::EventLog;
use crate::storage::Backend;
use crate::sync::engine::ProgressCallback;
use crate::sync::engine::SyncEngine;
use crate::sync::engine::SyncOptions;
use crate::sync::engine::SyncResult;
use crate::timetravel;
use crate::timetravel::DiffResult;

/// An open database bound to a single [`Backend`]. Cheap to clone
/// internally (every field is `Arc`-backed); callers typically hold one
/// instance per process per database.
pub struct Database {
    backend: Arc<dyn Backend>,
    config: Config,
    log: Arc<EventLog>,
    entities: EntityStore,
    commits: CommitStore,
    ancestor_cache: AncestorCache,
}

impl Database {
    /// Opens a database against `backend` with the given config. Does not
    /// perform any I/O itself — the event index is populated lazily as
    /// events are appended or read back through time-travel queries.
    pub fn open(backend: Arc<dyn Backend>, config: Config) -> Self {
        let codec: Arc<dyn Codec> = Arc::new(JsonCodec);
        let log = Arc::new(EventLog::new(backend.clone(), codec, config.segment_capacity));
        let entities = EntityStore::new(log.clone());
        let commits = CommitStore::new(backend.clone());
        Self {
            backend,
            config,
            log,
            entities,
            commits,
            ancestor_cache: AncestorCache::new(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // -- Entities (§3, §4.3) -------------------------------------------

    pub async fn create(&self, ns: &str, data: Entity, opts: WriteOptions) -> Result<Entity> {
        self.entities.create(ns, data, opts).await
    }

    pub async fn get(&self, id: &EntityId, opts: ReadOptions) -> Result<Option<Entity>> {
        self.entities.get(id, opts).await
    }

    pub async fn find(
        &self,
        ns: &str,
        filter: &dyn FilterEvaluator,
        opts: ReadOptions,
    ) -> Result<Vec<Entity>> {
        self.entities.find(ns, filter, opts).await
    }

    pub async fn update(&self, id: &EntityId, update: &UpdateSpec, opts: WriteOptions) -> Result<Entity> {
        self.entities.update(id, update, opts).await
    }

    pub async fn delete(&self, id: &EntityId, opts: WriteOptions) -> Result<()> {
        self.entities.delete(id, opts).await
    }

    // -- Time travel (§4.4) ---------------------------------------------

    pub async fn revert(&self, id: &EntityId, t: DateTime<Utc>, opts: WriteOptions) -> Result<Entity> {
        self.entities.revert(id, t, opts).await
    }

    pub fn history(&self, id: &EntityId, filter: EventFilter) -> Page<Event> {
        timetravel::history(&self.log, id, filter)
    }

    pub fn diff(&self, id: &EntityId, t1: DateTime<Utc>, t2: DateTime<Utc>) -> Result<DiffResult> {
        timetravel::diff(&self.log, id, t1, t2)
    }

    // -- Event log (§4.2) -------------------------------------------------

    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.log
    }

    /// Waits until every event appended strictly before this call is
    /// durable. Part of the orderly-shutdown sequence in [`Database::dispose`].
    pub async fn flush(&self) -> Result<()> {
        self.log.flush().await
    }

    // -- Commits (C5) -----------------------------------------------------

    pub fn commit_store(&self) -> &CommitStore {
        &self.commits
    }

    /// Builds, hashes and persists a new commit snapshotting `state`.
    pub async fn commit(&self, state: DatabaseState, opts: CreateCommitOptions) -> Result<Commit> {
        let commit = self.commits.create(state, opts)?;
        self.commits.save(&commit).await?;
        Ok(commit)
    }

    pub async fn load_commit(&self, hash: &str) -> Result<Commit> {
        self.commits.load(hash).await
    }

    pub async fn find_common_ancestor(
        &self,
        a: &str,
        b: &str,
        opts: crate::commit::dag::FindAncestorOptions,
    ) -> Result<crate::commit::dag::AncestorResult> {
        crate::commit::dag::find_common_ancestor(&self.commits, a, b, opts, Some(&self.ancestor_cache)).await
    }

    pub async fn find_all_common_ancestors(&self, a: &str, b: &str) -> Result<Vec<String>> {
        crate::commit::dag::find_all_common_ancestors(&self.commits, a, b).await
    }

    pub async fn is_ancestor(&self, x: &str, y: &str) -> Result<bool> {
        crate::commit::dag::is_ancestor(&self.commits, x, y).await
    }

    // -- Sync (C7) --------------------------------------------------------

    /// A [`SyncOptions`] defaulted from this database's [`Config`] (sync
    /// timeout, default conflict strategy) rather than `SyncOptions`'s own
    /// hardcoded defaults — callers that only want to override
    /// `database_id`/`owner`/`dry_run` should start from this instead of
    /// `SyncOptions::default()`.
    pub fn default_sync_options(&self) -> SyncOptions {
        SyncOptions {
            conflict_strategy: self.config.default_conflict_strategy,
            timeout: self.config.sync_timeout,
            ..SyncOptions::default()
        }
    }

    fn sync_engine(&self, remote: Arc<dyn Backend>) -> SyncEngine {
        SyncEngine::new(self.backend.clone(), remote).with_max_retries(self.config.max_transient_retries)
    }

    /// Pushes local changes to `remote`, per §4.7.
    pub async fn push(
        &self,
        remote: Arc<dyn Backend>,
        opts: &SyncOptions,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Result<SyncResult> {
        self.sync_engine(remote).push(opts, on_progress).await
    }

    /// Pulls remote changes from `remote`, per §4.7.
    pub async fn pull(
        &self,
        remote: Arc<dyn Backend>,
        opts: &SyncOptions,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Result<SyncResult> {
        self.sync_engine(remote).pull(opts, on_progress).await
    }

    /// Bidirectionally syncs against `remote`, per §4.7.
    pub async fn sync(
        &self,
        remote: Arc<dyn Backend>,
        opts: &SyncOptions,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Result<SyncResult> {
        self.sync_engine(remote).sync(opts, on_progress).await
    }

    /// Orderly shutdown (§9 "Global state"): flushes pending events so
    /// nothing queued is lost, then drops the in-process ancestor cache.
    /// Held sync locks are scoped to the sync calls themselves and are
    /// always released there, so there is nothing left for `dispose` to
    /// release.
    pub async fn dispose(self) -> Result<()> {
        self.log.flush().await?;
        self.ancestor_cache.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryBackend;
    use serde_json::json;

    fn db() -> Database {
        Database::open(Arc::new(MemoryBackend::new()), Config::default())
    }

    #[tokio::test]
    async fn create_get_update_delete_round_trip() {
        let db = db();
        let mut data = Entity::new();
        data.insert("title".to_string(), json!("hello"));
        let created = db.create("posts", data, WriteOptions::default()).await.unwrap();
        let id = EntityId::from_string(created.get("$id").unwrap().as_str().unwrap()).unwrap();

        let spec = UpdateSpec::new().set("title", json!("world"));
        let updated = db.update(&id, &spec, WriteOptions::default()).await.unwrap();
        assert_eq!(updated.get("title"), Some(&json!("world")));

        db.delete(&id, WriteOptions::default()).await.unwrap();
        assert!(db.get(&id, ReadOptions::default()).await.unwrap().is_none());
        db.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn commit_round_trips_through_store() {
        let db = db();
        let commit = db
            .commit(DatabaseState::default(), CreateCommitOptions { message: "init".to_string(), ..Default::default() })
            .await
            .unwrap();
        let loaded = db.load_commit(&commit.hash).await.unwrap();
        assert_eq!(loaded.hash, commit.hash);
    }
}
