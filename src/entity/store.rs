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

//! The Entity Store (C3): the materialized, event-sourced read model keyed
//! by [`EntityId`].

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use chrono::DateTime;
use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::OwnedMutexGuard;

use crate::entity::Entity;
use crate::entity::EntityId;
use crate::entity::new_entity;
use crate::entity::reserved;
use crate::entity::update_spec;
use crate::entity::update_spec::UpdateSpec;
use crate::entity::version_of;
use crate::error::Error;
use crate::error::Result;
use crate::eventlog::Event;
use crate::eventlog::Op;
use crate::eventlog::log::EventLog;

/// Evaluates whether a materialized entity matches a caller-supplied
/// predicate. The external filter evaluator (§6) is out of core scope; this
/// trait is the seam it plugs into. Any `Fn(&Entity) -> bool` implements it.
pub trait FilterEvaluator: Send + Sync {
    fn matches(&self, entity: &Entity) -> bool;
}

impl<F> FilterEvaluator for F
where
    F: Fn(&Entity) -> bool + Send + Sync,
{
    fn matches(&self, entity: &Entity) -> bool {
        self(entity)
    }
}

/// Options accepted by read operations.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub actor: Option<EntityId>,
}

#[derive(Debug, Default)]
struct CurrentState {
    /// Alive entities only; removed entirely on DELETE.
    alive: indexmap::IndexMap<EntityId, Entity>,
    /// Every id ever allocated, alive or tombstoned — CREATE refuses to
    /// reuse one (§4.3 state machine).
    known_ids: HashSet<EntityId>,
}

/// Per-entity async mutexes, acquired for the full read-compute-append-write
/// sequence of a mutation so two concurrent calls targeting the same id
/// serialize rather than racing across the `append` await point. Entries are
/// created lazily and never evicted; a long-lived process accumulates one
/// entry per id ever mutated, traded here for not needing a second pass to
/// decide when an id's lock is safe to drop.
#[derive(Debug, Default)]
struct EntityLocks {
    locks: Mutex<HashMap<EntityId, Arc<AsyncMutex<()>>>>,
}

impl EntityLocks {
    async fn lock(&self, id: &EntityId) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap();
            locks.entry(id.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
        };
        mutex.lock_owned().await
    }
}

#[derive(Debug)]
pub struct EntityStore {
    log: Arc<EventLog>,
    state: RwLock<CurrentState>,
    entity_locks: EntityLocks,
}

impl EntityStore {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self { log, state: RwLock::new(CurrentState::default()), entity_locks: EntityLocks::default() }
    }

    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.log
    }

    /// Allocates an id within `ns`, emits a CREATE event, and returns the
    /// new entity.
    pub async fn create(
        &self,
        ns: &str,
        mut data: Entity,
        opts: WriteOptions,
    ) -> Result<Entity> {
        let id = loop {
            let candidate = EntityId::new(ns, &self.log.next_id());
            if !self.state.read().unwrap().known_ids.contains(&candidate) {
                break candidate;
            }
        };
        let type_name = data
            .shift_remove(reserved::TYPE)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| ns.to_string());
        let after = new_entity(&id, &type_name, data);

        let event = Event {
            id: self.log.next_id(),
            ts: self.log.next_ts(),
            op: Op::Create,
            target: id.clone(),
            actor: opts.actor,
            before: None,
            after: Some(after.clone()),
            mutation: None,
            metadata: None,
        };
        self.log.append(vec![event]).await?;

        let mut state = self.state.write().unwrap();
        state.known_ids.insert(id.clone());
        state.alive.insert(id, after.clone());
        Ok(after)
    }

    /// Reads the current (or, with `asOf`, historical) state of `id`.
    /// Returns `Ok(None)` for a missing or tombstoned-at-that-time entity.
    pub async fn get(&self, id: &EntityId, opts: ReadOptions) -> Result<Option<Entity>> {
        match opts.as_of {
            None => Ok(self.state.read().unwrap().alive.get(id).cloned()),
            Some(t) => crate::timetravel::as_of(&self.log, id, t),
        }
    }

    /// Scans every currently-alive entity in `ns` matching `filter`. With
    /// `asOf` set, scans every id ever known in `ns` and replays each at `t`
    /// instead, since an entity alive at `t` may no longer be alive now (or
    /// vice versa).
    pub async fn find(
        &self,
        ns: &str,
        filter: &dyn FilterEvaluator,
        opts: ReadOptions,
    ) -> Result<Vec<Entity>> {
        match opts.as_of {
            None => {
                let state = self.state.read().unwrap();
                Ok(state
                    .alive
                    .iter()
                    .filter(|(id, _)| id.namespace() == ns)
                    .map(|(_, entity)| entity.clone())
                    .filter(|entity| filter.matches(entity))
                    .collect())
            }
            Some(t) => {
                let ids: Vec<EntityId> = {
                    let state = self.state.read().unwrap();
                    state.known_ids.iter().filter(|id| id.namespace() == ns).cloned().collect()
                };
                let mut results = Vec::new();
                for id in ids {
                    if let Some(entity) = crate::timetravel::as_of(&self.log, &id, t)? {
                        if filter.matches(&entity) {
                            results.push(entity);
                        }
                    }
                }
                Ok(results)
            }
        }
    }

    /// Applies `update` to the current state of `id`, emitting an UPDATE
    /// event with the computed `before`/`after` pair.
    pub async fn update(
        &self,
        id: &EntityId,
        update: &UpdateSpec,
        opts: WriteOptions,
    ) -> Result<Entity> {
        let _guard = self.entity_locks.lock(id).await;
        let before = self
            .state
            .read()
            .unwrap()
            .alive
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let mut after = update_spec::apply(&before, update, false)?;
        let next_version = version_of(&before) + 1;
        after.insert(crate::entity::reserved::VERSION.to_string(), serde_json::Value::from(next_version));

        let event = Event {
            id: self.log.next_id(),
            ts: self.log.next_ts(),
            op: Op::Update,
            target: id.clone(),
            actor: opts.actor,
            before: Some(before),
            after: Some(after.clone()),
            mutation: Some(update.clone()),
            metadata: None,
        };
        self.log.append(vec![event]).await?;

        self.state.write().unwrap().alive.insert(id.clone(), after.clone());
        Ok(after)
    }

    /// Emits a DELETE event, tombstoning `id`. History remains queryable;
    /// current-view reads return `None` afterward.
    pub async fn delete(&self, id: &EntityId, opts: WriteOptions) -> Result<()> {
        let _guard = self.entity_locks.lock(id).await;
        let before = self
            .state
            .read()
            .unwrap()
            .alive
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let event = Event {
            id: self.log.next_id(),
            ts: self.log.next_ts(),
            op: Op::Delete,
            target: id.clone(),
            actor: opts.actor,
            before: Some(before),
            after: None,
            mutation: None,
            metadata: None,
        };
        self.log.append(vec![event]).await?;

        self.state.write().unwrap().alive.shift_remove(id);
        Ok(())
    }

    /// Applies a synthetic UPDATE that replaces `id`'s live state with
    /// `state@t`, per §4.4. `t` must not be in the future; `state@t` must
    /// exist.
    pub async fn revert(&self, id: &EntityId, t: DateTime<Utc>, opts: WriteOptions) -> Result<Entity> {
        if t > Utc::now() {
            return Err(Error::Validation("cannot revert to a future timestamp".to_string()));
        }
        let _guard = self.entity_locks.lock(id).await;
        let target_state = crate::timetravel::as_of(&self.log, id, t)?
            .ok_or_else(|| Error::NotFound(format!("no state for {id} at or before {t}")))?;

        let before = self
            .state
            .read()
            .unwrap()
            .alive
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let mut after = target_state;
        let next_version = version_of(&before) + 1;
        after.insert(reserved::ID.to_string(), serde_json::Value::String(id.to_string()));
        after.insert(reserved::VERSION.to_string(), serde_json::Value::from(next_version));

        let mut metadata = indexmap::IndexMap::new();
        metadata.insert("revert".to_string(), serde_json::Value::Bool(true));

        let event = Event {
            id: self.log.next_id(),
            ts: self.log.next_ts(),
            op: Op::Revert,
            target: id.clone(),
            actor: opts.actor,
            before: Some(before),
            after: Some(after.clone()),
            mutation: None,
            metadata: Some(metadata),
        };
        self.log.append(vec![event]).await?;

        self.state.write().unwrap().alive.insert(id.clone(), after.clone());
        Ok(after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog::codec::JsonCodec;
    use crate::storage::memory::MemoryBackend;
    use serde_json::json;

    fn store() -> EntityStore {
        let backend = Arc::new(MemoryBackend::new());
        let log = Arc::new(EventLog::new(backend, Arc::new(JsonCodec), 1000));
        EntityStore::new(log)
    }

    fn entity(fields: &[(&str, serde_json::Value)]) -> Entity {
        let mut e = Entity::new();
        for (k, v) in fields {
            e.insert(k.to_string(), v.clone());
        }
        e
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = store();
        let created = store
            .create("posts", entity(&[("title", json!("V1"))]), WriteOptions::default())
            .await
            .unwrap();
        let id = EntityId::from_string(created.get("$id").unwrap().as_str().unwrap()).unwrap();
        let fetched = store.get(&id, ReadOptions::default()).await.unwrap().unwrap();
        assert_eq!(fetched.get("title"), Some(&json!("V1")));
        assert_eq!(fetched.get("version"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn update_increments_version() {
        let store = store();
        let created = store
            .create("posts", entity(&[("title", json!("V1"))]), WriteOptions::default())
            .await
            .unwrap();
        let id = EntityId::from_string(created.get("$id").unwrap().as_str().unwrap()).unwrap();
        let spec = UpdateSpec::new().set("title", json!("V2"));
        let updated = store.update(&id, &spec, WriteOptions::default()).await.unwrap();
        assert_eq!(updated.get("title"), Some(&json!("V2")));
        assert_eq!(updated.get("version"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn delete_makes_current_read_null_but_preserves_history() {
        let store = store();
        let created = store
            .create("posts", entity(&[("title", json!("V1"))]), WriteOptions::default())
            .await
            .unwrap();
        let id = EntityId::from_string(created.get("$id").unwrap().as_str().unwrap()).unwrap();
        store.delete(&id, WriteOptions::default()).await.unwrap();
        assert!(store.get(&id, ReadOptions::default()).await.unwrap().is_none());

        let full_history = crate::timetravel::history(store.event_log(), &id, Default::default());
        assert_eq!(full_history.items.len(), 2);
    }

    #[tokio::test]
    async fn update_of_missing_entity_fails_not_found() {
        let store = store();
        let missing = EntityId::new("posts", "nonexistent");
        let spec = UpdateSpec::new().set("title", json!("x"));
        let err = store.update(&missing, &spec, WriteOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn concurrent_updates_to_the_same_entity_serialize_version_increments() {
        let store = Arc::new(store());
        let created = store
            .create("posts", entity(&[("counter", json!(0))]), WriteOptions::default())
            .await
            .unwrap();
        let id = EntityId::from_string(created.get("$id").unwrap().as_str().unwrap()).unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                let spec = UpdateSpec::new()
                    .op("$inc", indexmap::IndexMap::from([("counter".to_string(), json!(1))]));
                store.update(&id, &spec, WriteOptions::default()).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let current = store.get(&id, ReadOptions::default()).await.unwrap().unwrap();
        assert_eq!(current.get("counter"), Some(&json!(20)));
        assert_eq!(current.get("version"), Some(&json!(21)));
    }
}
