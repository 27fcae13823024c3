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

//! The Time-Travel Engine (C4): `asOf` replay, `history` and `diff` over an
//! entity's event stream. `revert` lives on
//! [`crate::entity::store::EntityStore`] since it must also mutate the
//! current-state view; it calls [`as_of`] to compute the state it reverts
//! to.

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde_json::Value;

use crate::entity::Entity;
use crate::entity::EntityId;
use crate::entity::reserved;
use crate::error::Result;
use crate::eventlog::Event;
use crate::eventlog::EventFilter;
use crate::eventlog::Op;
use crate::eventlog::Page;
use crate::eventlog::log::EventLog;

/// Reconstructs `id`'s state at `t`. Each event's stored `after` already
/// equals the fold of `(before, mutation)` (an invariant the store
/// maintains at write time), so replay only needs the chronologically last
/// qualifying event rather than re-running `UpdateSpec` application.
pub fn as_of(log: &EventLog, id: &EntityId, t: DateTime<Utc>) -> Result<Option<Entity>> {
    let events = log.events_up_to(id, t);
    match events.last() {
        None => Ok(None),
        Some(event) if event.op == Op::Delete => Ok(None),
        Some(event) => Ok(event.after.clone()),
    }
}

/// `{items, hasMore, nextCursor}` over `id`'s full event history, filtered
/// and paginated per §4.2.
pub fn history(log: &EventLog, id: &EntityId, filter: EventFilter) -> Page<Event> {
    log.get_events(id, &filter)
}

/// Field-level difference between `state@t1` and `state@t2`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResult {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    pub values: BTreeMap<String, (Option<Value>, Option<Value>)>,
}

pub fn diff(log: &EventLog, id: &EntityId, t1: DateTime<Utc>, t2: DateTime<Utc>) -> Result<DiffResult> {
    let before = as_of(log, id, t1)?;
    let after = as_of(log, id, t2)?;
    if before == after {
        return Ok(DiffResult::default());
    }
    let before_fields = before.as_ref().map(flatten).unwrap_or_default();
    let after_fields = after.as_ref().map(flatten).unwrap_or_default();

    let mut result = DiffResult::default();
    for (path, value) in &after_fields {
        match before_fields.get(path) {
            None => {
                result.added.push(path.clone());
                result.values.insert(path.clone(), (None, Some(value.clone())));
            }
            Some(prior) if prior != value => {
                result.changed.push(path.clone());
                result.values.insert(path.clone(), (Some(prior.clone()), Some(value.clone())));
            }
            _ => {}
        }
    }
    for (path, value) in &before_fields {
        if !after_fields.contains_key(path) {
            result.removed.push(path.clone());
            result.values.insert(path.clone(), (Some(value.clone()), None));
        }
    }
    Ok(result)
}

/// Flattens an entity into dotted-path leaves, excluding reserved
/// attributes. Arrays are leaves (no element-wise diffing, per §4.4);
/// nested mappings recurse.
fn flatten(entity: &Entity) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    for (key, value) in entity {
        if key == reserved::ID || key == reserved::TYPE || key == reserved::VERSION {
            continue;
        }
        flatten_into(key, value, &mut out);
    }
    out
}

fn flatten_into(prefix: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) if !is_reference_or_embedding(map) => {
            for (k, v) in map {
                flatten_into(&format!("{prefix}.{k}"), v, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

fn is_reference_or_embedding(map: &serde_json::Map<String, Value>) -> bool {
    map.contains_key("$ref") || map.contains_key("$refs") || map.contains_key("$embedding")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::store::EntityStore;
    use crate::entity::store::ReadOptions;
    use crate::entity::store::WriteOptions;
    use crate::entity::update_spec::UpdateSpec;
    use crate::eventlog::codec::JsonCodec;
    use crate::storage::memory::MemoryBackend;
    use serde_json::json;
    use std::sync::Arc;

    fn make_store() -> EntityStore {
        let backend = Arc::new(MemoryBackend::new());
        let log = Arc::new(EventLog::new(backend, Arc::new(JsonCodec), 1000));
        EntityStore::new(log)
    }

    #[tokio::test]
    async fn as_of_reconstructs_three_historical_versions() {
        let store = make_store();
        let mut entity = Entity::new();
        entity.insert("title".to_string(), json!("V1"));
        let created = store.create("posts", entity, WriteOptions::default()).await.unwrap();
        let id = EntityId::from_string(created.get("$id").unwrap().as_str().unwrap()).unwrap();
        let t0 = Utc::now();

        store
            .update(&id, &UpdateSpec::new().set("title", json!("V2")), WriteOptions::default())
            .await
            .unwrap();
        let t1 = Utc::now();

        store
            .update(&id, &UpdateSpec::new().set("title", json!("V3")), WriteOptions::default())
            .await
            .unwrap();

        let at_t0 = store.get(&id, ReadOptions { as_of: Some(t0) }).await.unwrap().unwrap();
        let at_t1 = store.get(&id, ReadOptions { as_of: Some(t1) }).await.unwrap().unwrap();
        let current = store.get(&id, ReadOptions::default()).await.unwrap().unwrap();

        assert_eq!(at_t0.get("title"), Some(&json!("V1")));
        assert_eq!(at_t1.get("title"), Some(&json!("V2")));
        assert_eq!(current.get("title"), Some(&json!("V3")));
    }

    #[tokio::test]
    async fn as_of_before_creation_is_null() {
        let store = make_store();
        let before_creation = Utc::now();
        let mut entity = Entity::new();
        entity.insert("title".to_string(), json!("V1"));
        let created = store.create("posts", entity, WriteOptions::default()).await.unwrap();
        let id = EntityId::from_string(created.get("$id").unwrap().as_str().unwrap()).unwrap();
        assert!(store.get(&id, ReadOptions { as_of: Some(before_creation) }).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn diff_reports_changed_leaf_only() {
        let store = make_store();
        let mut entity = Entity::new();
        entity.insert("title".to_string(), json!("V1"));
        entity.insert("metadata".to_string(), json!({"views": 1}));
        let created = store.create("posts", entity, WriteOptions::default()).await.unwrap();
        let id = EntityId::from_string(created.get("$id").unwrap().as_str().unwrap()).unwrap();
        let t1 = Utc::now();

        store
            .update(&id, &UpdateSpec::new().set("metadata.views", json!(2)), WriteOptions::default())
            .await
            .unwrap();
        let t2 = Utc::now();

        let d = diff(store.event_log(), &id, t1, t2).unwrap();
        assert_eq!(d.changed, vec!["metadata.views".to_string()]);
        assert!(d.added.is_empty());
        assert!(d.removed.is_empty());
    }
}
