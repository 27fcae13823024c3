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

//! The entity data model (§3): [`EntityId`], [`Entity`] and dotted-path
//! field access.

pub mod store;
pub mod update_spec;

use std::fmt;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::Error;
use crate::error::Result;

/// `<namespace>/<local-id>`. Opaque, durable, immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(namespace: &str, local_id: &str) -> Self {
        Self(format!("{namespace}/{local_id}"))
    }

    pub fn from_string(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if !value.contains('/') {
            return Err(Error::Validation(format!(
                "entity id must be of the form <namespace>/<local-id>: {value}"
            )));
        }
        Ok(Self(value))
    }

    pub fn namespace(&self) -> &str {
        self.0.split_once('/').unwrap().0
    }

    pub fn local_id(&self) -> &str {
        self.0.split_once('/').unwrap().1
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reserved, system-managed attribute names.
pub mod reserved {
    pub const ID: &str = "$id";
    pub const TYPE: &str = "$type";
    pub const VERSION: &str = "version";
}

/// A mapping from field name to value. Values are plain
/// [`serde_json::Value`]s, with two conventional shapes layered on top of
/// the JSON object type to carry the spec's reference and embedding value
/// kinds: `{"$ref": "<EntityId>"}` / `{"$refs": ["<EntityId>", ...]}` for
/// references, and `{"$embedding": [f32, ...], "model": "..."}` for
/// embedding vectors.
pub type Entity = IndexMap<String, Value>;

/// Builds a fresh entity for a CREATE, stamping the reserved attributes.
pub fn new_entity(id: &EntityId, type_name: &str, mut fields: Entity) -> Entity {
    fields.insert(reserved::ID.to_string(), Value::String(id.to_string()));
    fields.insert(reserved::TYPE.to_string(), Value::String(type_name.to_string()));
    fields.insert(reserved::VERSION.to_string(), Value::from(1u64));
    fields
}

pub fn version_of(entity: &Entity) -> u64 {
    entity
        .get(reserved::VERSION)
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

/// Splits a dotted field path into its components (`"metadata.views"` ->
/// `["metadata", "views"]`).
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('.').collect()
}

/// Reads a (possibly nested, dotted-path) field from an entity.
pub fn get_path<'a>(entity: &'a Entity, path: &str) -> Option<&'a Value> {
    let parts = split_path(path);
    let (&first, rest) = parts.split_first()?;
    let mut current = entity.get(first)?;
    for part in rest {
        current = current.as_object()?.get(*part)?;
    }
    Some(current)
}

/// Sets a (possibly nested, dotted-path) field, auto-vivifying intermediate
/// mappings as plain JSON objects.
pub fn set_path(entity: &mut Entity, path: &str, value: Value) {
    let parts = split_path(path);
    let (&first, rest) = parts.split_first().expect("path is never empty");
    if rest.is_empty() {
        entity.insert(first.to_string(), value);
        return;
    }
    let root = entity
        .entry(first.to_string())
        .or_insert_with(|| Value::Object(Default::default()));
    let mut current = root;
    for (i, part) in rest.iter().enumerate() {
        if !current.is_object() {
            *current = Value::Object(Default::default());
        }
        let map = current.as_object_mut().unwrap();
        if i + 1 == rest.len() {
            map.insert((*part).to_string(), value);
            return;
        }
        current = map
            .entry((*part).to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
}

/// Removes a (possibly nested, dotted-path) field. Unlike [`set_path`],
/// this never auto-vivifies intermediate mappings: a missing intermediate
/// segment is simply a no-op.
pub fn unset_path(entity: &mut Entity, path: &str) {
    let parts = split_path(path);
    let (&first, rest) = match parts.split_first() {
        Some(v) => v,
        None => return,
    };
    if rest.is_empty() {
        entity.shift_remove(first);
        return;
    }
    let Some(mut current) = entity.get_mut(first) else {
        return;
    };
    for part in &rest[..rest.len() - 1] {
        let Some(obj) = current.as_object_mut() else {
            return;
        };
        let Some(next) = obj.get_mut(*part) else {
            return;
        };
        current = next;
    }
    if let Some(obj) = current.as_object_mut() {
        obj.remove(*rest.last().unwrap());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dotted_path_get_set() {
        let mut e: Entity = IndexMap::new();
        set_path(&mut e, "metadata.views", json!(3));
        assert_eq!(get_path(&e, "metadata.views"), Some(&json!(3)));
        assert_eq!(get_path(&e, "metadata.missing"), None);
    }

    #[test]
    fn unset_does_not_auto_vivify() {
        let mut e: Entity = IndexMap::new();
        unset_path(&mut e, "a.b.c");
        assert!(e.is_empty());
    }

    #[test]
    fn entity_id_namespace_and_local_id() {
        let id = EntityId::new("posts", "42");
        assert_eq!(id.namespace(), "posts");
        assert_eq!(id.local_id(), "42");
        assert_eq!(id.to_string(), "posts/42");
    }
}
