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

//! [`UpdateSpec`]: the operator-keyed mutation instruction, and its pure
//! application function `(entity, spec) -> entity`.

use chrono::Utc;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use crate::entity::Entity;
use crate::entity::get_path;
use crate::entity::set_path;
use crate::entity::unset_path;
use crate::error::Error;
use crate::error::Result;

/// Operator-keyed mapping of field-paths to operator arguments, applied in
/// the fixed category order the spec prescribes: field, numeric, array,
/// date, relationship, bitwise, embedding. Within a category, field-paths
/// are applied in insertion order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdateSpec(pub IndexMap<String, IndexMap<String, Value>>);

impl UpdateSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op(mut self, operator: &str, args: IndexMap<String, Value>) -> Self {
        self.0.insert(operator.to_string(), args);
        self
    }

    pub fn set(mut self, path: &str, value: Value) -> Self {
        self.0
            .entry("$set".to_string())
            .or_default()
            .insert(path.to_string(), value);
        self
    }
}

const CATEGORY_ORDER: &[&str] = &[
    "$set",
    "$unset",
    "$rename",
    "$setOnInsert",
    "$inc",
    "$mul",
    "$min",
    "$max",
    "$push",
    "$pull",
    "$pullAll",
    "$addToSet",
    "$pop",
    "$currentDate",
    "$link",
    "$unlink",
    "$bit",
    "$embed",
];

/// Applies `spec` to `entity`, returning the mutated entity. Pure with the
/// exception of `$currentDate`, which reads the wall clock, and `$embed`,
/// which is a documented no-op here: the embedding computation itself is an
/// external, asynchronous collaborator (the embeddings service), out of this
/// crate's scope; the entity store issues a follow-up `$set` once the vector
/// is ready.
pub fn apply(entity: &Entity, spec: &UpdateSpec, is_insert: bool) -> Result<Entity> {
    for operator in spec.0.keys() {
        if !CATEGORY_ORDER.contains(&operator.as_str()) {
            return Err(Error::Validation(format!("unknown update operator {operator}")));
        }
    }

    let mut result = entity.clone();
    for &operator in CATEGORY_ORDER {
        let Some(args) = spec.0.get(operator) else {
            continue;
        };
        match operator {
            "$set" => {
                for (path, value) in args {
                    set_path(&mut result, path, value.clone());
                }
            }
            "$unset" => {
                for path in args.keys() {
                    unset_path(&mut result, path);
                }
            }
            "$rename" => {
                for (from, to) in args {
                    let Value::String(to) = to else {
                        return Err(Error::Validation("$rename target must be a string".into()));
                    };
                    if let Some(value) = get_path(&result, from).cloned() {
                        unset_path(&mut result, from);
                        set_path(&mut result, to, value);
                    }
                }
            }
            "$setOnInsert" => {
                if is_insert {
                    for (path, value) in args {
                        set_path(&mut result, path, value.clone());
                    }
                }
            }
            "$inc" => {
                for (path, delta) in args {
                    let delta = delta.as_f64().ok_or_else(|| {
                        Error::Validation(format!("$inc argument for {path} must be numeric"))
                    })?;
                    let current = get_path(&result, path).and_then(Value::as_f64).unwrap_or(0.0);
                    set_path(&mut result, path, number_value(current + delta));
                }
            }
            "$mul" => {
                for (path, factor) in args {
                    let factor = factor.as_f64().ok_or_else(|| {
                        Error::Validation(format!("$mul argument for {path} must be numeric"))
                    })?;
                    let current = get_path(&result, path).and_then(Value::as_f64).unwrap_or(0.0);
                    set_path(&mut result, path, number_value(current * factor));
                }
            }
            "$min" => {
                for (path, candidate) in args {
                    let candidate_n = candidate.as_f64();
                    let current = get_path(&result, path).and_then(Value::as_f64);
                    let replace = match (current, candidate_n) {
                        (None, _) => true,
                        (Some(c), Some(cand)) => cand < c,
                        _ => false,
                    };
                    if replace {
                        set_path(&mut result, path, candidate.clone());
                    }
                }
            }
            "$max" => {
                for (path, candidate) in args {
                    let candidate_n = candidate.as_f64();
                    let current = get_path(&result, path).and_then(Value::as_f64);
                    let replace = match (current, candidate_n) {
                        (None, _) => true,
                        (Some(c), Some(cand)) => cand > c,
                        _ => false,
                    };
                    if replace {
                        set_path(&mut result, path, candidate.clone());
                    }
                }
            }
            "$push" => {
                for (path, arg) in args {
                    let mut array = get_path(&result, path)
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    match arg.as_object().and_then(|o| o.get("$each")) {
                        Some(Value::Array(items)) => array.extend(items.iter().cloned()),
                        _ => array.push(arg.clone()),
                    }
                    set_path(&mut result, path, Value::Array(array));
                }
            }
            "$pull" => {
                for (path, pattern) in args {
                    let Some(array) = get_path(&result, path).and_then(Value::as_array).cloned()
                    else {
                        continue;
                    };
                    let filtered: Vec<Value> = array
                        .into_iter()
                        .filter(|item| !matches_pull_pattern(item, pattern))
                        .collect();
                    set_path(&mut result, path, Value::Array(filtered));
                }
            }
            "$pullAll" => {
                for (path, values) in args {
                    let Some(targets) = values.as_array() else {
                        return Err(Error::Validation("$pullAll argument must be an array".into()));
                    };
                    let Some(array) = get_path(&result, path).and_then(Value::as_array).cloned()
                    else {
                        continue;
                    };
                    let filtered: Vec<Value> =
                        array.into_iter().filter(|item| !targets.contains(item)).collect();
                    set_path(&mut result, path, Value::Array(filtered));
                }
            }
            "$addToSet" => {
                for (path, arg) in args {
                    let mut array = get_path(&result, path)
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    let to_add: Vec<Value> = match arg.as_object().and_then(|o| o.get("$each")) {
                        Some(Value::Array(items)) => items.clone(),
                        _ => vec![arg.clone()],
                    };
                    for item in to_add {
                        if !array.contains(&item) {
                            array.push(item);
                        }
                    }
                    set_path(&mut result, path, Value::Array(array));
                }
            }
            "$pop" => {
                for (path, direction) in args {
                    let mut array = get_path(&result, path)
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    let dir = direction.as_i64().unwrap_or(1);
                    if dir >= 0 {
                        array.pop();
                    } else if !array.is_empty() {
                        array.remove(0);
                    }
                    set_path(&mut result, path, Value::Array(array));
                }
            }
            "$currentDate" => {
                for (path, kind) in args {
                    let now = Utc::now();
                    let value = match kind {
                        Value::Bool(true) => Value::String(now.to_rfc3339()),
                        Value::Object(obj) if obj.get("$type").and_then(Value::as_str) == Some("timestamp") => {
                            Value::from(now.timestamp_millis())
                        }
                        _ => Value::String(now.to_rfc3339()),
                    };
                    set_path(&mut result, path, value);
                }
            }
            "$link" => {
                for (path, ids) in args {
                    let new_ids: Vec<String> = match ids {
                        Value::String(id) => vec![id.clone()],
                        Value::Array(items) => items
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect(),
                        _ => {
                            return Err(Error::Validation("$link argument must be an id or array of ids".into()));
                        }
                    };
                    let mut current = existing_refs(&result, path);
                    for id in new_ids {
                        if !current.contains(&id) {
                            current.push(id);
                        }
                    }
                    set_path(&mut result, path, refs_value(current));
                }
            }
            "$unlink" => {
                for (path, ids) in args {
                    if matches!(ids, Value::String(s) if s == "$all") {
                        set_path(&mut result, path, refs_value(Vec::new()));
                        continue;
                    }
                    let remove: Vec<String> = match ids {
                        Value::String(id) => vec![id.clone()],
                        Value::Array(items) => items
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect(),
                        _ => {
                            return Err(Error::Validation("$unlink argument must be an id, array of ids, or \"$all\"".into()));
                        }
                    };
                    let current: Vec<String> = existing_refs(&result, path)
                        .into_iter()
                        .filter(|id| !remove.contains(id))
                        .collect();
                    set_path(&mut result, path, refs_value(current));
                }
            }
            "$bit" => {
                for (path, ops) in args {
                    let Some(ops) = ops.as_object() else {
                        return Err(Error::Validation("$bit argument must be a mapping".into()));
                    };
                    let current = get_path(&result, path).and_then(Value::as_i64).unwrap_or(0);
                    let mut value = current;
                    for (bitop, arg) in ops {
                        let arg = arg.as_i64().ok_or_else(|| {
                            Error::Validation(format!("$bit {bitop} argument must be an integer"))
                        })?;
                        value = match bitop.as_str() {
                            "and" => value & arg,
                            "or" => value | arg,
                            "xor" => value ^ arg,
                            other => {
                                return Err(Error::Validation(format!("unknown $bit operator {other}")));
                            }
                        };
                    }
                    set_path(&mut result, path, Value::from(value));
                }
            }
            "$embed" => {
                // Scheduling happens at the entity-store layer; the pure
                // apply function leaves the target field untouched so that
                // replay of (before, mutation) still equals after until the
                // embeddings service's follow-up `$set` lands.
            }
            _ => unreachable!("validated against CATEGORY_ORDER above"),
        }
    }
    Ok(result)
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn matches_pull_pattern(item: &Value, pattern: &Value) -> bool {
    match pattern.as_object() {
        Some(predicate) => predicate.iter().all(|(key, expected)| match key.as_str() {
            "$eq" => item == expected,
            "$ne" => item != expected,
            "$gt" => item.as_f64().zip(expected.as_f64()).is_some_and(|(a, b)| a > b),
            "$gte" => item.as_f64().zip(expected.as_f64()).is_some_and(|(a, b)| a >= b),
            "$lt" => item.as_f64().zip(expected.as_f64()).is_some_and(|(a, b)| a < b),
            "$lte" => item.as_f64().zip(expected.as_f64()).is_some_and(|(a, b)| a <= b),
            _ => false,
        }),
        None => item == pattern,
    }
}

fn existing_refs(entity: &Entity, path: &str) -> Vec<String> {
    match get_path(entity, path) {
        Some(Value::Object(obj)) => {
            if let Some(Value::String(id)) = obj.get("$ref") {
                vec![id.clone()]
            } else if let Some(Value::Array(ids)) = obj.get("$refs") {
                ids.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()
            } else {
                Vec::new()
            }
        }
        _ => Vec::new(),
    }
}

fn refs_value(ids: Vec<String>) -> Value {
    match ids.len() {
        0 => json!({"$refs": []}),
        1 => json!({"$ref": ids[0]}),
        _ => json!({"$refs": ids}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap as Map;

    fn entity_with(fields: &[(&str, Value)]) -> Entity {
        let mut e = Entity::new();
        for (k, v) in fields {
            e.insert(k.to_string(), v.clone());
        }
        e
    }

    #[test]
    fn inc_on_missing_field_starts_at_delta() {
        let e = entity_with(&[]);
        let spec = UpdateSpec::new().op("$inc", Map::from([("views".to_string(), json!(5))]));
        let out = apply(&e, &spec, false).unwrap();
        assert_eq!(out.get("views"), Some(&json!(5)));
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let e = entity_with(&[]);
        let spec = UpdateSpec::new().op("$bogus", Map::new());
        assert!(apply(&e, &spec, false).is_err());
    }

    #[test]
    fn push_with_each_appends_many() {
        let e = entity_with(&[("tags", json!(["a"]))]);
        let spec = UpdateSpec::new().op(
            "$push",
            Map::from([("tags".to_string(), json!({"$each": ["b", "c"]}))]),
        );
        let out = apply(&e, &spec, false).unwrap();
        assert_eq!(out.get("tags"), Some(&json!(["a", "b", "c"])));
    }

    #[test]
    fn add_to_set_is_idempotent() {
        let e = entity_with(&[("tags", json!(["a", "b"]))]);
        let spec = UpdateSpec::new().op("$addToSet", Map::from([("tags".to_string(), json!("a"))]));
        let out = apply(&e, &spec, false).unwrap();
        assert_eq!(out.get("tags"), Some(&json!(["a", "b"])));
    }

    #[test]
    fn unlink_all_clears_references() {
        let e = entity_with(&[("author", json!({"$refs": ["users/1", "users/2"]}))]);
        let spec =
            UpdateSpec::new().op("$unlink", Map::from([("author".to_string(), json!("$all"))]));
        let out = apply(&e, &spec, false).unwrap();
        assert_eq!(out.get("author"), Some(&json!({"$refs": []})));
    }

    #[test]
    fn operators_apply_in_category_order() {
        // $set runs before $inc, so the final value reflects both.
        let e = entity_with(&[]);
        let mut spec = UpdateSpec::new();
        spec = spec.set("views", json!(10));
        spec = spec.op("$inc", Map::from([("views".to_string(), json!(1))]));
        let out = apply(&e, &spec, false).unwrap();
        assert_eq!(out.get("views"), Some(&json!(11)));
    }
}
