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

//! Canonical-form hashing shared by the commit DAG and the sync manifest.
//!
//! A value is hashed by first converting it to a [`serde_json::Value`],
//! recursively sorting every object's keys, and SHA-256ing the resulting
//! compact (whitespace-free) byte representation. Sorting is recursive so
//! that nested mappings hash identically regardless of field insertion
//! order, while array order is preserved and therefore hash-sensitive.

use serde::Serialize;
use serde_json::Value;
use sha2::Digest as _;
use sha2::Sha256;

/// Recursively sorts the keys of every object (nested or top-level) found in
/// `value`. Arrays keep their element order.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> =
                map.into_iter().map(|(k, v)| (k, canonicalize(v))).collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut sorted = serde_json::Map::with_capacity(entries.len());
            for (k, v) in entries {
                sorted.insert(k, v);
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Serializes `value` to its canonical byte form: JSON with recursively
/// sorted object keys and no insignificant whitespace.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_value(value)?;
    let canonical = canonicalize(json);
    serde_json::to_vec(&canonical)
}

/// Hex-encoded SHA-256 digest of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Content hash (canonical-form SHA-256, hex-encoded) of any serializable
/// value. Invariant under key permutation of any mapping; sensitive to
/// array order.
pub fn content_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(sha256_hex(&canonical_bytes(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_permutation_does_not_change_hash() {
        let a = json!({"a": 1, "b": {"x": 1, "y": 2}});
        let b = json!({"b": {"y": 2, "x": 1}, "a": 1});
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn array_order_changes_hash() {
        let a = json!({"xs": [1, 2, 3]});
        let b = json!({"xs": [3, 2, 1]});
        assert_ne!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn hash_is_64_hex_chars() {
        let h = content_hash(&json!({"a": 1})).unwrap();
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
