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

//! End-to-end scenarios driven through the public [`Database`] facade,
//! rather than through any single module's internal seams, so a wiring
//! regression between modules is caught even when every module's own unit
//! tests still pass.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;

use stratumdb::Database;
use stratumdb::commit::DatabaseState;
use stratumdb::commit::dag::CreateCommitOptions;
use stratumdb::commit::dag::FindAncestorOptions;
use stratumdb::config::Config;
use stratumdb::entity::Entity;
use stratumdb::entity::EntityId;
use stratumdb::entity::store::ReadOptions;
use stratumdb::entity::store::WriteOptions;
use stratumdb::entity::update_spec::UpdateSpec;
use stratumdb::storage::Backend;
use stratumdb::storage::memory::MemoryBackend;

fn db() -> Database {
    Database::open(Arc::new(MemoryBackend::new()), Config::default())
}

fn post(title: &str) -> Entity {
    let mut e = Entity::new();
    e.insert("title".to_string(), json!(title));
    e
}

fn id_of(e: &Entity) -> EntityId {
    EntityId::from_string(e.get("$id").unwrap().as_str().unwrap()).unwrap()
}

/// S1: time-travel read recovers each historical title.
#[tokio::test]
async fn time_travel_read_recovers_each_version() {
    let db = db();

    let created = db.create("posts", post("V1"), WriteOptions::default()).await.unwrap();
    let id = id_of(&created);
    let t0 = chrono::Utc::now();

    tokio::time::sleep(Duration::from_millis(5)).await;
    db.update(&id, &UpdateSpec::new().set("title", json!("V2")), WriteOptions::default())
        .await
        .unwrap();
    let t1 = chrono::Utc::now();

    tokio::time::sleep(Duration::from_millis(5)).await;
    db.update(&id, &UpdateSpec::new().set("title", json!("V3")), WriteOptions::default())
        .await
        .unwrap();

    let at_t0 = db.get(&id, ReadOptions { as_of: Some(t0) }).await.unwrap().unwrap();
    assert_eq!(at_t0.get("title"), Some(&json!("V1")));

    let at_t1 = db.get(&id, ReadOptions { as_of: Some(t1) }).await.unwrap().unwrap();
    assert_eq!(at_t1.get("title"), Some(&json!("V2")));

    let current = db.get(&id, ReadOptions::default()).await.unwrap().unwrap();
    assert_eq!(current.get("title"), Some(&json!("V3")));

    db.dispose().await.unwrap();
}

/// S1 variant: diff between two historical points reports only the
/// changed field, and revert restores a past state as a fresh version.
#[tokio::test]
async fn diff_and_revert_round_trip() {
    let db = db();
    let created = db.create("posts", post("V1"), WriteOptions::default()).await.unwrap();
    let id = id_of(&created);
    let t0 = chrono::Utc::now();

    tokio::time::sleep(Duration::from_millis(5)).await;
    db.update(&id, &UpdateSpec::new().set("title", json!("V2")), WriteOptions::default())
        .await
        .unwrap();
    let t1 = chrono::Utc::now();

    let diff = db.diff(&id, t0, t1).unwrap();
    assert!(diff.changed.contains(&"title".to_string()));
    assert_eq!(diff.values["title"], (Some(json!("V1")), Some(json!("V2"))));

    let reverted = db.revert(&id, t0, WriteOptions::default()).await.unwrap();
    assert_eq!(reverted.get("title"), Some(&json!("V1")));
    assert_eq!(reverted.get("version"), Some(&json!(3)));
}

/// S2: a burst of concurrent creates is coalesced into a single flush.
#[tokio::test]
async fn burst_of_creates_batches_to_a_single_flush() {
    let db = Arc::new(db());

    let mut handles = Vec::new();
    for i in 0..10 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            db.create("posts", post(&format!("P{i}")), WriteOptions::default()).await
        }));
    }
    let mut created = Vec::new();
    for h in handles {
        created.push(h.await.unwrap().unwrap());
    }

    assert_eq!(created.len(), 10);
    let page = db.event_log().get_events_by_namespace("posts", &Default::default());
    assert_eq!(page.items.len(), 10);
    assert!(page.items.iter().all(|e| matches!(e.op, stratumdb::eventlog::Op::Create)));
    assert!(db.event_log().max_observed_in_flight_flushes() <= 1);
}

/// S3: a backend that fails its second write leaves the first create
/// intact and the second entirely absent — no partial state survives a
/// failed flush batch.
#[tokio::test]
async fn rollback_on_partial_flush_failure_leaves_prior_entity_intact() {
    let backend = Arc::new(FlakyBackend::new(MemoryBackend::new(), 2));
    let db = Database::open(backend, Config::default());

    let created = db.create("posts", post("P1"), WriteOptions::default()).await.unwrap();
    let id1 = id_of(&created);

    let second = db.create("posts", post("P2"), WriteOptions::default()).await;
    assert!(second.is_err());

    assert!(db.get(&id1, ReadOptions::default()).await.unwrap().is_some());
}

/// S4: in a diamond commit DAG (A <- B, A <- C, merge M <- [B, C]),
/// `findCommonAncestor` finds the nearer and farther merge bases.
#[tokio::test]
async fn common_ancestor_in_diamond_dag() {
    let db = db();

    let a = db
        .commit(DatabaseState::default(), CreateCommitOptions { message: "A".to_string(), ..Default::default() })
        .await
        .unwrap();
    let b = db
        .commit(
            DatabaseState::default(),
            CreateCommitOptions { message: "B".to_string(), parents: vec![a.hash.clone()], ..Default::default() },
        )
        .await
        .unwrap();
    let c = db
        .commit(
            DatabaseState::default(),
            CreateCommitOptions { message: "C".to_string(), parents: vec![a.hash.clone()], ..Default::default() },
        )
        .await
        .unwrap();
    let m = db
        .commit(
            DatabaseState::default(),
            CreateCommitOptions {
                message: "M".to_string(),
                parents: vec![b.hash.clone(), c.hash.clone()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let result = db.find_common_ancestor(&m.hash, &b.hash, FindAncestorOptions::default()).await.unwrap();
    assert_eq!(result.ancestor, Some(b.hash.clone()));

    let result = db.find_common_ancestor(&b.hash, &c.hash, FindAncestorOptions::default()).await.unwrap();
    assert_eq!(result.ancestor, Some(a.hash.clone()));

    assert!(db.is_ancestor(&a.hash, &m.hash).await.unwrap());
    assert!(!db.is_ancestor(&m.hash, &a.hash).await.unwrap());
}

/// S6: a byte range read of a file's tail returns exactly the trailing
/// bytes, matching a plain-slice read of the same range.
#[tokio::test]
async fn range_read_matches_full_read_slice() {
    let backend = MemoryBackend::new();
    let data: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    backend
        .write("t.bin", Bytes::from(data.clone()), stratumdb::storage::WriteOptions::default())
        .await
        .unwrap();

    let tail = backend.read_range("t.bin", 1024 - 8, 1024).await.unwrap();
    assert_eq!(&tail[..], &data[1024 - 8..]);

    let full = backend.read_range("t.bin", 0, 1024).await.unwrap();
    assert_eq!(&full[..], &data[..]);
}

/// A [`Backend`] wrapper whose `write_atomic` fails on a configured call
/// index, used to drive the Flush Coordinator's rollback path (S3) from
/// above the module boundary.
#[derive(Debug)]
struct FlakyBackend {
    inner: MemoryBackend,
    fail_on_call: u32,
    calls: std::sync::atomic::AtomicU32,
}

impl FlakyBackend {
    fn new(inner: MemoryBackend, fail_on_call: u32) -> Self {
        Self { inner, fail_on_call, calls: std::sync::atomic::AtomicU32::new(0) }
    }
}

#[async_trait::async_trait]
impl Backend for FlakyBackend {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn read(&self, path: &str) -> stratumdb::Result<Bytes> {
        self.inner.read(path).await
    }

    async fn read_range(&self, path: &str, start: i64, end: i64) -> stratumdb::Result<Bytes> {
        self.inner.read_range(path, start, end).await
    }

    async fn stat(&self, path: &str) -> stratumdb::Result<Option<stratumdb::storage::Stat>> {
        self.inner.stat(path).await
    }

    async fn write(
        &self,
        path: &str,
        data: Bytes,
        opts: stratumdb::storage::WriteOptions,
    ) -> stratumdb::Result<stratumdb::storage::WriteOutcome> {
        self.inner.write(path, data, opts).await
    }

    async fn write_atomic(
        &self,
        path: &str,
        data: Bytes,
        opts: stratumdb::storage::WriteOptions,
    ) -> stratumdb::Result<stratumdb::storage::WriteOutcome> {
        let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        if call == self.fail_on_call {
            return Err(stratumdb::Error::Internal("simulated backend failure".to_string()));
        }
        self.inner.write_atomic(path, data, opts).await
    }

    async fn append(&self, path: &str, data: Bytes) -> stratumdb::Result<u64> {
        self.inner.append(path, data).await
    }

    async fn delete(&self, path: &str) -> stratumdb::Result<()> {
        self.inner.delete(path).await
    }

    async fn delete_prefix(&self, prefix: &str) -> stratumdb::Result<u64> {
        self.inner.delete_prefix(prefix).await
    }

    async fn list(
        &self,
        prefix: &str,
        opts: stratumdb::storage::ListOptions,
    ) -> stratumdb::Result<stratumdb::storage::ListResult> {
        self.inner.list(prefix, opts).await
    }
}
