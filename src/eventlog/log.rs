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

//! [`EventLog`]: the durable, segmented, append-only store of record
//! [`Event`]s, fronted by the [`FlushCoordinator`].

use std::sync::Arc;
use std::sync::RwLock;

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::entity::EntityId;
use crate::error::Result;
use crate::eventlog::Clock;
use crate::eventlog::Event;
use crate::eventlog::EventFilter;
use crate::eventlog::Page;
use crate::eventlog::codec::Codec;
use crate::eventlog::paginate;
use crate::flush::BatchWriter;
use crate::flush::FlushCoordinator;
use crate::flush::PendingWrite;
use crate::storage::Backend;

#[derive(Debug, Default)]
struct EventIndex {
    /// Chronological per-entity history, oldest first.
    by_entity: IndexMap<EntityId, Vec<Event>>,
    /// Chronological per-namespace history, oldest first.
    by_namespace: IndexMap<String, Vec<Event>>,
}

impl EventIndex {
    fn record(&mut self, event: Event) {
        self.by_entity.entry(event.target.clone()).or_default().push(event.clone());
        self.by_namespace
            .entry(event.target.namespace().to_string())
            .or_default()
            .push(event);
    }
}

#[derive(Debug)]
pub struct EventLog {
    backend: Arc<dyn Backend>,
    clock: Clock,
    index: Arc<RwLock<EventIndex>>,
    flush: FlushCoordinator,
}

impl EventLog {
    pub fn new(backend: Arc<dyn Backend>, codec: Arc<dyn Codec>, segment_capacity: usize) -> Self {
        let index = Arc::new(RwLock::new(EventIndex::default()));
        let writer = Arc::new(SegmentWriter {
            backend: backend.clone(),
            codec,
            segment_capacity,
            index: index.clone(),
        });
        Self {
            flush: FlushCoordinator::new(backend.clone(), writer),
            backend,
            clock: Clock::new(),
            index,
        }
    }

    pub fn next_ts(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    pub fn next_id(&self) -> String {
        self.clock.next_id()
    }

    /// Appends `events` and waits until they (and any events concurrently
    /// coalesced into the same batch) are durable.
    pub async fn append(&self, events: Vec<Event>) -> Result<()> {
        self.flush.append(events).await
    }

    /// Waits until every event appended strictly before this call is
    /// durable.
    pub async fn flush(&self) -> Result<()> {
        self.flush.flush().await
    }

    pub fn max_observed_in_flight_flushes(&self) -> usize {
        self.flush.max_observed_in_flight()
    }

    /// All durable-or-visible events for `id`, chronologically ordered with
    /// a stable tiebreak on event id, matching `filter`.
    pub fn get_events(&self, id: &EntityId, filter: &EventFilter) -> Page<Event> {
        let index = self.index.read().unwrap();
        match index.by_entity.get(id) {
            Some(events) => paginate(events, filter),
            None => Page { items: Vec::new(), has_more: false, next_cursor: None },
        }
    }

    pub fn get_events_by_namespace(&self, ns: &str, filter: &EventFilter) -> Page<Event> {
        let index = self.index.read().unwrap();
        match index.by_namespace.get(ns) {
            Some(events) => paginate(events, filter),
            None => Page { items: Vec::new(), has_more: false, next_cursor: None },
        }
    }

    /// All events for `id` with `ts <= t`, chronologically ordered. Used by
    /// the time-travel engine (§4.4); bypasses pagination entirely since
    /// replay needs the full prefix.
    pub fn events_up_to(&self, id: &EntityId, t: chrono::DateTime<chrono::Utc>) -> Vec<Event> {
        let index = self.index.read().unwrap();
        index
            .by_entity
            .get(id)
            .map(|events| events.iter().filter(|e| e.ts <= t).cloned().collect())
            .unwrap_or_default()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }
}

/// Computes the file writes implied by a batch of events: one rewritten
/// segment blob per touched namespace, containing the namespace's existing
/// durable segment content (if any) plus the new events appended. Segment
/// roll-over is derived fresh from storage on every call rather than cached,
/// so a failed flush never leaves stale bookkeeping behind.
#[derive(Debug)]
struct SegmentWriter {
    backend: Arc<dyn Backend>,
    codec: Arc<dyn Codec>,
    segment_capacity: usize,
    index: Arc<RwLock<EventIndex>>,
}

impl SegmentWriter {
    async fn current_segment(&self, ns: &str) -> Result<(String, Vec<Event>)> {
        let prefix = format!("events/{ns}/");
        let listing = self
            .backend
            .list(&prefix, crate::storage::ListOptions::default())
            .await?;
        let mut segment_ids: Vec<u64> = listing
            .files
            .iter()
            .filter_map(|p| p.rsplit('/').next())
            .filter_map(|name| name.strip_suffix(&format!(".{}", self.codec.extension())))
            .filter_map(|id| id.parse().ok())
            .collect();
        segment_ids.sort_unstable();
        let latest = segment_ids.last().copied();
        let (segment_id, existing) = match latest {
            None => (0u64, Vec::new()),
            Some(id) => {
                let path = segment_path(ns, id, self.codec.extension());
                let bytes = self.backend.read(&path).await?;
                let events = self.codec.decode_events(&bytes)?;
                if events.len() >= self.segment_capacity {
                    (id + 1, Vec::new())
                } else {
                    (id, events)
                }
            }
        };
        Ok((segment_path(ns, segment_id, self.codec.extension()), existing))
    }
}

fn segment_path(ns: &str, segment_id: u64, extension: &str) -> String {
    format!("events/{ns}/{segment_id:010}.{extension}")
}

#[async_trait]
impl BatchWriter for SegmentWriter {
    async fn plan(&self, batch: &[Event]) -> Result<Vec<PendingWrite>> {
        let mut by_ns: IndexMap<String, Vec<Event>> = IndexMap::new();
        for event in batch {
            by_ns
                .entry(event.target.namespace().to_string())
                .or_default()
                .push(event.clone());
        }
        let mut writes = Vec::with_capacity(by_ns.len());
        for (ns, new_events) in by_ns {
            let (path, mut existing) = self.current_segment(&ns).await?;
            existing.extend(new_events);
            let encoded = self.codec.encode_events(&existing)?;
            writes.push(PendingWrite { path, data: encoded });
        }
        Ok(writes)
    }

    fn on_committed(&self, batch: &[Event]) {
        let mut index = self.index.write().unwrap();
        for event in batch {
            index.record(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::eventlog::Op;
    use crate::eventlog::codec::JsonCodec;
    use crate::storage::memory::MemoryBackend;

    fn create_event(id: &EntityId, ts: chrono::DateTime<chrono::Utc>) -> Event {
        Event {
            id: format!("evt-{}", ts.timestamp_nanos_opt().unwrap_or_default()),
            ts,
            op: Op::Create,
            target: id.clone(),
            actor: None,
            before: None,
            after: Some(Entity::new()),
            mutation: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn appended_events_are_visible_immediately() {
        let backend = Arc::new(MemoryBackend::new());
        let log = EventLog::new(backend, Arc::new(JsonCodec), 1000);
        let id = EntityId::new("posts", "1");
        log.append(vec![create_event(&id, log.next_ts())]).await.unwrap();
        let page = log.get_events(&id, &EventFilter::default());
        assert_eq!(page.items.len(), 1);
    }

    #[tokio::test]
    async fn segments_roll_over_past_capacity() {
        let backend = Arc::new(MemoryBackend::new());
        let log = EventLog::new(backend.clone(), Arc::new(JsonCodec), 2);
        let id = EntityId::new("posts", "1");
        for _ in 0..5 {
            log.append(vec![create_event(&id, log.next_ts())]).await.unwrap();
        }
        let listing = backend
            .list("events/posts/", crate::storage::ListOptions::default())
            .await
            .unwrap();
        assert!(listing.files.len() >= 2, "expected more than one segment file, got {:?}", listing.files);
    }
}
