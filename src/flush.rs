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

//! The Flush Coordinator (C8): single-flight, coalesced, rollback-on-failure
//! batching of [`Event`](crate::eventlog::Event) writes.
//!
//! Callers push events via [`FlushCoordinator::append`], which resolves
//! once the events are durable (or rejects with the backend error that
//! aborted their batch). Concurrent callers arriving while a flush is
//! already running are coalesced into the *next* batch rather than each
//! triggering their own `writeAtomic` round-trip.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::error::Result;
use crate::eventlog::Event;
use crate::storage::Backend;
use crate::storage::WriteOptions;

/// One file's worth of new content to write atomically as part of a batch.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub path: String,
    pub data: Bytes,
}

/// Computes the set of file writes a batch of events implies (event-log
/// segments, materialized entity pages, relationship indices). Kept as a
/// trait so the coordinator itself stays ignorant of the physical layout.
#[async_trait]
pub trait BatchWriter: Debug + Send + Sync {
    async fn plan(&self, batch: &[Event]) -> Result<Vec<PendingWrite>>;

    /// Invoked once a batch's writes have all committed successfully,
    /// before any of the batch's callers are unblocked. Used by the event
    /// log to merge newly-durable events into its in-memory read index
    /// ahead of the ordering guarantee in §5 ("flush() observes all events
    /// appended strictly before its invocation").
    fn on_committed(&self, _batch: &[Event]) {}
}

struct Queued {
    event: Event,
    done: oneshot::Sender<Result<()>>,
}

#[derive(Default)]
struct FlushState {
    pending: Vec<Queued>,
    flushing: bool,
}

#[derive(Debug)]
pub struct FlushCoordinator {
    backend: Arc<dyn Backend>,
    writer: Arc<dyn BatchWriter>,
    state: Arc<Mutex<FlushState>>,
    in_flight: Arc<AtomicUsize>,
    max_observed_in_flight: Arc<AtomicUsize>,
}

impl Debug for FlushState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushState")
            .field("pending_len", &self.pending.len())
            .field("flushing", &self.flushing)
            .finish()
    }
}

impl FlushCoordinator {
    pub fn new(backend: Arc<dyn Backend>, writer: Arc<dyn BatchWriter>) -> Self {
        Self {
            backend,
            writer,
            state: Arc::new(Mutex::new(FlushState::default())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_observed_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The highest number of concurrently in-flight flush tasks observed so
    /// far; exposed for the `maxConcurrentFlushes <= 1` testable property.
    pub fn max_observed_in_flight(&self) -> usize {
        self.max_observed_in_flight.load(Ordering::SeqCst)
    }

    /// Enqueues `events` and waits until their batch is durable. On
    /// success, every event in the same batch — including those from other
    /// concurrent callers — has already been committed.
    pub async fn append(&self, events: Vec<Event>) -> Result<()> {
        let mut receivers = Vec::with_capacity(events.len());
        {
            let mut state = self.state.lock().unwrap();
            for event in events {
                let (tx, rx) = oneshot::channel();
                state.pending.push(Queued { event, done: tx });
                receivers.push(rx);
            }
            if !state.flushing {
                state.flushing = true;
                self.spawn_flush_loop();
            }
        }
        for rx in receivers {
            rx.await.map_err(|_| Error::internal("flush task dropped without a reply"))??;
        }
        Ok(())
    }

    /// Resolves once every event appended strictly before this call is
    /// durable, per §5's `flush()` ordering guarantee. With no pending
    /// events this resolves immediately.
    pub async fn flush(&self) -> Result<()> {
        self.append(Vec::new()).await
    }

    fn spawn_flush_loop(&self) {
        let backend = self.backend.clone();
        let writer = self.writer.clone();
        let state = self.state.clone();
        let in_flight = self.in_flight.clone();
        let max_observed = self.max_observed_in_flight.clone();
        tokio::spawn(async move {
            loop {
                let batch = {
                    let mut s = state.lock().unwrap();
                    std::mem::take(&mut s.pending)
                };
                if batch.is_empty() {
                    let mut s = state.lock().unwrap();
                    // Another append() may have pushed between the take()
                    // above and this check; only stop if still empty.
                    if s.pending.is_empty() {
                        s.flushing = false;
                        break;
                    }
                    continue;
                }

                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_observed.fetch_max(current, Ordering::SeqCst);
                let events: Vec<Event> = batch.iter().map(|q| q.event.clone()).collect();
                tracing::trace!(batch_len = events.len(), "flushing batch");
                let result = Self::flush_batch(&backend, &writer, &events).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);

                match result {
                    Ok(()) => {
                        writer.on_committed(&events);
                        for q in batch {
                            let _ = q.done.send(Ok(()));
                        }
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, batch_len = batch.len(), "flush batch failed, rolling back");
                        for q in batch {
                            let _ = q.done.send(Err(err.clone()));
                        }
                    }
                }
            }
        });
    }

    /// Plans, then performs, one batch's writes; rolls back every write
    /// already applied (in reverse order) if a later write in the same
    /// batch fails. The undo log is captured before the first destructive
    /// write, per the design note in §9.
    async fn flush_batch(
        backend: &Arc<dyn Backend>,
        writer: &Arc<dyn BatchWriter>,
        events: &[Event],
    ) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let writes = writer.plan(events).await?;
        let mut undo: Vec<(String, Option<Bytes>)> = Vec::with_capacity(writes.len());
        for write in &writes {
            let prior = backend.read(&write.path).await.ok();
            undo.push((write.path.clone(), prior));
        }
        for (applied, write) in writes.iter().enumerate() {
            if let Err(err) = backend
                .write_atomic(&write.path, write.data.clone(), WriteOptions::default())
                .await
            {
                for (path, prior) in undo[..applied].iter().rev() {
                    // Best-effort: the original error still propagates even
                    // if a rollback write fails, leaving that file stale.
                    match prior {
                        Some(bytes) => {
                            let _ = backend
                                .write_atomic(path, bytes.clone(), WriteOptions::default())
                                .await;
                        }
                        None => {
                            let _ = backend.delete(path).await;
                        }
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityId;
    use crate::eventlog::Op;
    use crate::storage::memory::MemoryBackend;
    use std::sync::atomic::AtomicU32;

    fn sample_event(id: &str) -> Event {
        Event {
            id: id.to_string(),
            ts: chrono::Utc::now(),
            op: Op::Create,
            target: EntityId::new("posts", id),
            actor: None,
            before: None,
            after: None,
            mutation: None,
            metadata: None,
        }
    }

    #[derive(Debug)]
    struct RecordingWriter {
        fail_on_call: Option<u32>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl BatchWriter for RecordingWriter {
        async fn plan(&self, batch: &[Event]) -> Result<Vec<PendingWrite>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on_call == Some(call) {
                return Err(Error::internal("simulated backend failure"));
            }
            Ok(batch
                .iter()
                .map(|e| PendingWrite {
                    path: format!("events/{}.json", e.id),
                    data: Bytes::from(e.id.clone()),
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn successful_batch_commits_all_events() {
        let backend = Arc::new(MemoryBackend::new());
        let writer = Arc::new(RecordingWriter { fail_on_call: None, calls: AtomicU32::new(0) });
        let coordinator = FlushCoordinator::new(backend.clone(), writer);
        coordinator
            .append(vec![sample_event("a"), sample_event("b")])
            .await
            .unwrap();
        assert!(backend.read("events/a.json").await.is_ok());
        assert!(backend.read("events/b.json").await.is_ok());
    }

    #[tokio::test]
    async fn second_batch_failure_rejects_only_that_batch() {
        let backend = Arc::new(MemoryBackend::new());
        let writer = Arc::new(RecordingWriter { fail_on_call: Some(2), calls: AtomicU32::new(0) });
        let coordinator = FlushCoordinator::new(backend.clone(), writer);

        coordinator.append(vec![sample_event("p1")]).await.unwrap();
        let second = coordinator.append(vec![sample_event("p2")]).await;
        assert!(second.is_err());
        assert!(backend.read("events/p1.json").await.is_ok());
        assert!(backend.read("events/p2.json").await.is_err());
    }

    #[tokio::test]
    async fn never_observes_more_than_one_concurrent_flush() {
        let backend = Arc::new(MemoryBackend::new());
        let writer = Arc::new(RecordingWriter { fail_on_call: None, calls: AtomicU32::new(0) });
        let coordinator = Arc::new(FlushCoordinator::new(backend, writer));
        let mut handles = Vec::new();
        for i in 0..10 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.append(vec![sample_event(&i.to_string())]).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(coordinator.max_observed_in_flight() <= 1);
    }
}
