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

//! The append-only event log (C2): [`Event`] records, a monotonic [`Clock`],
//! and the segmented, flush-coordinated [`log::EventLog`].

pub mod codec;
pub mod log;

use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;
use indexmap::IndexMap;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::entity::Entity;
use crate::entity::EntityId;
use crate::entity::update_spec::UpdateSpec;

/// The four recognized mutation kinds (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Op {
    Create,
    Update,
    Delete,
    Revert,
}

/// A single, immutable mutation record (§3). `before`/`after` are full
/// entity snapshots, not deltas: `after` already equals the fold of
/// `(before, mutation)`, which lets replay pick the right event's `after`
/// directly instead of re-running [`crate::entity::update_spec::apply`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub ts: DateTime<Utc>,
    pub op: Op,
    pub target: EntityId,
    pub actor: Option<EntityId>,
    pub before: Option<Entity>,
    pub after: Option<Entity>,
    pub mutation: Option<UpdateSpec>,
    pub metadata: Option<IndexMap<String, Value>>,
}

/// Filters accepted by `getEvents`/`getEventsByNamespace` (§4.2).
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub op: Option<Op>,
    pub actor: Option<EntityId>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

impl EventFilter {
    fn matches(&self, event: &Event) -> bool {
        if let Some(from) = self.from {
            if event.ts < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if event.ts > to {
                return false;
            }
        }
        if let Some(op) = self.op {
            if event.op != op {
                return false;
            }
        }
        if let Some(actor) = &self.actor {
            if event.actor.as_ref() != Some(actor) {
                return false;
            }
        }
        true
    }
}

/// A page of results with an opaque continuation cursor.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

/// Applies an [`EventFilter`] (minus pagination) to an already chronological
/// slice, then paginates by numeric offset encoded in the cursor.
pub(crate) fn paginate(events: &[Event], filter: &EventFilter) -> Page<Event> {
    let matched: Vec<Event> = events.iter().filter(|e| filter.matches(e)).cloned().collect();
    let start = filter
        .cursor
        .as_deref()
        .and_then(|c| c.parse::<usize>().ok())
        .unwrap_or(0);
    let limit = filter.limit.unwrap_or(matched.len());
    let end = (start + limit).min(matched.len());
    let items = matched[start.min(matched.len())..end].to_vec();
    let has_more = end < matched.len();
    Page {
        items,
        has_more,
        next_cursor: has_more.then(|| end.to_string()),
    }
}

/// Monotonic timestamp source (§4.2): "all events within a single process
/// are assigned strictly monotonic timestamps; if wall-clock collides, a
/// synthetic tiebreaker advances by one unit".
#[derive(Debug, Default)]
pub struct Clock {
    last_millis: AtomicI64,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> DateTime<Utc> {
        let mut last = self.last_millis.load(Ordering::SeqCst);
        loop {
            let candidate = Utc::now().timestamp_millis();
            let next = if candidate > last { candidate } else { last + 1 };
            match self.last_millis.compare_exchange_weak(
                last,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Utc.timestamp_millis_opt(next).single().expect("valid millis"),
                Err(actual) => last = actual,
            }
        }
    }

    /// A random, unique event id. Uniqueness relies on 128 bits of entropy,
    /// not on the clock.
    pub fn next_id(&self) -> String {
        let bytes: [u8; 16] = rand::rng().random();
        hex::encode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_strictly_monotonic_even_under_collision() {
        let clock = Clock::new();
        let mut last = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > last);
            last = next;
        }
    }
}
