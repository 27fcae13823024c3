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

//! StratumDB: an embeddable, event-sourced entity store.
//!
//! An append-only [`eventlog::Event`] log is the single source of truth;
//! [`entity::store::EntityStore`] materializes it into a queryable current
//! view and answers `asOf` time-travel reads by replaying that log
//! ([`timetravel`]). [`commit::dag`] snapshots database state into a
//! content-addressed, Git-like commit graph. [`storage`] abstracts the
//! underlying byte store so the same engine runs against a local
//! filesystem, in memory, or a read-only HTTP endpoint, and [`sync`]
//! reconciles two such backends via a pure manifest diff.
//!
//! [`db::Database`] is the facade that wires all of the above together.

pub mod commit;
pub mod config;
pub mod content_hash;
pub mod db;
pub mod entity;
pub mod error;
pub mod eventlog;
pub mod flush;
pub mod storage;
pub mod sync;
pub mod timetravel;

pub use db::Database;
pub use error::Error;
pub use error::Result;
