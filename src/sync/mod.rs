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

//! Manifest-driven sync: [`manifest`] builds and diffs per-database file
//! manifests; [`lock`] implements the cross-process lock protocol;
//! [`engine`] orchestrates push/pull/bidirectional sync over both.

pub mod engine;
pub mod lock;
pub mod manifest;
