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

//! The crate-wide error taxonomy.
//!
//! Every fallible operation in the crate returns [`Error`], whose variants
//! correspond one-to-one with the error codes external adapters (HTTP, RPC,
//! MCP) are expected to translate into protocol-specific statuses.

use std::time::Duration;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// The error taxonomy surfaced to callers and, ultimately, to external
/// adapters.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict at {0}")]
    Conflict(String),

    #[error("version conflict for {id}: expected {expected}, found {found}")]
    VersionConflict { id: String, expected: u64, found: u64 },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("lock held: {0}")]
    LockHeld(String),

    #[error("hash mismatch for {path}: expected {expected}, computed {computed}")]
    HashMismatch {
        path: String,
        expected: String,
        computed: String,
    },

    #[error("backend is read-only")]
    ReadOnly,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The stable taxonomy code named in the external interface contract.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION",
            Self::Conflict(_) => "CONFLICT",
            Self::VersionConflict { .. } => "VERSION_CONFLICT",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Network(_) => "NETWORK",
            Self::Timeout(_) => "TIMEOUT",
            Self::LockHeld(_) => "LOCK_HELD",
            Self::HashMismatch { .. } => "HASH_MISMATCH",
            Self::ReadOnly => "READ_ONLY",
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization error: {err}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(err.to_string())
        } else {
            Self::Internal(err.to_string())
        }
    }
}
