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

//! The per-database lock protocol (§4.7, §5): a `writeConditional` against
//! `_meta/locks/<databaseId>` stamped with owner identity and a lease
//! timestamp, released by [`Lease::release`] (or automatically on drop via
//! [`Lease::into_guard`]'s best-effort async cleanup).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;
use crate::storage::Backend;

fn lock_path(database_id: &str) -> String {
    format!("_meta/locks/{database_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockBlob {
    owner: String,
    #[serde(rename = "leasedAt")]
    leased_at: chrono::DateTime<chrono::Utc>,
}

/// A held lock. Dropping this without calling [`Lease::release`] leaves the
/// lock blob in place — callers MUST release explicitly (typically from a
/// `finally`-style guaranteed-release block), matching §4.7's "every
/// successful operation releases its lock in a guaranteed-release block,
/// even on error".
#[derive(Debug)]
pub struct Lease {
    backend: Arc<dyn Backend>,
    path: String,
}

impl Lease {
    /// Attempts to acquire the lock for `database_id`, owned by `owner`.
    /// Fails with `LOCK_HELD` if a lease already exists there.
    pub async fn acquire(backend: Arc<dyn Backend>, database_id: &str, owner: &str) -> Result<Self> {
        let path = lock_path(database_id);
        let blob = LockBlob { owner: owner.to_string(), leased_at: chrono::Utc::now() };
        let bytes = Bytes::from(serde_json::to_vec(&blob)?);
        match backend.write_conditional(&path, bytes, None).await {
            Ok(_) => Ok(Self { backend, path }),
            Err(Error::Conflict(_)) => Err(Error::LockHeld(path)),
            Err(other) => Err(other),
        }
    }

    /// Releases the lock. Best-effort: a failure here is swallowed by
    /// callers that invoke it from a cleanup path, per the spec's "lock
    /// release remains best-effort but always attempted".
    pub async fn release(self) -> Result<()> {
        self.backend.delete(&self.path).await
    }

    /// Like [`Lease::acquire`], but retries on `LockHeld` with jittered
    /// backoff up to `max_retries` times before giving up — the "transient
    /// lock contention during acquire may be retried with jittered backoff
    /// up to a bounded count" class of error §7 says is recovered locally
    /// rather than surfaced to the caller.
    pub async fn acquire_with_retry(
        backend: Arc<dyn Backend>,
        database_id: &str,
        owner: &str,
        max_retries: u32,
    ) -> Result<Self> {
        let mut attempt = 0u32;
        loop {
            match Self::acquire(backend.clone(), database_id, owner).await {
                Ok(lease) => return Ok(lease),
                Err(Error::LockHeld(path)) if attempt < max_retries => {
                    attempt += 1;
                    let base_ms = 10u64 * attempt as u64;
                    let jitter_ms = rand::rng().random_range(0..base_ms.max(1));
                    tracing::debug!(%path, attempt, "lock held, retrying after backoff");
                    tokio::time::sleep(Duration::from_millis(base_ms + jitter_ms)).await;
                }
                Err(other) => return Err(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryBackend;

    #[tokio::test]
    async fn second_acquire_fails_lock_held() {
        let backend = Arc::new(MemoryBackend::new());
        let first = Lease::acquire(backend.clone(), "db1", "alice").await.unwrap();
        let second = Lease::acquire(backend.clone(), "db1", "bob").await;
        assert!(matches!(second.unwrap_err(), Error::LockHeld(_)));
        first.release().await.unwrap();
        assert!(Lease::acquire(backend, "db1", "bob").await.is_ok());
    }

    #[tokio::test]
    async fn acquire_with_retry_succeeds_once_the_holder_releases() {
        let backend = Arc::new(MemoryBackend::new());
        let first = Lease::acquire(backend.clone(), "db1", "alice").await.unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            first.release().await.unwrap();
        });

        let second = Lease::acquire_with_retry(backend, "db1", "bob", 10).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn acquire_with_retry_gives_up_after_the_budget() {
        let backend = Arc::new(MemoryBackend::new());
        let _first = Lease::acquire(backend.clone(), "db1", "alice").await.unwrap();
        let err = Lease::acquire_with_retry(backend, "db1", "bob", 2).await.unwrap_err();
        assert!(matches!(err, Error::LockHeld(_)));
    }
}
