// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Record store trait

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::record::{CaptureRecord, IndexEntry, RecordId};

/// Outcome of replaying the store at startup
#[derive(Debug, Clone, Default)]
pub struct Recovery {
    /// Index entries for records found at or after the requested position
    pub entries: Vec<IndexEntry>,
    /// Records found in the whole store
    pub records: usize,
    /// Position just past the last intact record
    pub position: u64,
    /// Bytes of torn tail dropped during replay
    pub truncated_bytes: u64,
    pub max_id: RecordId,
}

/// Durable storage of full capture records
///
/// Implementations must make a record visible to `get` only once it is
/// completely written, and must tolerate concurrent `put`s of distinct ids
/// alongside unlimited concurrent `get`s.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Prepare directories/files. Must be called before any other method.
    async fn initialize(&self) -> Result<()>;

    /// Rebuild in-memory lookup state from durable storage and return index
    /// entries for every record at or after `from_position`.
    async fn recover(&self, from_position: u64) -> Result<Recovery>;

    /// Reserve the next record id
    fn allocate_id(&self) -> RecordId;

    /// Write `record` durably. A record without an id gets one allocated.
    /// Writing an id that is already stored is a no-op.
    async fn put(&self, record: CaptureRecord) -> Result<RecordId>;

    /// Write with retry logic (optional, has default implementation)
    ///
    /// Only I/O failures are retried; the delay doubles per attempt and is
    /// capped at 30 seconds.
    async fn put_with_retry(
        &self,
        record: CaptureRecord,
        max_retries: u32,
        initial_delay: Duration,
    ) -> Result<RecordId> {
        use tokio::time::sleep;
        use tracing::{error, info, warn};

        let mut attempt = 0;
        let mut delay = initial_delay;

        loop {
            match self.put(record.clone()).await {
                Ok(id) => {
                    if attempt > 0 {
                        info!("Stored record {} after {} retries", id, attempt);
                    }
                    return Ok(id);
                }
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    warn!(
                        "Store write for record {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        record.id,
                        attempt + 1,
                        max_retries,
                        e,
                        delay
                    );
                    sleep(delay).await;
                    delay *= 2;
                    delay = delay.min(Duration::from_secs(30));
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        "Store write for record {} failed after {} attempts: {}",
                        record.id,
                        attempt + 1,
                        e
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Fetch a record; `NotFound` when the id was never stored
    async fn get(&self, id: RecordId) -> Result<CaptureRecord>;

    fn contains(&self, id: RecordId) -> bool;

    /// Make every acknowledged write durable
    async fn flush(&self) -> Result<()>;

    /// Current end position; records written later sort after it
    fn position(&self) -> u64;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identity of the durable storage, fixed when it was first created.
    /// `None` for stores that do not survive a restart.
    fn store_id(&self) -> Option<Uuid> {
        None
    }

    /// Health check
    async fn health_check(&self) -> Result<bool>;

    /// Get backend type identifier
    fn backend_type(&self) -> &str;
}
