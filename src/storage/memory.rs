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

// Volatile in-memory backend. Positions are insertion sequence numbers.

use super::backend::{RecordStore, Recovery};
use crate::error::{Result, StoreError};
use crate::record::{CaptureRecord, RecordId, UNASSIGNED_ID};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Default)]
pub struct MemoryBackend {
    records: DashMap<RecordId, (u64, CaptureRecord)>,
    sequence: AtomicU64,
    next_id: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            sequence: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl RecordStore for MemoryBackend {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn recover(&self, from_position: u64) -> Result<Recovery> {
        let mut located: Vec<(u64, crate::record::IndexEntry)> = self
            .records
            .iter()
            .filter(|r| r.value().0 >= from_position)
            .map(|r| (r.value().0, r.value().1.index_entry()))
            .collect();
        located.sort_by_key(|(seq, _)| *seq);

        Ok(Recovery {
            entries: located.into_iter().map(|(_, e)| e).collect(),
            records: self.records.len(),
            position: self.position(),
            truncated_bytes: 0,
            max_id: self.records.iter().map(|r| *r.key()).max().unwrap_or(0),
        })
    }

    fn allocate_id(&self) -> RecordId {
        // A default-constructed backend starts at 0, which is reserved
        self.next_id.fetch_max(1, Ordering::AcqRel);
        self.next_id.fetch_add(1, Ordering::AcqRel)
    }

    async fn put(&self, mut record: CaptureRecord) -> Result<RecordId> {
        if record.id == UNASSIGNED_ID {
            record.id = self.allocate_id();
        }
        let id = record.id;
        match self.records.entry(id) {
            Entry::Occupied(_) => Ok(id),
            Entry::Vacant(slot) => {
                let seq = self.sequence.fetch_add(1, Ordering::AcqRel);
                slot.insert((seq, record));
                self.next_id.fetch_max(id + 1, Ordering::AcqRel);
                debug!("Stored record {} at sequence {}", id, seq);
                Ok(id)
            }
        }
    }

    async fn get(&self, id: RecordId) -> Result<CaptureRecord> {
        self.records
            .get(&id)
            .map(|r| r.value().1.clone())
            .ok_or(StoreError::NotFound(id))
    }

    fn contains(&self, id: RecordId) -> bool {
        self.records.contains_key(&id)
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn position(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn backend_type(&self) -> &str {
        "memory"
    }
}
