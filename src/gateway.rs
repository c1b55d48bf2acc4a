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

// Ingestion gateway
//
// Validates raw captures and commits them in two steps: durable store
// write, then index insert. The store is the source of truth; a record
// whose index insert exhausts its retries is queued for repair and is in
// any case re-indexed by log replay on the next start.

use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::IngestConfig;
use crate::error::{Rejection, Result, StoreError};
use crate::index::IntervalIndex;
use crate::record::{CaptureRecord, IndexEntry, RawCapture, RecordId};
use crate::storage::RecordStore;

/// A stored record that is missing from the index
#[derive(Debug, Clone)]
pub struct RepairTask {
    pub entry: IndexEntry,
    pub attempts: u32,
    pub reason: String,
}

/// Result of one pass over the repair queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub repaired: usize,
    pub requeued: usize,
}

/// Decrements the in-flight counter when a submission finishes, however it ends
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct IngestionGateway {
    store: Arc<dyn RecordStore>,
    index: Arc<IntervalIndex>,
    config: IngestConfig,
    accepting: AtomicBool,
    in_flight: AtomicUsize,
    repairs: SegQueue<RepairTask>,
}

impl IngestionGateway {
    pub fn new(
        store: Arc<dyn RecordStore>,
        index: Arc<IntervalIndex>,
        config: IngestConfig,
    ) -> Self {
        Self {
            store,
            index,
            config,
            accepting: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            repairs: SegQueue::new(),
        }
    }

    /// Check a capture without touching store or index
    pub fn validate(
        &self,
        sensor_id: &str,
        raw: &RawCapture,
    ) -> std::result::Result<(), Rejection> {
        if sensor_id.trim().is_empty() {
            return Err(Rejection::EmptySensorId);
        }
        let range = raw.time_range();
        if !range.is_valid() {
            return Err(Rejection::InvalidTimeRange {
                start: range.start,
                end: range.end,
            });
        }
        if raw.payload.len() > self.config.max_payload_bytes {
            return Err(Rejection::PayloadTooLarge {
                size: raw.payload.len(),
                limit: self.config.max_payload_bytes,
            });
        }
        if let Some(location) = &raw.location {
            if !location.is_valid() {
                return Err(Rejection::InvalidLocation {
                    detail: format!(
                        "[{}, {}] x [{}, {}] is not a finite box with min <= max",
                        location.min_lon, location.max_lon, location.min_lat, location.max_lat
                    ),
                });
            }
        }
        Ok(())
    }

    /// Validate, store and index one capture.
    ///
    /// Returns the assigned id once the record is durable and queryable.
    /// `IndexInconsistency` means the record is durable but not yet
    /// queryable; it has been queued for repair.
    pub async fn submit(&self, sensor_id: &str, raw: RawCapture) -> Result<RecordId> {
        let _in_flight = InFlight::enter(&self.in_flight);
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Rejection::ShuttingDown.into());
        }

        if let Err(rejection) = self.validate(sensor_id, &raw) {
            debug!("Rejected capture from '{}': {}", sensor_id, rejection);
            return Err(rejection.into());
        }

        let record = CaptureRecord {
            id: self.store.allocate_id(),
            sensor_id: sensor_id.to_string(),
            time_range: raw.time_range(),
            location: raw.location,
            payload: raw.payload,
        };
        let entry = record.index_entry();

        let id = self
            .store
            .put_with_retry(record, self.config.store_retries, self.config.retry_backoff())
            .await?;

        self.index_with_retry(entry).await?;
        debug!("Committed record {} from '{}' at {}", id, sensor_id, entry.time_range);
        Ok(id)
    }

    async fn index_with_retry(&self, entry: IndexEntry) -> Result<()> {
        let mut attempt = 0;
        let mut delay = self.config.retry_backoff();

        loop {
            match self.index.insert_entry(entry) {
                Ok(_) => return Ok(()),
                Err(e) if attempt < self.config.index_retries => {
                    warn!(
                        "Index insert for record {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        entry.record_id,
                        attempt + 1,
                        self.config.index_retries,
                        e,
                        delay
                    );
                    sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(30));
                    attempt += 1;
                }
                Err(e) => {
                    let attempts = attempt + 1;
                    error!(
                        "Record {} stored but unindexed after {} attempts: {}; queued for repair",
                        entry.record_id, attempts, e
                    );
                    self.repairs.push(RepairTask {
                        entry,
                        attempts,
                        reason: e.to_string(),
                    });
                    return Err(StoreError::IndexInconsistency {
                        id: entry.record_id,
                        attempts,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// Re-index every queued record from its stored copy. Tasks that still
    /// fail go back on the queue.
    pub async fn repair(&self) -> RepairReport {
        let mut report = RepairReport::default();
        let mut retry = Vec::new();

        while let Some(mut task) = self.repairs.pop() {
            let entry = match self.store.get(task.entry.record_id).await {
                Ok(record) => record.index_entry(),
                Err(e) => {
                    warn!("Repair could not read record {}: {}", task.entry.record_id, e);
                    task.attempts += 1;
                    task.reason = e.to_string();
                    retry.push(task);
                    continue;
                }
            };
            match self.index.insert_entry(entry) {
                Ok(_) => {
                    info!("Repaired index entry for record {}", entry.record_id);
                    report.repaired += 1;
                }
                Err(e) => {
                    task.attempts += 1;
                    task.reason = e.to_string();
                    retry.push(task);
                }
            }
        }

        report.requeued = retry.len();
        for task in retry {
            self.repairs.push(task);
        }
        if report.requeued > 0 {
            warn!("{} index repairs still pending", report.requeued);
        }
        report
    }

    pub fn pending_repairs(&self) -> usize {
        self.repairs.len()
    }

    /// Refuse further submissions. Submissions already past the check finish.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn resume_accepting(&self) {
        self.accepting.store(true, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }
}
