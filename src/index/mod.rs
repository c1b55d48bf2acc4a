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

// Interval index module
//
// Holds one entry per capture record keyed by time range, with location
// pruning, and publishes immutable snapshots so queries never wait on
// inserts.

pub mod checkpoint;
pub mod tree;

pub use checkpoint::{Checkpoint, CheckpointFile};
pub use tree::IntervalTree;

use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::error::IndexError;
use crate::record::{BoundingBox, IndexEntry, RecordId, TimeRange};

/// Concurrent interval index.
///
/// Writers serialize on a mutex and publish a new tree version with a single
/// pointer swap; readers load the current version without locking.
pub struct IntervalIndex {
    current: ArcSwap<IntervalTree>,
    writer: Mutex<()>,
    sealed: AtomicBool,
}

impl Default for IntervalIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl IntervalIndex {
    pub fn new() -> Self {
        Self::from_tree(IntervalTree::new())
    }

    pub fn from_entries(entries: Vec<IndexEntry>) -> Self {
        Self::from_tree(IntervalTree::from_entries(entries))
    }

    fn from_tree(tree: IntervalTree) -> Self {
        Self {
            current: ArcSwap::from_pointee(tree),
            writer: Mutex::new(()),
            sealed: AtomicBool::new(false),
        }
    }

    /// Add one entry. Returns `Ok(false)` if the record is already indexed.
    pub fn insert(
        &self,
        record_id: RecordId,
        time_range: TimeRange,
        location: Option<BoundingBox>,
    ) -> Result<bool, IndexError> {
        self.insert_entry(IndexEntry {
            record_id,
            time_range,
            location,
        })
    }

    pub fn insert_entry(&self, entry: IndexEntry) -> Result<bool, IndexError> {
        if self.is_sealed() {
            return Err(IndexError::Sealed);
        }
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        // seal() may have won the race for the lock
        if self.is_sealed() {
            return Err(IndexError::Sealed);
        }
        let tree = self.current.load();
        match tree.insert(entry) {
            Some(next) => {
                self.current.store(Arc::new(next));
                Ok(true)
            }
            None => {
                debug!("Record {} already indexed", entry.record_id);
                Ok(false)
            }
        }
    }

    /// Bulk insert used by recovery; existing keys are skipped
    pub fn extend(&self, entries: Vec<IndexEntry>) -> Result<usize, IndexError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_sealed() {
            return Err(IndexError::Sealed);
        }
        let mut tree = IntervalTree::clone(&self.current.load());
        let mut added = 0;
        for entry in entries {
            if let Some(next) = tree.insert(entry) {
                tree = next;
                added += 1;
            }
        }
        self.current.store(Arc::new(tree));
        Ok(added)
    }

    /// Ids of entries overlapping `range` and, when given, intersecting `bbox`.
    /// Order is not part of the contract.
    pub fn query_overlap(&self, range: &TimeRange, bbox: Option<&BoundingBox>) -> Vec<RecordId> {
        self.current.load().query(range, bbox)
    }

    pub fn contains(&self, entry: &IndexEntry) -> bool {
        self.current
            .load()
            .contains(entry.time_range.start, entry.record_id)
    }

    /// The currently published tree version
    pub fn snapshot(&self) -> Arc<IntervalTree> {
        self.current.load_full()
    }

    /// Entries of the current snapshot in `(start, id)` order
    pub fn entries(&self) -> Vec<IndexEntry> {
        self.current.load().entries()
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further inserts. Taking the writer lock waits out any insert
    /// already in progress.
    pub fn seal(&self) {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.sealed.store(true, Ordering::Release);
    }

    pub fn unseal(&self) {
        self.sealed.store(false, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }
}
