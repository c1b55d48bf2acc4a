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

// Query engine: resolves index candidates to full records

use std::sync::Arc;
use tracing::{debug, error};

use crate::error::{QueryError, StoreError};
use crate::index::IntervalIndex;
use crate::record::{CaptureRecord, OverlapQuery, RecordId};
use crate::storage::RecordStore;

pub struct QueryEngine {
    store: Arc<dyn RecordStore>,
    index: Arc<IntervalIndex>,
}

impl QueryEngine {
    pub fn new(store: Arc<dyn RecordStore>, index: Arc<IntervalIndex>) -> Self {
        Self { store, index }
    }

    /// Records overlapping the query window, ordered by start time then id.
    ///
    /// Candidates come from a single index snapshot, so concurrent inserts
    /// are either wholly visible or not at all.
    pub async fn run(&self, query: &OverlapQuery) -> Result<Vec<CaptureRecord>, QueryError> {
        let range = query.time_range;
        if !range.is_valid() {
            return Err(QueryError::InvalidRange {
                start: range.start,
                end: range.end,
            });
        }
        if let Some(bbox) = &query.bbox {
            if !bbox.is_valid() {
                return Err(QueryError::InvalidBoundingBox(format!("{:?}", bbox)));
            }
        }

        let candidates = self.index.snapshot().query(&range, query.bbox.as_ref());
        let mut records = Vec::with_capacity(candidates.len());
        for id in candidates {
            let record = self.fetch_indexed(id).await?;
            if let Some(sensor) = &query.sensor_id {
                if &record.sensor_id != sensor {
                    continue;
                }
            }
            records.push(record);
        }

        records.sort_by_key(|r| (r.time_range.start, r.id));
        debug!("Overlap query {} matched {} records", range, records.len());
        Ok(records)
    }

    /// Single record lookup; an unknown id is `NotFound`
    pub async fn get(&self, id: RecordId) -> Result<CaptureRecord, QueryError> {
        Ok(self.store.get(id).await?)
    }

    async fn fetch_indexed(&self, id: RecordId) -> Result<CaptureRecord, QueryError> {
        match self.store.get(id).await {
            Ok(record) => Ok(record),
            Err(StoreError::NotFound(_)) => {
                error!("Index references record {} which the store does not hold", id);
                Err(QueryError::Inconsistency(id))
            }
            Err(e) => Err(e.into()),
        }
    }
}
