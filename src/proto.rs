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

// Protobuf messages for on-disk state (record log frames and index checkpoints)

use crate::record::{BoundingBox, IndexEntry, TimeRange};

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct Extent {
    #[prost(double, tag = "1")]
    pub min_lon: f64,
    #[prost(double, tag = "2")]
    pub min_lat: f64,
    #[prost(double, tag = "3")]
    pub max_lon: f64,
    #[prost(double, tag = "4")]
    pub max_lat: f64,
}

impl From<BoundingBox> for Extent {
    fn from(b: BoundingBox) -> Self {
        Self {
            min_lon: b.min_lon,
            min_lat: b.min_lat,
            max_lon: b.max_lon,
            max_lat: b.max_lat,
        }
    }
}

impl From<Extent> for BoundingBox {
    fn from(e: Extent) -> Self {
        BoundingBox::new(e.min_lon, e.min_lat, e.max_lon, e.max_lat)
    }
}

/// One record in the append log
#[derive(Clone, PartialEq, prost::Message)]
pub struct LogRecord {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub sensor_id: String,
    #[prost(int64, tag = "3")]
    pub start_us: i64,
    #[prost(int64, tag = "4")]
    pub end_us: i64,
    #[prost(message, optional, tag = "5")]
    pub location: Option<Extent>,
    /// Codec tag, see `storage::codec`
    #[prost(uint32, tag = "6")]
    pub codec: u32,
    #[prost(uint64, tag = "7")]
    pub raw_len: u64,
    #[prost(bytes = "vec", tag = "8")]
    pub payload: Vec<u8>,
}

impl LogRecord {
    pub fn index_entry(&self) -> IndexEntry {
        IndexEntry {
            record_id: self.id,
            time_range: TimeRange::new(self.start_us, self.end_us),
            location: self.location.map(BoundingBox::from),
        }
    }
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct CheckpointEntry {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(int64, tag = "2")]
    pub start_us: i64,
    #[prost(int64, tag = "3")]
    pub end_us: i64,
    #[prost(message, optional, tag = "4")]
    pub location: Option<Extent>,
}

impl From<&IndexEntry> for CheckpointEntry {
    fn from(entry: &IndexEntry) -> Self {
        Self {
            id: entry.record_id,
            start_us: entry.time_range.start,
            end_us: entry.time_range.end,
            location: entry.location.map(Extent::from),
        }
    }
}

impl From<CheckpointEntry> for IndexEntry {
    fn from(entry: CheckpointEntry) -> Self {
        IndexEntry {
            record_id: entry.id,
            time_range: TimeRange::new(entry.start_us, entry.end_us),
            location: entry.location.map(BoundingBox::from),
        }
    }
}

/// Persisted copy of the interval index and the log it covers
#[derive(Clone, PartialEq, prost::Message)]
pub struct IndexCheckpoint {
    #[prost(uint64, tag = "1")]
    pub log_position: u64,
    #[prost(int64, tag = "2")]
    pub written_at_us: i64,
    #[prost(message, repeated, tag = "3")]
    pub entries: Vec<CheckpointEntry>,
    /// Id of the record log the entries were built from; empty if none
    #[prost(string, tag = "4")]
    pub log_id: String,
}
