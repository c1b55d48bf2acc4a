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

// Capture record data model shared by the index, the store and the gateway

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Store-assigned record identifier. Ids start at 1; 0 means "not yet assigned".
pub type RecordId = u64;

/// Sentinel for a record that has not been through id assignment
pub const UNASSIGNED_ID: RecordId = 0;

/// Half-open observation window `[start, end)` in microseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Instantaneous event, widened to the smallest non-empty range
    pub fn instant(at: i64) -> Self {
        Self {
            start: at,
            end: at.saturating_add(1),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    /// Non-empty intersection of two half-open ranges
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn duration_us(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Axis-aligned extent in longitude/latitude degrees.
///
/// A point fix is a degenerate box with `min == max`. Boxes are closed, so
/// two boxes sharing only an edge intersect.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    pub fn point(lon: f64, lat: f64) -> Self {
        Self::new(lon, lat, lon, lat)
    }

    pub fn is_point(&self) -> bool {
        self.min_lon == self.max_lon && self.min_lat == self.max_lat
    }

    pub fn is_valid(&self) -> bool {
        [self.min_lon, self.min_lat, self.max_lon, self.max_lat]
            .iter()
            .all(|v| v.is_finite())
            && self.min_lon <= self.max_lon
            && self.min_lat <= self.max_lat
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_lon <= other.max_lon
            && other.min_lon <= self.max_lon
            && self.min_lat <= other.max_lat
            && other.min_lat <= self.max_lat
    }

    /// Smallest box covering both
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min_lon: self.min_lon.min(other.min_lon),
            min_lat: self.min_lat.min(other.min_lat),
            max_lon: self.max_lon.max(other.max_lon),
            max_lat: self.max_lat.max(other.max_lat),
        }
    }
}

/// One observed wireless frame or event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub id: RecordId,
    pub sensor_id: String,
    pub time_range: TimeRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<BoundingBox>,
    #[serde(with = "crate::protocol::base64_payload")]
    pub payload: Bytes,
}

impl CaptureRecord {
    pub fn index_entry(&self) -> IndexEntry {
        IndexEntry {
            record_id: self.id,
            time_range: self.time_range,
            location: self.location,
        }
    }
}

/// The (time range, location, id) triple kept by the interval index
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexEntry {
    pub record_id: RecordId,
    pub time_range: TimeRange,
    pub location: Option<BoundingBox>,
}

impl IndexEntry {
    /// Tree ordering key; the id makes entries with equal starts distinct
    pub fn key(&self) -> (i64, RecordId) {
        (self.time_range.start, self.record_id)
    }

    pub fn matches(&self, range: &TimeRange, bbox: Option<&BoundingBox>) -> bool {
        if !self.time_range.overlaps(range) {
            return false;
        }
        match bbox {
            None => true,
            Some(b) => self.location.is_some_and(|loc| loc.intersects(b)),
        }
    }
}

/// A capture as submitted by a sensor, before validation and normalization
#[derive(Debug, Clone, PartialEq)]
pub struct RawCapture {
    pub start_us: i64,
    /// Absent for instantaneous events
    pub end_us: Option<i64>,
    pub location: Option<BoundingBox>,
    pub payload: Bytes,
}

impl RawCapture {
    pub fn new(start_us: i64, end_us: i64, payload: impl Into<Bytes>) -> Self {
        Self {
            start_us,
            end_us: Some(end_us),
            location: None,
            payload: payload.into(),
        }
    }

    pub fn instant(at_us: i64, payload: impl Into<Bytes>) -> Self {
        Self {
            start_us: at_us,
            end_us: None,
            location: None,
            payload: payload.into(),
        }
    }

    pub fn with_location(mut self, location: BoundingBox) -> Self {
        self.location = Some(location);
        self
    }

    pub fn time_range(&self) -> TimeRange {
        match self.end_us {
            Some(end) => TimeRange::new(self.start_us, end),
            None => TimeRange::instant(self.start_us),
        }
    }
}

/// Overlap search over time, optionally narrowed by area and sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlapQuery {
    pub time_range: TimeRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_id: Option<String>,
}

impl OverlapQuery {
    pub fn new(time_range: TimeRange) -> Self {
        Self {
            time_range,
            bbox: None,
            sensor_id: None,
        }
    }

    pub fn with_bbox(mut self, bbox: BoundingBox) -> Self {
        self.bbox = Some(bbox);
        self
    }

    pub fn with_sensor(mut self, sensor_id: impl Into<String>) -> Self {
        self.sensor_id = Some(sensor_id.into());
        self
    }
}
