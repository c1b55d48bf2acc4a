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

// Wire messages for the sensor and query connections.
//
// Both protocols are newline-delimited JSON: one message per line, one
// reply line per message. Payload bytes travel as base64 strings.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Rejection;
use crate::lifecycle::LifecycleState;
use crate::record::{BoundingBox, CaptureRecord, OverlapQuery, RawCapture, RecordId, TimeRange};
use crate::sessions::SensorStatus;

/// Serde adapter encoding payload bytes as standard base64
pub mod base64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Message sent by a sensor daemon on its stream connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SensorMessage {
    /// Opens a session; captures without their own sensor id inherit this one
    Hello { sensor_id: String },
    Capture(CaptureMessage),
    /// Orderly end of the session
    Bye,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_id: Option<String>,
    pub start_us: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_us: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<BoundingBox>,
    #[serde(default, with = "base64_payload")]
    pub payload: Bytes,
}

impl CaptureMessage {
    pub fn into_raw(self) -> (Option<String>, RawCapture) {
        let raw = RawCapture {
            start_us: self.start_us,
            end_us: self.end_us,
            location: self.location,
            payload: self.payload,
        };
        (self.sensor_id, raw)
    }
}

/// Per-message reply on a sensor connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SensorReply {
    Ready {
        session_id: Uuid,
    },
    Accepted {
        record_id: RecordId,
    },
    Rejected {
        message: String,
        rejection: Rejection,
    },
    Error {
        message: String,
    },
    Goodbye {
        accepted: u64,
        rejected: u64,
    },
}

impl SensorReply {
    pub fn rejected(rejection: Rejection) -> Self {
        SensorReply::Rejected {
            message: rejection.to_string(),
            rejection,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        SensorReply::Error {
            message: message.into(),
        }
    }
}

/// Request sent by an analysis client on a query connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QueryRequest {
    Overlap {
        start_us: i64,
        end_us: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bbox: Option<BoundingBox>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sensor_id: Option<String>,
    },
    Get {
        record_id: RecordId,
    },
    Status,
}

impl QueryRequest {
    /// The overlap query this request describes, if it is one
    pub fn as_overlap(&self) -> Option<OverlapQuery> {
        match self {
            QueryRequest::Overlap {
                start_us,
                end_us,
                bbox,
                sensor_id,
            } => Some(OverlapQuery {
                time_range: TimeRange::new(*start_us, *end_us),
                bbox: *bbox,
                sensor_id: sensor_id.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QueryResponse {
    /// Matches ordered by start time then id; an empty list is a normal answer
    Records {
        count: usize,
        records: Vec<CaptureRecord>,
    },
    Record {
        record: CaptureRecord,
    },
    Status(StatusResponse),
    Error {
        message: String,
    },
}

impl QueryResponse {
    pub fn records(records: Vec<CaptureRecord>) -> Self {
        QueryResponse::Records {
            count: records.len(),
            records,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        QueryResponse::Error {
            message: message.into(),
        }
    }
}

/// Snapshot of store health for the status request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub state: LifecycleState,
    pub backend: String,
    pub records: usize,
    pub index_entries: usize,
    pub pending_repairs: usize,
    pub log_position: u64,
    #[serde(default)]
    pub sensors: Vec<SensorStatus>,
    pub reported_at: DateTime<Utc>,
}
