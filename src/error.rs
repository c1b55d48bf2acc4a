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

// Error taxonomy for ingestion, storage and query paths

use crate::record::RecordId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a submission was refused. Nothing is written for a rejected submission.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    #[error("sensor id must not be empty")]
    EmptySensorId,

    #[error("time range [{start}, {end}) is empty or inverted")]
    InvalidTimeRange { start: i64, end: i64 },

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("invalid location: {detail}")]
    InvalidLocation { detail: String },

    #[error("store is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("submission rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("storage I/O failed: {0}")]
    StorageIo(#[from] std::io::Error),

    #[error("record {id} is stored but not indexed after {attempts} attempts: {reason}")]
    IndexInconsistency {
        id: RecordId,
        attempts: u32,
        reason: String,
    },

    #[error("record {0} not found")]
    NotFound(RecordId),

    #[error("corrupt data at offset {offset}: {detail}")]
    Corrupt { offset: u64, detail: String },

    #[error("payload codec failed: {0}")]
    Codec(String),
}

impl StoreError {
    /// Errors worth another attempt at the storage boundary
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::StorageIo(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("interval index is sealed")]
    Sealed,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query range [{start}, {end}) is empty or inverted")]
    InvalidRange { start: i64, end: i64 },

    #[error("invalid bounding box: {0}")]
    InvalidBoundingBox(String),

    #[error("index references record {0} which is missing from the store")]
    Inconsistency(RecordId),

    #[error(transparent)]
    Store(#[from] StoreError),
}
