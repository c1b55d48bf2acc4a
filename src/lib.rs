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

// Nidus spatio-temporal capture store
//
// Stores wireless capture records observed by distributed sensors and
// answers overlap queries over time and area:
// - Sensors stream captures over newline-delimited JSON
// - Records land in a checksummed append log with optional compression
// - A persistent interval tree indexes time ranges and locations
// - Queries resolve overlapping records in start-time order
// - Graceful shutdown checkpoints the index for fast restart

pub mod config;
pub mod error;
pub mod gateway;
pub mod index;
pub mod lifecycle;
pub mod pidfile;
pub mod proto;
pub mod protocol;
pub mod query;
pub mod record;
pub mod server;
pub mod sessions;
pub mod storage;

// Re-export main types
pub use config::{load_config, load_config_with_env, StoreConfig};
pub use error::{IndexError, QueryError, Rejection, StoreError};
pub use gateway::{IngestionGateway, RepairReport};
pub use index::IntervalIndex;
pub use lifecycle::{LifecycleController, LifecycleState, StartReport, StopOutcome};
pub use protocol::{QueryRequest, QueryResponse, SensorMessage, SensorReply, StatusResponse};
pub use query::QueryEngine;
pub use record::{BoundingBox, CaptureRecord, OverlapQuery, RawCapture, RecordId, TimeRange};
pub use server::StoreServer;
pub use sessions::{SensorRegistry, SensorStatus, SessionState};
pub use storage::{BackendFactory, CompressionLevel, CompressionType, RecordStore};
