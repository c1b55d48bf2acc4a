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

// Configuration types for nidus-store

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::storage::codec::{CompressionLevel, CompressionType};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener addresses for the two stream protocols
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_sensor_listen")]
    pub sensor_listen: String,

    #[serde(default = "default_query_listen")]
    pub query_listen: String,

    /// Longest accepted protocol line; longer lines are skipped with an error reply
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sensor_listen: default_sensor_listen(),
            query_listen: default_query_listen(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

/// Storage configuration with backend selection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Backend type: "log" or "memory"
    pub backend: String,

    /// Backend-specific configuration
    #[serde(flatten)]
    pub backend_config: BackendConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "log".to_string(),
            backend_config: BackendConfig::Log {
                log: LogConfig::default(),
            },
        }
    }
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self {
            backend: "memory".to_string(),
            backend_config: BackendConfig::Memory {
                memory: MemoryConfig::default(),
            },
        }
    }

    pub fn log(log: LogConfig) -> Self {
        Self {
            backend: "log".to_string(),
            backend_config: BackendConfig::Log { log },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum BackendConfig {
    Log {
        #[serde(rename = "log")]
        log: LogConfig,
    },
    Memory {
        #[serde(rename = "memory")]
        memory: MemoryConfig,
    },
}

impl BackendConfig {
    pub fn as_log(&self) -> Option<&LogConfig> {
        match self {
            BackendConfig::Log { log } => Some(log),
            _ => None,
        }
    }

    pub fn as_log_mut(&mut self) -> Option<&mut LogConfig> {
        match self {
            BackendConfig::Log { log } => Some(log),
            _ => None,
        }
    }

    pub fn as_memory(&self) -> Option<&MemoryConfig> {
        match self {
            BackendConfig::Memory { memory } => Some(memory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    pub data_dir: PathBuf,

    /// fsync after every append
    #[serde(default = "default_true")]
    pub fsync: bool,

    #[serde(default)]
    pub compression: CompressionConfig,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/nidus"),
            fsync: true,
            compression: CompressionConfig::default(),
        }
    }
}

impl LogConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("records.log")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join("index.ckpt")
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MemoryConfig {}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompressionConfig {
    #[serde(default)]
    pub r#type: CompressionType,

    /// 0-4
    #[serde(default = "default_compression_level")]
    pub level: u8,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            r#type: CompressionType::None,
            level: default_compression_level(),
        }
    }
}

impl CompressionConfig {
    pub fn level(&self) -> CompressionLevel {
        CompressionLevel::from_u8(self.level).unwrap_or_default()
    }
}

/// Gateway validation limits and retry budgets
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    #[serde(default = "default_store_retries")]
    pub store_retries: u32,

    #[serde(default = "default_index_retries")]
    pub index_retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            store_retries: default_store_retries(),
            index_retries: default_index_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl IngestConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexConfig {
    /// Write an index checkpoint on graceful stop
    #[serde(default = "default_true")]
    pub checkpoint_on_stop: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            checkpoint_on_stop: true,
        }
    }
}

/// Shutdown pacing and process bookkeeping
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_stop_attempts")]
    pub stop_attempts: u32,

    #[serde(default = "default_stop_interval_ms")]
    pub stop_interval_ms: u64,

    #[serde(default)]
    pub pid_file: Option<PathBuf>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stop_attempts: default_stop_attempts(),
            stop_interval_ms: default_stop_interval_ms(),
            pid_file: None,
        }
    }
}

impl LifecycleConfig {
    pub fn stop_interval(&self) -> Duration {
        Duration::from_millis(self.stop_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"

    #[serde(default = "default_log_format")]
    pub format: String, // "text", "json"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_sensor_listen() -> String { "0.0.0.0:2526".to_string() }
fn default_query_listen() -> String { "127.0.0.1:2527".to_string() }
fn default_max_line_bytes() -> usize { 4 * 1024 * 1024 }
fn default_true() -> bool { true }
fn default_compression_level() -> u8 { 2 }
fn default_max_payload_bytes() -> usize { 1024 * 1024 }
fn default_store_retries() -> u32 { 3 }
fn default_index_retries() -> u32 { 3 }
fn default_retry_backoff_ms() -> u64 { 100 }
fn default_stop_attempts() -> u32 { 10 }
fn default_stop_interval_ms() -> u64 { 1000 }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "text".to_string() }
