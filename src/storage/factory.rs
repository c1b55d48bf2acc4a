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

// Backend factory for creating record stores from configuration

use super::backend::RecordStore;
use super::log::LogBackend;
use super::memory::MemoryBackend;
use crate::config::StorageConfig;
use anyhow::{bail, Context, Result};
use std::sync::Arc;

pub struct BackendFactory;

impl BackendFactory {
    /// Create record store from configuration
    pub fn create(config: &StorageConfig) -> Result<Arc<dyn RecordStore>> {
        match config.backend.as_str() {
            "log" => {
                let backend_config = config
                    .backend_config
                    .as_log()
                    .ok_or_else(|| anyhow::anyhow!("Log config missing"))?;

                let backend = LogBackend::new(backend_config.clone())
                    .context("Failed to open record log")?;
                Ok(Arc::new(backend))
            }

            "memory" => Ok(Arc::new(MemoryBackend::new())),

            unknown => bail!(
                "Unknown storage backend: '{}'. Supported: log, memory",
                unknown
            ),
        }
    }
}
