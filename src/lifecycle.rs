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

// Lifecycle controller
//
// Owns the store, index, gateway, query engine and sensor registry, and
// drives them through Starting -> Running -> Draining -> Stopped.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::StoreConfig;
use crate::gateway::IngestionGateway;
use crate::index::{CheckpointFile, IntervalIndex};
use crate::protocol::StatusResponse;
use crate::query::QueryEngine;
use crate::sessions::SensorRegistry;
use crate::storage::{BackendFactory, RecordStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Draining => "draining",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopOutcome {
    /// In-flight work drained; store flushed and index checkpointed
    Graceful,
    /// In-flight work never drained; next start replays the log
    Forced,
}

/// Recovery statistics reported by `start`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartReport {
    pub records: usize,
    pub index_entries: usize,
    /// Entries taken from the checkpoint rather than the log
    pub from_checkpoint: usize,
    /// Entries replayed from the log
    pub replayed: usize,
    pub truncated_bytes: u64,
    pub full_replay: bool,
}

pub struct LifecycleController {
    config: StoreConfig,
    store: Arc<dyn RecordStore>,
    index: Arc<IntervalIndex>,
    gateway: Arc<IngestionGateway>,
    query: Arc<QueryEngine>,
    sessions: Arc<SensorRegistry>,
    checkpoint: Option<CheckpointFile>,
    state: Mutex<LifecycleState>,
    transition: tokio::sync::Mutex<()>,
}

impl LifecycleController {
    /// Build the components from configuration. Nothing is read from disk
    /// until `start`.
    pub fn new(config: StoreConfig) -> Result<Self> {
        let store =
            BackendFactory::create(&config.storage).context("Failed to create record store")?;
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: StoreConfig, store: Arc<dyn RecordStore>) -> Self {
        let index = Arc::new(IntervalIndex::new());
        let gateway = Arc::new(IngestionGateway::new(
            store.clone(),
            index.clone(),
            config.ingest.clone(),
        ));
        gateway.stop_accepting();
        let query = Arc::new(QueryEngine::new(store.clone(), index.clone()));

        let checkpoint = match config.storage.backend_config.as_log() {
            Some(log) if store.backend_type() == "log" => {
                Some(CheckpointFile::new(log.checkpoint_path()))
            }
            _ => None,
        };

        Self {
            config,
            store,
            index,
            gateway,
            query,
            sessions: Arc::new(SensorRegistry::new()),
            checkpoint,
            state: Mutex::new(LifecycleState::Starting),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    /// Open the store, rebuild the index and begin accepting submissions
    pub async fn start(&self) -> Result<StartReport> {
        let _transition = self.transition.lock().await;
        if self.state() != LifecycleState::Starting {
            bail!("Cannot start from state {}", self.state());
        }

        info!("Starting store with {} backend", self.store.backend_type());
        self.store.initialize().await.context("Failed to initialize record store")?;

        let mut report = StartReport::default();
        let mut from_position = 0;
        let mut checkpointed = Vec::new();

        if let Some(file) = &self.checkpoint {
            match file.load().await {
                Ok(Some(cp)) if cp.log_id != self.store.store_id() => warn!(
                    "Index checkpoint belongs to log {:?}, not {:?}; replaying the full log",
                    cp.log_id,
                    self.store.store_id()
                ),
                Ok(Some(cp)) if cp.log_position <= self.store.position() => {
                    info!(
                        "Loaded index checkpoint with {} entries covering log position {}",
                        cp.entries.len(),
                        cp.log_position
                    );
                    from_position = cp.log_position;
                    checkpointed = cp.entries;
                }
                Ok(Some(cp)) => warn!(
                    "Index checkpoint covers position {} beyond log end {}; replaying the full log",
                    cp.log_position,
                    self.store.position()
                ),
                Ok(None) => {}
                Err(e) => warn!("Ignoring unreadable index checkpoint: {}", e),
            }
        }

        let mut recovery = self
            .store
            .recover(from_position)
            .await
            .context("Failed to replay record store")?;

        // A torn tail below the checkpoint means the checkpoint cannot be trusted
        if from_position > 0 && recovery.position < from_position {
            warn!(
                "Log ends at {} before checkpoint position {}; replaying the full log",
                recovery.position, from_position
            );
            checkpointed.clear();
            from_position = 0;
            recovery = self
                .store
                .recover(0)
                .await
                .context("Failed to replay record store")?;
        }

        report.full_replay = from_position == 0;
        report.from_checkpoint = checkpointed.len();
        report.replayed = recovery.entries.len();
        report.records = recovery.records;
        report.truncated_bytes = recovery.truncated_bytes;

        checkpointed.extend(recovery.entries);
        self.index
            .extend(checkpointed)
            .context("Failed to rebuild interval index")?;
        report.index_entries = self.index.len();

        self.gateway.resume_accepting();
        self.set_state(LifecycleState::Running);
        info!(
            "Store running: {} records, {} index entries ({} from checkpoint, {} replayed)",
            report.records, report.index_entries, report.from_checkpoint, report.replayed
        );
        Ok(report)
    }

    /// Quiesce submissions, then flush and checkpoint.
    ///
    /// Polls the in-flight count `stop_attempts` times, `stop_interval`
    /// apart. If work is still in flight after that, the stop is forced and
    /// no checkpoint is written.
    pub async fn stop(&self) -> StopOutcome {
        let _transition = self.transition.lock().await;
        if self.state() == LifecycleState::Stopped {
            return StopOutcome::Graceful;
        }
        self.set_state(LifecycleState::Draining);
        self.gateway.stop_accepting();
        info!("Draining submissions");

        let attempts = self.config.lifecycle.stop_attempts;
        let interval = self.config.lifecycle.stop_interval();
        let mut drained = false;
        for attempt in 1..=attempts {
            let in_flight = self.gateway.in_flight();
            if in_flight == 0 {
                drained = true;
                break;
            }
            info!(
                "Waiting for {} in-flight submissions (attempt {}/{})",
                in_flight, attempt, attempts
            );
            sleep(interval).await;
        }
        drained = drained || self.gateway.in_flight() == 0;

        let outcome = if drained {
            self.gateway.repair().await;
            self.flush().await;
            self.write_checkpoint().await;
            StopOutcome::Graceful
        } else {
            warn!(
                "{} submissions still in flight after {} attempts; forcing stop",
                self.gateway.in_flight(),
                attempts
            );
            self.flush().await;
            StopOutcome::Forced
        };

        self.index.seal();
        let dropped = self.sessions.drop_all();
        if dropped > 0 {
            info!("Closed out {} open sensor sessions", dropped);
        }
        self.set_state(LifecycleState::Stopped);
        info!("Store stopped ({:?})", outcome);
        outcome
    }

    async fn flush(&self) {
        if let Err(e) = self.store.flush().await {
            error!("Failed to flush record store: {}", e);
        }
    }

    async fn write_checkpoint(&self) {
        let Some(file) = &self.checkpoint else {
            return;
        };
        if !self.config.index.checkpoint_on_stop {
            return;
        }
        let pending = self.gateway.pending_repairs();
        if pending > 0 {
            warn!("Skipping index checkpoint: {} repairs pending", pending);
            return;
        }
        let written = file
            .write(self.store.store_id(), self.store.position(), &self.index.snapshot())
            .await;
        if let Err(e) = written {
            error!("Failed to write index checkpoint: {}", e);
        }
    }

    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            state: self.state(),
            backend: self.store.backend_type().to_string(),
            records: self.store.len(),
            index_entries: self.index.len(),
            pending_repairs: self.gateway.pending_repairs(),
            log_position: self.store.position(),
            sensors: self.sessions.snapshot(),
            reported_at: Utc::now(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<IntervalIndex> {
        &self.index
    }

    pub fn gateway(&self) -> &Arc<IngestionGateway> {
        &self.gateway
    }

    pub fn query(&self) -> &Arc<QueryEngine> {
        &self.query
    }

    pub fn sessions(&self) -> &Arc<SensorRegistry> {
        &self.sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::record::RawCapture;

    fn memory_config() -> StoreConfig {
        let mut config = StoreConfig {
            storage: StorageConfig::memory(),
            ..StoreConfig::default()
        };
        config.lifecycle.stop_interval_ms = 5;
        config
    }

    #[tokio::test]
    async fn test_state_machine() {
        let controller = LifecycleController::new(memory_config()).unwrap();
        assert_eq!(controller.state(), LifecycleState::Starting);
        assert!(!controller.gateway().is_accepting());

        controller.start().await.unwrap();
        assert_eq!(controller.state(), LifecycleState::Running);
        assert!(controller.start().await.is_err());

        controller
            .gateway()
            .submit("s", RawCapture::instant(5, "x"))
            .await
            .unwrap();

        assert_eq!(controller.stop().await, StopOutcome::Graceful);
        assert_eq!(controller.state(), LifecycleState::Stopped);
        assert!(controller.index().is_sealed());
        assert_eq!(controller.stop().await, StopOutcome::Graceful);
    }

    #[tokio::test]
    async fn test_status_reports_counts() {
        let controller = LifecycleController::new(memory_config()).unwrap();
        controller.start().await.unwrap();
        for t in 0..3 {
            controller
                .gateway()
                .submit("s", RawCapture::instant(t, "x"))
                .await
                .unwrap();
        }
        let status = controller.status();
        assert_eq!(status.state, LifecycleState::Running);
        assert_eq!(status.backend, "memory");
        assert_eq!(status.records, 3);
        assert_eq!(status.index_entries, 3);
        assert_eq!(status.pending_repairs, 0);
    }
}
