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

// Sensor session bookkeeping
//
// Tracks the latest session of every sensor that has talked to the
// gateway. A session is open-ended while the connection lives, closed on
// an orderly goodbye, and marked dropped when the connection disappears
// without one.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connected,
    Closed,
    Dropped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorStatus {
    pub sensor_id: String,
    pub session_id: Uuid,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    pub connected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
    pub accepted: u64,
    pub rejected: u64,
}

impl SensorStatus {
    fn open(sensor_id: &str, peer: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            sensor_id: sensor_id.to_string(),
            session_id: Uuid::new_v4(),
            state: SessionState::Connected,
            peer: peer.map(str::to_string),
            connected_at: now,
            ended_at: None,
            last_seen: now,
            accepted: 0,
            rejected: 0,
        }
    }

    fn end(&mut self, state: SessionState) {
        let now = Utc::now();
        self.state = state;
        self.ended_at = Some(now);
        self.last_seen = now;
    }
}

#[derive(Default)]
pub struct SensorRegistry {
    sessions: DashMap<String, SensorStatus>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new session for `sensor_id`. A session still marked connected
    /// is superseded and recorded as dropped.
    pub fn open(&self, sensor_id: &str, peer: Option<&str>) -> Uuid {
        let fresh = SensorStatus::open(sensor_id, peer);
        let session_id = fresh.session_id;
        if let Some(previous) = self.sessions.insert(sensor_id.to_string(), fresh) {
            if previous.state == SessionState::Connected {
                warn!(
                    "Sensor '{}' reconnected; session {} superseded",
                    sensor_id, previous.session_id
                );
            }
        }
        info!("Sensor '{}' opened session {}", sensor_id, session_id);
        session_id
    }

    /// Current connected session for `sensor_id`, opening one if needed
    pub fn touch(&self, sensor_id: &str, peer: Option<&str>) -> Uuid {
        let mut entry = self
            .sessions
            .entry(sensor_id.to_string())
            .or_insert_with(|| SensorStatus::open(sensor_id, peer));
        if entry.state != SessionState::Connected {
            *entry = SensorStatus::open(sensor_id, peer);
        }
        entry.last_seen = Utc::now();
        entry.session_id
    }

    pub fn record_accepted(&self, sensor_id: &str) {
        if let Some(mut s) = self.sessions.get_mut(sensor_id) {
            s.accepted += 1;
            s.last_seen = Utc::now();
        }
    }

    pub fn record_rejected(&self, sensor_id: &str) {
        if let Some(mut s) = self.sessions.get_mut(sensor_id) {
            s.rejected += 1;
            s.last_seen = Utc::now();
        }
    }

    /// Orderly end. Ignored if the session has since been superseded.
    pub fn close(&self, sensor_id: &str, session_id: Uuid) -> Option<SensorStatus> {
        self.end(sensor_id, session_id, SessionState::Closed)
    }

    /// Connection lost without a goodbye; closes out the open-ended session
    pub fn drop_session(&self, sensor_id: &str, session_id: Uuid) -> Option<SensorStatus> {
        let ended = self.end(sensor_id, session_id, SessionState::Dropped);
        if ended.is_some() {
            warn!("Sensor '{}' dropped session {}", sensor_id, session_id);
        }
        ended
    }

    fn end(&self, sensor_id: &str, session_id: Uuid, state: SessionState) -> Option<SensorStatus> {
        let mut s = self.sessions.get_mut(sensor_id)?;
        if s.session_id != session_id || s.state != SessionState::Connected {
            return None;
        }
        s.end(state);
        Some(s.clone())
    }

    /// Drop every connected session, used when the server stops
    pub fn drop_all(&self) -> usize {
        let mut dropped = 0;
        for mut s in self.sessions.iter_mut() {
            if s.state == SessionState::Connected {
                s.end(SessionState::Dropped);
                dropped += 1;
            }
        }
        dropped
    }

    pub fn get(&self, sensor_id: &str) -> Option<SensorStatus> {
        self.sessions.get(sensor_id).map(|s| s.clone())
    }

    /// All known sensors ordered by id
    pub fn snapshot(&self) -> Vec<SensorStatus> {
        let mut all: Vec<SensorStatus> = self.sessions.iter().map(|s| s.clone()).collect();
        all.sort_by(|a, b| a.sensor_id.cmp(&b.sensor_id));
        all
    }

    pub fn connected(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.state == SessionState::Connected)
            .count()
    }
}
