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

// Index checkpoint file
//
// Layout (little-endian):
//   magic "NIDX" | version u32 | body_len u64 | body_crc32 u32 | body
// where body is a protobuf `IndexCheckpoint`. The file is written to a
// temporary sibling and renamed into place, so a reader sees either the
// previous checkpoint or the new one.

use chrono::Utc;
use prost::Message;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use super::tree::IntervalTree;
use crate::error::{Result, StoreError};
use crate::proto::{CheckpointEntry, IndexCheckpoint};
use crate::record::IndexEntry;

const CHECKPOINT_MAGIC: [u8; 4] = *b"NIDX";
const CHECKPOINT_VERSION: u32 = 1;
const CHECKPOINT_HEADER_BYTES: usize = 20;

/// A decoded checkpoint
#[derive(Debug, Clone)]
pub struct Checkpoint {
    /// Record log the entries belong to
    pub log_id: Option<Uuid>,
    /// Log position up to which `entries` is complete
    pub log_position: u64,
    pub written_at_us: i64,
    pub entries: Vec<IndexEntry>,
}

pub struct CheckpointFile {
    path: PathBuf,
}

impl CheckpointFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist every entry of `tree` as covering log `log_id` up to `log_position`
    pub async fn write(
        &self,
        log_id: Option<Uuid>,
        log_position: u64,
        tree: &IntervalTree,
    ) -> Result<usize> {
        let entries: Vec<CheckpointEntry> =
            tree.entries().iter().map(CheckpointEntry::from).collect();
        let count = entries.len();
        let body = IndexCheckpoint {
            log_position,
            written_at_us: Utc::now().timestamp_micros(),
            entries,
            log_id: log_id.map(|id| id.to_string()).unwrap_or_default(),
        }
        .encode_to_vec();

        let mut buffer = Vec::with_capacity(CHECKPOINT_HEADER_BYTES + body.len());
        buffer.extend_from_slice(&CHECKPOINT_MAGIC);
        buffer.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
        buffer.extend_from_slice(&(body.len() as u64).to_le_bytes());
        buffer.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        buffer.extend_from_slice(&body);

        let tmp_path = self.path.with_extension("ckpt.tmp");
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&buffer).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, &self.path).await?;

        info!(
            "Wrote index checkpoint with {} entries at log position {} to {}",
            count,
            log_position,
            self.path.display()
        );
        Ok(count)
    }

    /// Load the checkpoint. `Ok(None)` when no file exists; `Corrupt` when it
    /// exists but cannot be trusted.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No index checkpoint at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        decode(&bytes).map(Some)
    }

    pub async fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn corrupt(offset: u64, detail: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        offset,
        detail: detail.into(),
    }
}

fn decode(bytes: &[u8]) -> Result<Checkpoint> {
    if bytes.len() < CHECKPOINT_HEADER_BYTES {
        return Err(corrupt(0, "checkpoint header truncated"));
    }
    if bytes[0..4] != CHECKPOINT_MAGIC {
        return Err(corrupt(0, "bad checkpoint magic"));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != CHECKPOINT_VERSION {
        return Err(corrupt(4, format!("unsupported checkpoint version {}", version)));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[8..16]);
    let body_len = u64::from_le_bytes(len_bytes) as usize;
    let stored_crc = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);

    let body = &bytes[CHECKPOINT_HEADER_BYTES..];
    if body.len() != body_len {
        return Err(corrupt(
            CHECKPOINT_HEADER_BYTES as u64,
            format!("expected {} body bytes, found {}", body_len, body.len()),
        ));
    }
    if crc32fast::hash(body) != stored_crc {
        return Err(corrupt(CHECKPOINT_HEADER_BYTES as u64, "checkpoint checksum mismatch"));
    }
    let decoded = IndexCheckpoint::decode(body)
        .map_err(|e| corrupt(CHECKPOINT_HEADER_BYTES as u64, e.to_string()))?;

    let log_id = if decoded.log_id.is_empty() {
        None
    } else {
        let id = Uuid::parse_str(&decoded.log_id)
            .map_err(|e| corrupt(CHECKPOINT_HEADER_BYTES as u64, format!("bad log id: {}", e)))?;
        Some(id)
    };

    Ok(Checkpoint {
        log_id,
        log_position: decoded.log_position,
        written_at_us: decoded.written_at_us,
        entries: decoded.entries.into_iter().map(IndexEntry::from).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{BoundingBox, TimeRange};
    use tempfile::TempDir;

    fn sample_tree() -> IntervalTree {
        let mut tree = IntervalTree::new();
        for id in 1..=20u64 {
            let location = (id % 3 == 0).then(|| BoundingBox::point(id as f64, -(id as f64)));
            tree = tree
                .insert(IndexEntry {
                    record_id: id,
                    time_range: TimeRange::new(id as i64 * 10, id as i64 * 10 + 15),
                    location,
                })
                .unwrap();
        }
        tree
    }

    #[tokio::test]
    async fn test_write_then_load() {
        let dir = TempDir::new().unwrap();
        let file = CheckpointFile::new(dir.path().join("index.ckpt"));
        let tree = sample_tree();

        let log_id = Uuid::new_v4();
        assert_eq!(file.write(Some(log_id), 4096, &tree).await.unwrap(), 20);
        let loaded = file.load().await.unwrap().unwrap();
        assert_eq!(loaded.log_id, Some(log_id));
        assert_eq!(loaded.log_position, 4096);
        assert_eq!(loaded.entries, tree.entries());
    }

    #[tokio::test]
    async fn test_missing_checkpoint_is_none() {
        let dir = TempDir::new().unwrap();
        let file = CheckpointFile::new(dir.path().join("index.ckpt"));
        assert!(file.load().await.unwrap().is_none());
        file.remove().await.unwrap();
    }

    #[tokio::test]
    async fn test_flipped_byte_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.ckpt");
        let file = CheckpointFile::new(&path);
        file.write(None, 1, &sample_tree()).await.unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(file.load().await, Err(StoreError::Corrupt { .. })));
    }
}
