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

// Append-only record log backend
//
// File layout (little-endian):
//   header: magic "NIDL" | version u32 | log id (16-byte uuid)
//   frame*: body_len u32 | body_crc32 u32 | body (protobuf `LogRecord`)
//
// Frames are written at the tail under a single append lock; compression
// and encoding happen before the lock is taken. A frame becomes visible to
// `get` only after it is fully written (and synced, when fsync is on).
// Replay stops at the first frame that is short, oversized or fails its
// checksum, and truncates the file there.

use super::backend::{RecordStore, Recovery};
use super::codec::PayloadCodec;
use crate::config::LogConfig;
use crate::error::{Result, StoreError};
use crate::proto::{Extent, LogRecord};
use crate::record::{BoundingBox, CaptureRecord, RecordId, TimeRange, UNASSIGNED_ID};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use prost::Message;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const LOG_MAGIC: [u8; 4] = *b"NIDL";
const LOG_VERSION: u32 = 2;

/// Position of the first frame
pub const LOG_HEADER_BYTES: u64 = 24;

const FRAME_HEADER_BYTES: u64 = 8;
const MAX_FRAME_BYTES: u64 = 64 * 1024 * 1024;

/// Where a record's frame lives in the file
#[derive(Debug, Clone, Copy)]
struct FrameSpan {
    offset: u64,
    body_len: u32,
}

pub struct LogBackend {
    path: PathBuf,
    fsync: bool,
    codec: PayloadCodec,
    file: Arc<File>,
    /// Append position; holding the lock serializes appends
    tail: Arc<Mutex<u64>>,
    /// Published end of the last complete frame
    position: Arc<AtomicU64>,
    offsets: Arc<DashMap<RecordId, FrameSpan>>,
    next_id: Arc<AtomicU64>,
    /// Random id written into the header when the log is created
    log_id: OnceLock<Uuid>,
}

fn join_error(e: tokio::task::JoinError) -> StoreError {
    StoreError::StorageIo(std::io::Error::other(e))
}

fn corrupt(offset: u64, detail: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        offset,
        detail: detail.into(),
    }
}

impl LogBackend {
    pub fn new(config: LogConfig) -> Result<Self> {
        let path = config.log_path();

        info!("Opening record log at: {}", path.display());

        std::fs::create_dir_all(&config.data_dir)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        Ok(Self {
            path,
            fsync: config.fsync,
            codec: PayloadCodec::new(config.compression.r#type, config.compression.level()),
            file: Arc::new(file),
            tail: Arc::new(Mutex::new(LOG_HEADER_BYTES)),
            position: Arc::new(AtomicU64::new(LOG_HEADER_BYTES)),
            offsets: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            log_id: OnceLock::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode_frame(&self, id: RecordId, record: &CaptureRecord) -> Result<Vec<u8>> {
        let (codec, payload) = self.codec.encode(&record.payload)?;
        let body = LogRecord {
            id,
            sensor_id: record.sensor_id.clone(),
            start_us: record.time_range.start,
            end_us: record.time_range.end,
            location: record.location.map(Extent::from),
            codec,
            raw_len: record.payload.len() as u64,
            payload,
        }
        .encode_to_vec();

        if body.len() as u64 > MAX_FRAME_BYTES {
            return Err(StoreError::Codec(format!(
                "encoded record {} is {} bytes, above the {} byte frame limit",
                id,
                body.len(),
                MAX_FRAME_BYTES
            )));
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES as usize + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    fn decode_record(offset: u64, body: &[u8]) -> Result<CaptureRecord> {
        let frame = LogRecord::decode(body).map_err(|e| corrupt(offset, e.to_string()))?;
        let payload = PayloadCodec::decode(frame.codec, &frame.payload, frame.raw_len as usize)?;
        Ok(CaptureRecord {
            id: frame.id,
            sensor_id: frame.sensor_id,
            time_range: TimeRange::new(frame.start_us, frame.end_us),
            location: frame.location.map(BoundingBox::from),
            payload: Bytes::from(payload),
        })
    }

    /// Linear pass over every frame; runs on a blocking thread
    fn scan(file: &File, from_position: u64) -> Result<(ScanResult, Vec<(RecordId, FrameSpan)>)> {
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file.try_clone()?);
        reader.seek(SeekFrom::Start(LOG_HEADER_BYTES))?;

        let mut result = ScanResult::default();
        let mut spans = Vec::new();
        let mut pos = LOG_HEADER_BYTES;
        let mut header = [0u8; FRAME_HEADER_BYTES as usize];
        let mut body = Vec::new();

        while pos < file_len {
            let remaining = file_len - pos;
            if remaining < FRAME_HEADER_BYTES {
                warn!("Partial frame header at offset {}", pos);
                break;
            }
            reader.read_exact(&mut header)?;
            let body_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let stored_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            let body_len_bytes = body_len as u64;
            if body_len_bytes > MAX_FRAME_BYTES || body_len_bytes > remaining - FRAME_HEADER_BYTES {
                warn!("Frame at offset {} claims {} bytes past end of log", pos, body_len);
                break;
            }
            body.resize(body_len as usize, 0);
            reader.read_exact(&mut body)?;
            if crc32fast::hash(&body) != stored_crc {
                warn!("Checksum mismatch in frame at offset {}", pos);
                break;
            }
            let record = match LogRecord::decode(body.as_slice()) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Undecodable frame at offset {}: {}", pos, e);
                    break;
                }
            };

            result.records += 1;
            result.max_id = result.max_id.max(record.id);
            spans.push((
                record.id,
                FrameSpan {
                    offset: pos,
                    body_len,
                },
            ));
            if pos >= from_position {
                result.entries.push(record.index_entry());
            }
            pos += FRAME_HEADER_BYTES + body_len as u64;
        }

        result.position = pos;
        result.truncated_bytes = file_len - pos;
        Ok((result, spans))
    }
}

#[derive(Debug, Default)]
struct ScanResult {
    entries: Vec<crate::record::IndexEntry>,
    records: usize,
    position: u64,
    truncated_bytes: u64,
    max_id: RecordId,
}

#[async_trait]
impl RecordStore for LogBackend {
    async fn initialize(&self) -> Result<()> {
        let file = self.file.clone();
        let (end, log_id) = tokio::task::spawn_blocking(move || -> Result<(u64, Uuid)> {
            let len = file.metadata()?.len();
            if len == 0 {
                let log_id = Uuid::new_v4();
                let mut header = [0u8; LOG_HEADER_BYTES as usize];
                header[0..4].copy_from_slice(&LOG_MAGIC);
                header[4..8].copy_from_slice(&LOG_VERSION.to_le_bytes());
                header[8..24].copy_from_slice(log_id.as_bytes());
                file.write_all_at(&header, 0)?;
                file.sync_all()?;
                return Ok((LOG_HEADER_BYTES, log_id));
            }
            if len < LOG_HEADER_BYTES {
                return Err(corrupt(0, "record log header truncated"));
            }
            let mut header = [0u8; LOG_HEADER_BYTES as usize];
            file.read_exact_at(&mut header, 0)?;
            if header[0..4] != LOG_MAGIC {
                return Err(corrupt(0, "bad record log magic"));
            }
            let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            if version != LOG_VERSION {
                return Err(corrupt(4, format!("unsupported record log version {}", version)));
            }
            let log_id = Uuid::from_slice(&header[8..24]).map_err(|e| corrupt(8, e.to_string()))?;
            Ok((len, log_id))
        })
        .await
        .map_err(join_error)??;

        if self.log_id.set(log_id).is_err() && self.log_id.get() != Some(&log_id) {
            return Err(corrupt(8, "record log was replaced while open"));
        }
        debug!("Record log {} has id {}", self.path.display(), log_id);

        // Never append over existing frames, even before recover() has run
        *self.tail.lock().await = end;
        self.position.store(end, Ordering::Release);
        Ok(())
    }

    async fn recover(&self, from_position: u64) -> Result<Recovery> {
        // Hold the append lock so nothing is written while the map is rebuilt
        let mut tail = self.tail.lock().await;

        let file = self.file.clone();
        let (scan, spans) = tokio::task::spawn_blocking(move || -> Result<_> {
            let (scan, spans) = Self::scan(&file, from_position)?;
            if scan.truncated_bytes > 0 {
                file.set_len(scan.position)?;
                file.sync_all()?;
            }
            Ok((scan, spans))
        })
        .await
        .map_err(join_error)??;

        self.offsets.clear();
        for (id, span) in spans {
            // First occurrence wins
            self.offsets.entry(id).or_insert(span);
        }
        *tail = scan.position;
        self.position.store(scan.position, Ordering::Release);
        self.next_id.fetch_max(scan.max_id + 1, Ordering::AcqRel);

        if scan.truncated_bytes > 0 {
            warn!(
                "Truncated {} bytes of torn tail from {}",
                scan.truncated_bytes,
                self.path.display()
            );
        }
        info!(
            "Replayed {} records from {} ({} at or after position {})",
            scan.records,
            self.path.display(),
            scan.entries.len(),
            from_position
        );

        Ok(Recovery {
            entries: scan.entries,
            records: scan.records,
            position: scan.position,
            truncated_bytes: scan.truncated_bytes,
            max_id: scan.max_id,
        })
    }

    fn allocate_id(&self) -> RecordId {
        self.next_id.fetch_add(1, Ordering::AcqRel)
    }

    async fn put(&self, mut record: CaptureRecord) -> Result<RecordId> {
        if record.id == UNASSIGNED_ID {
            record.id = self.allocate_id();
        }
        let id = record.id;
        if self.offsets.contains_key(&id) {
            return Ok(id);
        }
        let frame = self.encode_frame(id, &record)?;
        let frame_len = frame.len() as u64;

        let mut tail = self.tail.clone().lock_owned().await;
        if self.offsets.contains_key(&id) {
            return Ok(id);
        }

        // Write and tail advance complete together even if this future is dropped
        let file = self.file.clone();
        let offsets = self.offsets.clone();
        let position = self.position.clone();
        let next_id = self.next_id.clone();
        let fsync = self.fsync;
        let append = tokio::spawn(async move {
            let at = *tail;
            let written = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                let result = file.write_all_at(&frame, at).and_then(|_| {
                    if fsync {
                        file.sync_data()
                    } else {
                        Ok(())
                    }
                });
                if result.is_err() {
                    // Drop whatever part of the frame reached the file
                    let _ = file.set_len(at);
                }
                result
            })
            .await
            .map_err(join_error)?;
            written?;

            *tail = at + frame_len;
            offsets.insert(
                id,
                FrameSpan {
                    offset: at,
                    body_len: (frame_len - FRAME_HEADER_BYTES) as u32,
                },
            );
            position.store(*tail, Ordering::Release);
            next_id.fetch_max(id + 1, Ordering::AcqRel);
            Ok::<u64, StoreError>(at)
        });
        let at = append.await.map_err(join_error)??;

        debug!("Appended record {} ({} bytes) at offset {}", id, frame_len, at);
        Ok(id)
    }

    async fn get(&self, id: RecordId) -> Result<CaptureRecord> {
        let span = self
            .offsets
            .get(&id)
            .map(|s| *s)
            .ok_or(StoreError::NotFound(id))?;

        let file = self.file.clone();
        let frame = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut buf = vec![0u8; FRAME_HEADER_BYTES as usize + span.body_len as usize];
            file.read_exact_at(&mut buf, span.offset)?;
            Ok(buf)
        })
        .await
        .map_err(join_error)??;

        let stored_crc = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        let body = &frame[FRAME_HEADER_BYTES as usize..];
        if crc32fast::hash(body) != stored_crc {
            return Err(corrupt(span.offset, format!("checksum mismatch for record {}", id)));
        }
        Self::decode_record(span.offset, body)
    }

    fn contains(&self, id: RecordId) -> bool {
        self.offsets.contains_key(&id)
    }

    async fn flush(&self) -> Result<()> {
        // Wait for any in-progress append before syncing
        let _tail = self.tail.lock().await;
        let file = self.file.clone();
        tokio::task::spawn_blocking(move || file.sync_all())
            .await
            .map_err(join_error)??;
        debug!("Flushed record log {}", self.path.display());
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    fn len(&self) -> usize {
        self.offsets.len()
    }

    async fn health_check(&self) -> Result<bool> {
        match tokio::fs::metadata(&self.path).await {
            Ok(metadata) if metadata.is_file() => Ok(true),
            Ok(_) => {
                warn!(
                    "Health check failed - record log is not a regular file: {}",
                    self.path.display()
                );
                Ok(false)
            }
            Err(e) => {
                warn!(
                    "Health check failed - cannot access record log {}: {}",
                    self.path.display(),
                    e
                );
                Ok(false)
            }
        }
    }

    fn store_id(&self) -> Option<Uuid> {
        self.log_id.get().copied()
    }

    fn backend_type(&self) -> &str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::CompressionType;
    use tempfile::TempDir;

    fn create_test_backend(dir: &TempDir) -> LogBackend {
        let mut config = LogConfig::new(dir.path());
        config.fsync = false;
        LogBackend::new(config).unwrap()
    }

    fn record(sensor: &str, start: i64, end: i64, payload: &'static [u8]) -> CaptureRecord {
        CaptureRecord {
            id: UNASSIGNED_ID,
            sensor_id: sensor.to_string(),
            time_range: TimeRange::new(start, end),
            location: Some(BoundingBox::point(1.5, -2.5)),
            payload: Bytes::from_static(payload),
        }
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = TempDir::new().unwrap();
        let backend = create_test_backend(&dir);
        backend.initialize().await.unwrap();
        backend.recover(0).await.unwrap();

        let id = backend.put(record("s1", 10, 20, b"frame")).await.unwrap();
        assert_eq!(id, 1);
        let fetched = backend.get(id).await.unwrap();
        assert_eq!(fetched.sensor_id, "s1");
        assert_eq!(fetched.time_range, TimeRange::new(10, 20));
        assert_eq!(fetched.location, Some(BoundingBox::point(1.5, -2.5)));
        assert_eq!(&fetched.payload[..], b"frame");
        assert!(backend.position() > LOG_HEADER_BYTES);
    }

    #[tokio::test]
    async fn test_get_unknown_id() {
        let dir = TempDir::new().unwrap();
        let backend = create_test_backend(&dir);
        backend.initialize().await.unwrap();
        assert!(matches!(backend.get(42).await, Err(StoreError::NotFound(42))));
    }

    #[tokio::test]
    async fn test_rewrite_of_stored_id_is_noop() {
        let dir = TempDir::new().unwrap();
        let backend = create_test_backend(&dir);
        backend.initialize().await.unwrap();

        let mut r = record("s1", 0, 5, b"a");
        r.id = backend.allocate_id();
        backend.put(r.clone()).await.unwrap();
        let position = backend.position();
        backend.put(r).await.unwrap();
        assert_eq!(backend.position(), position);
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_put_still_commits() {
        let dir = TempDir::new().unwrap();
        let backend = create_test_backend(&dir);
        backend.initialize().await.unwrap();

        let mut large = record("s1", 0, 5, b"");
        large.id = backend.allocate_id();
        large.payload = Bytes::from(vec![7u8; 4 * 1024 * 1024]);
        let large_id = large.id;
        // First poll takes the append lock and starts the write, then the caller gives up
        let dropped =
            tokio::time::timeout(std::time::Duration::ZERO, backend.put(large.clone())).await;
        drop(dropped);

        let next = backend.put(record("s1", 10, 20, b"next")).await.unwrap();
        assert!(backend.contains(large_id));
        assert_eq!(backend.get(large_id).await.unwrap().payload, large.payload);
        let position = backend.position();
        drop(backend);

        let reopened = create_test_backend(&dir);
        reopened.initialize().await.unwrap();
        let recovery = reopened.recover(0).await.unwrap();
        assert_eq!(recovery.records, 2);
        assert_eq!(recovery.truncated_bytes, 0);
        assert_eq!(recovery.position, position);
        assert_eq!(&reopened.get(next).await.unwrap().payload[..], b"next");
        assert_eq!(reopened.get(large_id).await.unwrap().payload, large.payload);
    }

    #[tokio::test]
    async fn test_log_id_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let first = {
            let backend = create_test_backend(&dir);
            assert!(backend.store_id().is_none());
            backend.initialize().await.unwrap();
            backend.store_id().unwrap()
        };

        let reopened = create_test_backend(&dir);
        reopened.initialize().await.unwrap();
        assert_eq!(reopened.store_id(), Some(first));

        let other_dir = TempDir::new().unwrap();
        let other = create_test_backend(&other_dir);
        other.initialize().await.unwrap();
        assert_ne!(other.store_id(), Some(first));
    }

    #[tokio::test]
    async fn test_reopen_replays_records() {
        let dir = TempDir::new().unwrap();
        {
            let backend = create_test_backend(&dir);
            backend.initialize().await.unwrap();
            for i in 0..5 {
                backend.put(record("s1", i * 10, i * 10 + 5, b"x")).await.unwrap();
            }
        }

        let backend = create_test_backend(&dir);
        backend.initialize().await.unwrap();
        let recovery = backend.recover(0).await.unwrap();
        assert_eq!(recovery.records, 5);
        assert_eq!(recovery.entries.len(), 5);
        assert_eq!(recovery.max_id, 5);
        assert_eq!(recovery.truncated_bytes, 0);
        assert_eq!(backend.allocate_id(), 6);
    }

    #[tokio::test]
    async fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let log_path;
        let good_len;
        {
            let backend = create_test_backend(&dir);
            backend.initialize().await.unwrap();
            backend.put(record("s1", 0, 5, b"complete")).await.unwrap();
            good_len = backend.position();
            log_path = backend.path().to_path_buf();
        }
        // Half a frame header plus junk, as left by a crash mid-append
        {
            use std::io::Write;
            let mut f = OpenOptions::new().append(true).open(&log_path).unwrap();
            f.write_all(&[0x20, 0x00, 0x00, 0x00, 0xAA]).unwrap();
        }

        let backend = create_test_backend(&dir);
        backend.initialize().await.unwrap();
        let recovery = backend.recover(0).await.unwrap();
        assert_eq!(recovery.records, 1);
        assert_eq!(recovery.truncated_bytes, 5);
        assert_eq!(std::fs::metadata(&log_path).unwrap().len(), good_len);

        // Appends continue cleanly after the truncation point
        let id = backend.put(record("s1", 5, 9, b"next")).await.unwrap();
        assert_eq!(&backend.get(id).await.unwrap().payload[..], b"next");
    }

    #[tokio::test]
    async fn test_recover_from_position_returns_tail_only() {
        let dir = TempDir::new().unwrap();
        let backend = create_test_backend(&dir);
        backend.initialize().await.unwrap();
        backend.put(record("s1", 0, 5, b"one")).await.unwrap();
        let middle = backend.position();
        backend.put(record("s1", 5, 9, b"two")).await.unwrap();

        let recovery = backend.recover(middle).await.unwrap();
        assert_eq!(recovery.records, 2);
        assert_eq!(recovery.entries.len(), 1);
        assert_eq!(recovery.entries[0].record_id, 2);
    }

    #[tokio::test]
    async fn test_compressed_payloads_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let mut config = LogConfig::new(dir.path());
        config.fsync = false;
        config.compression.r#type = CompressionType::Zstd;
        {
            let backend = LogBackend::new(config.clone()).unwrap();
            backend.initialize().await.unwrap();
            backend
                .put(record("s1", 0, 5, b"probe-request probe-request probe-request"))
                .await
                .unwrap();
        }
        // Reader configured without compression still decodes the zstd frame
        config.compression.r#type = CompressionType::None;
        let backend = LogBackend::new(config).unwrap();
        backend.initialize().await.unwrap();
        backend.recover(0).await.unwrap();
        let fetched = backend.get(1).await.unwrap();
        assert_eq!(&fetched.payload[..], b"probe-request probe-request probe-request");
    }

    #[tokio::test]
    async fn test_foreign_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("records.log"), b"not a record log").unwrap();
        let backend = create_test_backend(&dir);
        assert!(matches!(
            backend.initialize().await,
            Err(StoreError::Corrupt { .. })
        ));
    }
}
