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

use nidus_store::config::{LogConfig, StorageConfig, StoreConfig};
use nidus_store::{
    BoundingBox, CaptureRecord, LifecycleController, OverlapQuery, RawCapture, RecordId,
    StopOutcome, TimeRange,
};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;

fn config(dir: &Path) -> StoreConfig {
    let mut log = LogConfig::new(dir);
    log.fsync = false;
    let mut config = StoreConfig {
        storage: StorageConfig::log(log),
        ..StoreConfig::default()
    };
    config.lifecycle.stop_interval_ms = 5;
    config.ingest.retry_backoff_ms = 1;
    config
}

async fn started(dir: &Path) -> LifecycleController {
    let controller = LifecycleController::new(config(dir)).unwrap();
    controller.start().await.unwrap();
    controller
}

async fn submit_batch(controller: &LifecycleController, from: i64, count: i64) -> Vec<RecordId> {
    let mut ids = Vec::new();
    for t in from..from + count {
        let raw = RawCapture::new(t * 10, t * 10 + 5, format!("capture-{}", t))
            .with_location(BoundingBox::point(t as f64 * 0.1, 0.0));
        ids.push(controller.gateway().submit("replay", raw).await.unwrap());
    }
    ids
}

async fn everything(controller: &LifecycleController) -> Vec<CaptureRecord> {
    controller
        .query()
        .run(&OverlapQuery::new(TimeRange::new(i64::MIN, i64::MAX)))
        .await
        .unwrap()
}

fn append_garbage(dir: &Path, bytes: &[u8]) {
    let mut file = OpenOptions::new()
        .append(true)
        .open(dir.join("records.log"))
        .unwrap();
    file.write_all(bytes).unwrap();
}

#[tokio::test]
async fn test_crash_mid_batch_keeps_acknowledged_records() {
    let dir = TempDir::new().unwrap();
    let acknowledged = {
        let controller = started(dir.path()).await;
        submit_batch(&controller, 0, 12).await
        // Dropped without stop()
    };
    // A frame header promising more bytes than were written
    append_garbage(dir.path(), &[0x40, 0, 0, 0, 0xde, 0xad, 0xbe, 0xef, 1, 2, 3]);

    let controller = LifecycleController::new(config(dir.path())).unwrap();
    let report = controller.start().await.unwrap();
    assert!(report.full_replay);
    assert_eq!(report.records, 12);
    assert_eq!(report.truncated_bytes, 11);

    let recovered: Vec<RecordId> = everything(&controller).await.iter().map(|r| r.id).collect();
    assert_eq!(recovered, acknowledged);

    // New ids continue after the recovered ones
    let next = controller
        .gateway()
        .submit("replay", RawCapture::instant(9999, "after"))
        .await
        .unwrap();
    assert_eq!(next, 13);
}

#[tokio::test]
async fn test_checkpoint_plus_tail_equals_full_replay() {
    let dir = TempDir::new().unwrap();

    {
        let controller = started(dir.path()).await;
        submit_batch(&controller, 0, 10).await;
        assert_eq!(controller.stop().await, StopOutcome::Graceful);
    }
    assert!(dir.path().join("index.ckpt").exists());

    {
        let controller = LifecycleController::new(config(dir.path())).unwrap();
        let report = controller.start().await.unwrap();
        assert!(!report.full_replay);
        assert_eq!(report.from_checkpoint, 10);
        assert_eq!(report.replayed, 0);
        submit_batch(&controller, 10, 5).await;
        // Crash: the checkpoint still describes the first ten
    }

    let from_checkpoint = {
        let controller = LifecycleController::new(config(dir.path())).unwrap();
        let report = controller.start().await.unwrap();
        assert!(!report.full_replay);
        assert_eq!(report.from_checkpoint, 10);
        assert_eq!(report.replayed, 5);
        assert_eq!(report.index_entries, 15);
        everything(&controller).await
    };

    std::fs::remove_file(dir.path().join("index.ckpt")).unwrap();
    let full = {
        let controller = LifecycleController::new(config(dir.path())).unwrap();
        let report = controller.start().await.unwrap();
        assert!(report.full_replay);
        assert_eq!(report.replayed, 15);
        everything(&controller).await
    };

    assert_eq!(from_checkpoint, full);

    // Spatial pruning survives the checkpoint as well
    let controller = started(dir.path()).await;
    let near_origin = OverlapQuery::new(TimeRange::new(i64::MIN, i64::MAX))
        .with_bbox(BoundingBox::new(-0.05, -1.0, 0.25, 1.0));
    let hits = controller.query().run(&near_origin).await.unwrap();
    assert_eq!(hits.len(), 3);
}

#[tokio::test]
async fn test_corrupt_checkpoint_falls_back_to_full_replay() {
    let dir = TempDir::new().unwrap();
    {
        let controller = started(dir.path()).await;
        submit_batch(&controller, 0, 4).await;
        controller.stop().await;
    }
    std::fs::write(dir.path().join("index.ckpt"), b"NIDXgarbage").unwrap();

    let controller = LifecycleController::new(config(dir.path())).unwrap();
    let report = controller.start().await.unwrap();
    assert!(report.full_replay);
    assert_eq!(report.index_entries, 4);
}

#[tokio::test]
async fn test_stale_checkpoint_falls_back_to_full_replay() {
    let dir = TempDir::new().unwrap();
    {
        let controller = started(dir.path()).await;
        submit_batch(&controller, 0, 6).await;
        controller.stop().await;
    }

    // Replace the log with a shorter one; the checkpoint now points past its end
    let checkpoint = std::fs::read(dir.path().join("index.ckpt")).unwrap();
    std::fs::remove_file(dir.path().join("records.log")).unwrap();
    {
        let controller = started(dir.path()).await;
        submit_batch(&controller, 100, 2).await;
    }
    std::fs::write(dir.path().join("index.ckpt"), checkpoint).unwrap();

    let controller = LifecycleController::new(config(dir.path())).unwrap();
    let report = controller.start().await.unwrap();
    assert!(report.full_replay);
    assert_eq!(report.index_entries, 2);
    let starts: Vec<i64> = everything(&controller)
        .await
        .iter()
        .map(|r| r.time_range.start)
        .collect();
    assert_eq!(starts, vec![1000, 1010]);
}

#[tokio::test]
async fn test_checkpoint_from_another_log_is_ignored() {
    let dir = TempDir::new().unwrap();
    {
        let controller = started(dir.path()).await;
        submit_batch(&controller, 0, 3).await;
        assert_eq!(controller.stop().await, StopOutcome::Graceful);
    }
    let checkpoint = std::fs::read(dir.path().join("index.ckpt")).unwrap();

    // A longer, unrelated log under the old checkpoint
    std::fs::remove_file(dir.path().join("records.log")).unwrap();
    {
        let controller = started(dir.path()).await;
        submit_batch(&controller, 500, 6).await;
    }
    std::fs::write(dir.path().join("index.ckpt"), checkpoint).unwrap();

    let controller = LifecycleController::new(config(dir.path())).unwrap();
    let report = controller.start().await.unwrap();
    assert!(report.full_replay);
    assert_eq!(report.from_checkpoint, 0);
    assert_eq!(report.index_entries, 6);

    let early = controller
        .query()
        .run(&OverlapQuery::new(TimeRange::new(0, 30)))
        .await
        .unwrap();
    assert!(early.is_empty());
    let starts: Vec<i64> = everything(&controller)
        .await
        .iter()
        .map(|r| r.time_range.start)
        .collect();
    assert_eq!(starts, vec![5000, 5010, 5020, 5030, 5040, 5050]);
}
