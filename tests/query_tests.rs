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

use nidus_store::config::IngestConfig;
use nidus_store::storage::{MemoryBackend, RecordStore};
use nidus_store::{
    BoundingBox, IngestionGateway, IntervalIndex, OverlapQuery, QueryEngine, QueryError,
    RawCapture, RecordId, TimeRange,
};
use std::sync::Arc;

struct Fixture {
    gateway: IngestionGateway,
    query: QueryEngine,
}

fn fixture() -> Fixture {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryBackend::new());
    let index = Arc::new(IntervalIndex::new());
    Fixture {
        gateway: IngestionGateway::new(store.clone(), index.clone(), IngestConfig::default()),
        query: QueryEngine::new(store, index),
    }
}

/// A = [10, 20) at (1, 1) from sensor "north", B = [20, 30) at (5, 5) from "south"
async fn two_records(f: &Fixture) -> (RecordId, RecordId) {
    let a = f
        .gateway
        .submit(
            "north",
            RawCapture::new(10, 20, "A").with_location(BoundingBox::point(1.0, 1.0)),
        )
        .await
        .unwrap();
    let b = f
        .gateway
        .submit(
            "south",
            RawCapture::new(20, 30, "B").with_location(BoundingBox::point(5.0, 5.0)),
        )
        .await
        .unwrap();
    (a, b)
}

fn ids(records: &[nidus_store::CaptureRecord]) -> Vec<RecordId> {
    records.iter().map(|r| r.id).collect()
}

#[tokio::test]
async fn test_window_spanning_both_returns_both_in_start_order() {
    let f = fixture();
    let (a, b) = two_records(&f).await;

    let records = f
        .query
        .run(&OverlapQuery::new(TimeRange::new(15, 25)))
        .await
        .unwrap();
    assert_eq!(ids(&records), vec![a, b]);
    assert_eq!(&records[0].payload[..], b"A");
    assert_eq!(&records[1].payload[..], b"B");
}

#[tokio::test]
async fn test_bbox_excluding_b_returns_a() {
    let f = fixture();
    let (a, _) = two_records(&f).await;

    let query = OverlapQuery::new(TimeRange::new(0, 100))
        .with_bbox(BoundingBox::new(0.0, 0.0, 2.0, 2.0));
    let records = f.query.run(&query).await.unwrap();
    assert_eq!(ids(&records), vec![a]);
}

#[tokio::test]
async fn test_touching_boundary_excludes_record() {
    let f = fixture();
    let (a, b) = two_records(&f).await;

    // [0, 10) touches A's start only
    assert!(f
        .query
        .run(&OverlapQuery::new(TimeRange::new(0, 10)))
        .await
        .unwrap()
        .is_empty());
    // [30, 40) touches B's end only
    assert!(f
        .query
        .run(&OverlapQuery::new(TimeRange::new(30, 40)))
        .await
        .unwrap()
        .is_empty());
    // [20, 21) starts exactly where A ends
    let records = f
        .query
        .run(&OverlapQuery::new(TimeRange::new(20, 21)))
        .await
        .unwrap();
    assert_eq!(ids(&records), vec![b]);
    assert!(!ids(&records).contains(&a));
}

#[tokio::test]
async fn test_sensor_filter() {
    let f = fixture();
    let (_, b) = two_records(&f).await;

    let query = OverlapQuery::new(TimeRange::new(0, 100)).with_sensor("south");
    assert_eq!(ids(&f.query.run(&query).await.unwrap()), vec![b]);

    let nobody = OverlapQuery::new(TimeRange::new(0, 100)).with_sensor("east");
    assert!(f.query.run(&nobody).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_equal_starts_order_by_id() {
    let f = fixture();
    let mut submitted = Vec::new();
    for end in [90, 60, 75] {
        submitted.push(
            f.gateway
                .submit("s", RawCapture::new(50, end, "x"))
                .await
                .unwrap(),
        );
    }
    let earlier = f.gateway.submit("s", RawCapture::new(40, 45, "x")).await.unwrap();

    let records = f
        .query
        .run(&OverlapQuery::new(TimeRange::new(0, 100)))
        .await
        .unwrap();
    let mut expected = vec![earlier];
    expected.extend(submitted);
    assert_eq!(ids(&records), expected);
}

#[tokio::test]
async fn test_same_query_same_answer() {
    let f = fixture();
    for t in 0..50 {
        f.gateway
            .submit("s", RawCapture::new(t * 10, t * 10 + 15, "x"))
            .await
            .unwrap();
    }
    let query = OverlapQuery::new(TimeRange::new(100, 300));
    let first = f.query.run(&query).await.unwrap();
    let second = f.query.run(&query).await.unwrap();
    assert_eq!(first, second);
    assert!(!first.is_empty());
}

#[tokio::test]
async fn test_invalid_query_range() {
    let f = fixture();
    let err = f
        .query
        .run(&OverlapQuery::new(TimeRange::new(30, 10)))
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::InvalidRange { start: 30, end: 10 }));
}

#[tokio::test]
async fn test_get_single_record() {
    let f = fixture();
    let (a, _) = two_records(&f).await;
    let record = f.query.get(a).await.unwrap();
    assert_eq!(record.sensor_id, "north");
    assert!(f.query.get(a + 100).await.is_err());
}
