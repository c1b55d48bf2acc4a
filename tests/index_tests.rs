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

use nidus_store::index::{CheckpointFile, IntervalIndex};
use nidus_store::{BoundingBox, IndexError, TimeRange};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn sorted(mut ids: Vec<u64>) -> Vec<u64> {
    ids.sort_unstable();
    ids
}

#[test]
fn test_containing_query_returns_entry() {
    let index = IntervalIndex::new();
    index.insert(1, TimeRange::new(100, 200), None).unwrap();

    assert_eq!(index.query_overlap(&TimeRange::new(0, 1000), None), vec![1]);
    assert_eq!(index.query_overlap(&TimeRange::new(150, 151), None), vec![1]);
}

#[test]
fn test_boundary_touch_is_excluded() {
    let index = IntervalIndex::new();
    index.insert(1, TimeRange::new(10, 20), None).unwrap();

    // Query ends where the entry starts
    assert!(index.query_overlap(&TimeRange::new(0, 10), None).is_empty());
    // Query starts where the entry ends
    assert!(index.query_overlap(&TimeRange::new(20, 30), None).is_empty());
    // One microsecond inside either edge overlaps
    assert_eq!(index.query_overlap(&TimeRange::new(0, 11), None), vec![1]);
    assert_eq!(index.query_overlap(&TimeRange::new(19, 30), None), vec![1]);
}

#[test]
fn test_two_record_example() {
    let index = IntervalIndex::new();
    index
        .insert(1, TimeRange::new(10, 20), Some(BoundingBox::point(1.0, 1.0)))
        .unwrap();
    index
        .insert(2, TimeRange::new(20, 30), Some(BoundingBox::point(5.0, 5.0)))
        .unwrap();

    assert_eq!(sorted(index.query_overlap(&TimeRange::new(15, 25), None)), vec![1, 2]);

    let around_a = BoundingBox::new(0.0, 0.0, 2.0, 2.0);
    assert_eq!(
        index.query_overlap(&TimeRange::new(0, 100), Some(&around_a)),
        vec![1]
    );
}

#[test]
fn test_identical_entries_are_not_deduplicated() {
    let index = IntervalIndex::new();
    let location = Some(BoundingBox::point(3.0, 4.0));
    for id in 1..=3 {
        index.insert(id, TimeRange::new(50, 60), location).unwrap();
    }
    assert_eq!(index.len(), 3);
    assert_eq!(
        sorted(index.query_overlap(&TimeRange::new(55, 56), None)),
        vec![1, 2, 3]
    );
}

#[test]
fn test_bbox_query_skips_unlocated_entries() {
    let index = IntervalIndex::new();
    index.insert(1, TimeRange::new(0, 10), None).unwrap();
    index
        .insert(2, TimeRange::new(0, 10), Some(BoundingBox::point(0.5, 0.5)))
        .unwrap();

    let everywhere = BoundingBox::new(-180.0, -90.0, 180.0, 90.0);
    assert_eq!(index.query_overlap(&TimeRange::new(0, 10), Some(&everywhere)), vec![2]);
    assert_eq!(sorted(index.query_overlap(&TimeRange::new(0, 10), None)), vec![1, 2]);
}

#[test]
fn test_bbox_edge_contact_intersects() {
    let index = IntervalIndex::new();
    index
        .insert(1, TimeRange::new(0, 10), Some(BoundingBox::new(0.0, 0.0, 1.0, 1.0)))
        .unwrap();
    let neighbour = BoundingBox::new(1.0, 0.0, 2.0, 1.0);
    assert_eq!(index.query_overlap(&TimeRange::new(0, 10), Some(&neighbour)), vec![1]);
}

#[test]
fn test_repeated_query_is_identical() {
    let index = IntervalIndex::new();
    for id in 1..=200u64 {
        let start = (id as i64 * 37) % 1000;
        index
            .insert(id, TimeRange::new(start, start + 25), None)
            .unwrap();
    }
    let range = TimeRange::new(400, 600);
    let first = index.query_overlap(&range, None);
    let second = index.query_overlap(&range, None);
    assert_eq!(first, second);
    assert!(!first.is_empty());
}

#[test]
fn test_concurrent_inserts_and_queries() {
    let index = Arc::new(IntervalIndex::new());
    let writers: Vec<_> = (0..4u64)
        .map(|w| {
            let index = index.clone();
            thread::spawn(move || {
                for i in 0..250u64 {
                    let id = w * 1000 + i + 1;
                    let start = i as i64 * 10;
                    index.insert(id, TimeRange::new(start, start + 5), None).unwrap();
                }
            })
        })
        .collect();

    let reader = {
        let index = index.clone();
        thread::spawn(move || {
            let mut last = 0;
            for _ in 0..200 {
                let seen = index.query_overlap(&TimeRange::new(i64::MIN, i64::MAX), None).len();
                // Published versions only grow
                assert!(seen >= last);
                last = seen;
            }
        })
    };

    for w in writers {
        w.join().unwrap();
    }
    reader.join().unwrap();

    assert_eq!(index.len(), 1000);
    assert_eq!(index.query_overlap(&TimeRange::new(0, 5), None).len(), 4);
}

#[test]
fn test_seal_blocks_inserts_until_unsealed() {
    let index = IntervalIndex::new();
    index.seal();
    assert_eq!(
        index.insert(1, TimeRange::new(0, 1), None),
        Err(IndexError::Sealed)
    );
    index.unseal();
    assert_eq!(index.insert(1, TimeRange::new(0, 1), None), Ok(true));
}

#[tokio::test]
async fn test_checkpoint_round_trip_preserves_queries() {
    let dir = TempDir::new().unwrap();
    let index = IntervalIndex::new();
    index
        .insert(1, TimeRange::new(10, 20), Some(BoundingBox::point(1.0, 1.0)))
        .unwrap();
    index.insert(2, TimeRange::new(20, 30), None).unwrap();

    let file = CheckpointFile::new(dir.path().join("index.ckpt"));
    assert_eq!(file.write(None, 512, &index.snapshot()).await.unwrap(), 2);

    let checkpoint = file.load().await.unwrap().unwrap();
    assert_eq!(checkpoint.log_position, 512);

    let restored = IntervalIndex::from_entries(checkpoint.entries);
    let range = TimeRange::new(15, 25);
    assert_eq!(
        sorted(restored.query_overlap(&range, None)),
        sorted(index.query_overlap(&range, None))
    );
    let bbox = BoundingBox::new(0.0, 0.0, 2.0, 2.0);
    assert_eq!(restored.query_overlap(&range, Some(&bbox)), vec![1]);
}

#[tokio::test]
async fn test_corrupt_checkpoint_is_reported() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("index.ckpt");
    let file = CheckpointFile::new(&path);
    assert!(file.load().await.unwrap().is_none());

    let index = IntervalIndex::new();
    index.insert(1, TimeRange::new(0, 5), None).unwrap();
    file.write(None, 100, &index.snapshot()).await.unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&path, bytes).unwrap();

    assert!(file.load().await.is_err());
}

#[test]
fn test_entries_follow_start_then_id() {
    let index = IntervalIndex::new();
    index.insert(7, TimeRange::new(50, 60), None).unwrap();
    index.insert(3, TimeRange::new(50, 90), None).unwrap();
    index.insert(9, TimeRange::new(10, 20), None).unwrap();

    let order: Vec<u64> = index.entries().iter().map(|e| e.record_id).collect();
    assert_eq!(order, vec![9, 3, 7]);
}
