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

/// Persistent augmented AVL tree over interval start points
///
/// Every node caches two summaries of its subtree:
/// - `max_end`: the largest exclusive end of any interval below it
/// - `extent`: the union of all located entries below it
///
/// Overlap search skips a subtree when its `max_end` is at or before the
/// query start, when the query end is at or before the node start (right
/// side only, since starts are ordered), or when a bounding box is given and
/// the subtree extent misses it.
///
/// Insertion copies only the root-to-leaf path and shares everything else,
/// so an existing tree value is never modified. Readers holding an older
/// tree keep a consistent view while newer versions are published.
use std::cmp::Ordering;
use std::sync::Arc;

use crate::record::{BoundingBox, IndexEntry, RecordId, TimeRange};

type Link = Option<Arc<Node>>;

#[derive(Debug)]
struct Node {
    entry: IndexEntry,
    left: Link,
    right: Link,
    height: u32,
    size: usize,
    max_end: i64,
    extent: Option<BoundingBox>,
}

impl Node {
    fn build(entry: IndexEntry, left: Link, right: Link) -> Arc<Node> {
        let height = 1 + height(&left).max(height(&right));
        let size = 1 + size(&left) + size(&right);
        let max_end = entry
            .time_range
            .end
            .max(max_end(&left))
            .max(max_end(&right));
        let extent = union(union(entry.location, extent(&left)), extent(&right));
        Arc::new(Node {
            entry,
            left,
            right,
            height,
            size,
            max_end,
            extent,
        })
    }
}

fn height(link: &Link) -> u32 {
    link.as_ref().map_or(0, |n| n.height)
}

fn size(link: &Link) -> usize {
    link.as_ref().map_or(0, |n| n.size)
}

fn max_end(link: &Link) -> i64 {
    link.as_ref().map_or(i64::MIN, |n| n.max_end)
}

fn extent(link: &Link) -> Option<BoundingBox> {
    link.as_ref().and_then(|n| n.extent)
}

fn union(a: Option<BoundingBox>, b: Option<BoundingBox>) -> Option<BoundingBox> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.union(&b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Rebuild a node whose children differ in height by at most two
fn balance(entry: IndexEntry, left: Link, right: Link) -> Arc<Node> {
    let (hl, hr) = (height(&left), height(&right));
    if hl > hr + 1 {
        if let Some(l) = &left {
            if height(&l.left) >= height(&l.right) {
                return Node::build(
                    l.entry,
                    l.left.clone(),
                    Some(Node::build(entry, l.right.clone(), right)),
                );
            }
            if let Some(lr) = &l.right {
                return Node::build(
                    lr.entry,
                    Some(Node::build(l.entry, l.left.clone(), lr.left.clone())),
                    Some(Node::build(entry, lr.right.clone(), right)),
                );
            }
        }
    } else if hr > hl + 1 {
        if let Some(r) = &right {
            if height(&r.right) >= height(&r.left) {
                return Node::build(
                    r.entry,
                    Some(Node::build(entry, left, r.left.clone())),
                    r.right.clone(),
                );
            }
            if let Some(rl) = &r.left {
                return Node::build(
                    rl.entry,
                    Some(Node::build(entry, left, rl.left.clone())),
                    Some(Node::build(r.entry, rl.right.clone(), r.right.clone())),
                );
            }
        }
    }
    Node::build(entry, left, right)
}

/// Returns the new subtree, or `None` when the key is already present
fn insert(link: &Link, entry: IndexEntry) -> Option<Arc<Node>> {
    let Some(node) = link else {
        return Some(Node::build(entry, None, None));
    };
    match entry.key().cmp(&node.entry.key()) {
        Ordering::Equal => None,
        Ordering::Less => {
            let left = insert(&node.left, entry)?;
            Some(balance(node.entry, Some(left), node.right.clone()))
        }
        Ordering::Greater => {
            let right = insert(&node.right, entry)?;
            Some(balance(node.entry, node.left.clone(), Some(right)))
        }
    }
}

fn collect_overlaps(
    link: &Link,
    range: &TimeRange,
    bbox: Option<&BoundingBox>,
    out: &mut Vec<RecordId>,
) {
    let Some(node) = link else { return };
    if node.max_end <= range.start {
        return;
    }
    if let Some(b) = bbox {
        if !node.extent.is_some_and(|e| e.intersects(b)) {
            return;
        }
    }
    collect_overlaps(&node.left, range, bbox, out);
    if node.entry.time_range.start >= range.end {
        return;
    }
    if node.entry.matches(range, bbox) {
        out.push(node.entry.record_id);
    }
    collect_overlaps(&node.right, range, bbox, out);
}

fn collect_in_order(link: &Link, out: &mut Vec<IndexEntry>) {
    if let Some(node) = link {
        collect_in_order(&node.left, out);
        out.push(node.entry);
        collect_in_order(&node.right, out);
    }
}

fn build_sorted(entries: &[IndexEntry]) -> Link {
    if entries.is_empty() {
        return None;
    }
    let mid = entries.len() / 2;
    Some(Node::build(
        entries[mid],
        build_sorted(&entries[..mid]),
        build_sorted(&entries[mid + 1..]),
    ))
}

/// Immutable interval tree value; cloning is O(1)
#[derive(Debug, Clone, Default)]
pub struct IntervalTree {
    root: Link,
}

impl IntervalTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bulk-build a balanced tree. Entries may arrive in any order; repeated
    /// keys keep the first occurrence.
    pub fn from_entries(mut entries: Vec<IndexEntry>) -> Self {
        entries.sort_by_key(|e| e.key());
        entries.dedup_by_key(|e| e.key());
        Self {
            root: build_sorted(&entries),
        }
    }

    /// New version containing `entry`, or `None` if its key is already present
    pub fn insert(&self, entry: IndexEntry) -> Option<IntervalTree> {
        insert(&self.root, entry).map(|root| IntervalTree { root: Some(root) })
    }

    pub fn contains(&self, start: i64, record_id: RecordId) -> bool {
        let key = (start, record_id);
        let mut cursor = &self.root;
        while let Some(node) = cursor {
            cursor = match key.cmp(&node.entry.key()) {
                Ordering::Equal => return true,
                Ordering::Less => &node.left,
                Ordering::Greater => &node.right,
            };
        }
        false
    }

    /// Ids of every entry overlapping `range` (and `bbox`, if given), in start order
    pub fn query(&self, range: &TimeRange, bbox: Option<&BoundingBox>) -> Vec<RecordId> {
        let mut out = Vec::new();
        if range.is_valid() {
            collect_overlaps(&self.root, range, bbox, &mut out);
        }
        out
    }

    pub fn entries(&self) -> Vec<IndexEntry> {
        let mut out = Vec::with_capacity(self.len());
        collect_in_order(&self.root, &mut out);
        out
    }

    pub fn len(&self) -> usize {
        size(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn height(&self) -> u32 {
        height(&self.root)
    }

    /// Largest end of any stored interval
    pub fn max_end(&self) -> Option<i64> {
        self.root.as_ref().map(|n| n.max_end)
    }
}
