//! # XOR-Metric Routing Table
//!
//! Kademlia-style routing table over the [`NodeId`](crate::id::NodeId)
//! keyspace. Peers are grouped into buckets by the common prefix length of
//! their id with the local id; within a bucket, most recently seen sits at
//! the front.
//!
//! The table starts with a single bucket. Only the terminal bucket splits:
//! when it overflows, peers whose prefix length exceeds the bucket's index
//! move into a freshly appended bucket. This subdivides the keyspace near
//! the local id, where lookups spend most of their effort, and leaves the
//! coarse far-away buckets alone. A non-terminal bucket that overflows
//! evicts its least recently seen peer instead.
//!
//! Invariants the tests pin down:
//! - every peer lives in exactly one bucket;
//! - a peer's bucket index is `min(cpl(peer, local), buckets - 1)`;
//! - splitting never loses or duplicates a peer;
//! - `nearest_peers` returns ascending XOR distance to the target.
//!
//! One reader/writer lock guards the whole table. Every operation completes
//! without suspending, so the lock is never held across I/O or a channel
//! send.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::id::NodeId;
use crate::peer::{Peer, PeerId};

/// A bucket entry: the peer plus its cached routing id, so repeated
/// distance computations skip the hash.
#[derive(Clone)]
struct Entry {
    node_id: NodeId,
    peer: Arc<Peer>,
}

/// Ordered peer list, most recently seen at the front.
#[derive(Default)]
struct Bucket {
    entries: VecDeque<Entry>,
}

impl Bucket {
    fn position(&self, id: &PeerId) -> Option<usize> {
        self.entries.iter().position(|e| e.peer.id() == id)
    }

    fn push_front(&mut self, entry: Entry) {
        self.entries.push_front(entry);
    }

    fn move_to_front(&mut self, pos: usize) {
        if let Some(entry) = self.entries.remove(pos) {
            self.entries.push_front(entry);
        }
    }

    fn pop_back(&mut self) -> Option<Entry> {
        self.entries.pop_back()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drain every entry whose prefix length with `local` strictly exceeds
    /// `index` into a new bucket, preserving recency order on both sides.
    fn split(&mut self, index: usize, local: &NodeId) -> Bucket {
        let mut closer = VecDeque::new();
        let mut kept = VecDeque::new();
        for entry in self.entries.drain(..) {
            if local.common_prefix_len(&entry.node_id) > index {
                closer.push_back(entry);
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        Bucket { entries: closer }
    }
}

struct TableInner {
    buckets: Vec<Bucket>,
}

/// Routing table keyed by XOR distance from the local node.
pub struct RoutingTable {
    local: NodeId,
    bucket_size: usize,
    inner: RwLock<TableInner>,
}

impl RoutingTable {
    pub fn new(bucket_size: usize, local: NodeId) -> Self {
        Self {
            local,
            bucket_size,
            inner: RwLock::new(TableInner {
                buckets: vec![Bucket::default()],
            }),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local
    }

    /// Record contact with a peer: bump it to the front of its bucket, or
    /// insert it. Returns the peer evicted to make room, if any.
    pub fn update(&self, peer: Arc<Peer>) -> Option<Arc<Peer>> {
        let node_id = NodeId::from_peer(peer.id());
        let mut inner = self.inner.write().expect("routing table lock poisoned");

        let last = inner.buckets.len() - 1;
        let index = self.local.common_prefix_len(&node_id).min(last);

        let bucket = &mut inner.buckets[index];
        if let Some(pos) = bucket.position(peer.id()) {
            bucket.move_to_front(pos);
            return None;
        }

        bucket.push_front(Entry { node_id, peer });
        if bucket.len() <= self.bucket_size {
            return None;
        }

        if index < last {
            let evicted = bucket.pop_back();
            if let Some(e) = &evicted {
                debug!(
                    peer = %e.peer.id(),
                    bucket = index,
                    "bucket full, evicting least recently seen"
                );
            }
            return evicted.map(|e| e.peer);
        }

        // Terminal bucket: split off the closer half, then evict only if
        // the overflow survived the split.
        let new_bucket = inner.buckets[index].split(index, &self.local);
        inner.buckets.push(new_bucket);
        debug!(
            buckets = inner.buckets.len(),
            "terminal bucket overflow, split"
        );

        for i in [index, index + 1] {
            if inner.buckets[i].len() > self.bucket_size {
                let evicted = inner.buckets[i].pop_back();
                if let Some(e) = &evicted {
                    debug!(
                        peer = %e.peer.id(),
                        bucket = i,
                        "bucket still full after split, evicting tail"
                    );
                }
                return evicted.map(|e| e.peer);
            }
        }
        None
    }

    /// Up to `count` peers, ascending by XOR distance to `target`.
    ///
    /// Candidates come from the target's own bucket. A bucket left empty by
    /// a recent split falls back to its neighbours on either side.
    pub fn nearest_peers(&self, target: &NodeId, count: usize) -> Vec<Arc<Peer>> {
        let inner = self.inner.read().expect("routing table lock poisoned");

        let last = inner.buckets.len() - 1;
        let index = self.local.common_prefix_len(target).min(last);

        let mut candidates: Vec<&Entry> = Vec::new();
        if inner.buckets[index].is_empty() {
            if index > 0 {
                candidates.extend(inner.buckets[index - 1].entries.iter());
            }
            if index < last {
                candidates.extend(inner.buckets[index + 1].entries.iter());
            }
        } else {
            candidates.extend(inner.buckets[index].entries.iter());
        }

        let mut by_distance: Vec<_> = candidates
            .into_iter()
            .map(|e| (e.node_id.distance(target), e.peer.clone()))
            .collect();
        by_distance.sort_by(|a, b| a.0.cmp(&b.0));
        by_distance
            .into_iter()
            .take(count)
            .map(|(_, peer)| peer)
            .collect()
    }

    /// The single nearest peer to `target`, if the table has anyone to offer.
    pub fn nearest_peer(&self, target: &NodeId) -> Option<Arc<Peer>> {
        self.nearest_peers(target, 1).into_iter().next()
    }

    /// Exact lookup by peer id.
    pub fn find(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.nearest_peer(&NodeId::from_peer(id))
            .filter(|peer| peer.id() == id)
    }

    /// Total number of peers across all buckets.
    pub fn size(&self) -> usize {
        let inner = self.inner.read().expect("routing table lock poisoned");
        inner.buckets.iter().map(|b| b.len()).sum()
    }

    /// Number of buckets currently in the table.
    pub fn bucket_count(&self) -> usize {
        self.inner
            .read()
            .expect("routing table lock poisoned")
            .buckets
            .len()
    }

    #[cfg(test)]
    fn bucket_prefix_lens(&self) -> Vec<Vec<usize>> {
        let inner = self.inner.read().expect("routing table lock poisoned");
        inner
            .buckets
            .iter()
            .map(|b| {
                b.entries
                    .iter()
                    .map(|e| self.local.common_prefix_len(&e.node_id))
                    .collect()
            })
            .collect()
    }
}
