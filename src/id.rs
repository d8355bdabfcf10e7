//! # Routing Identifiers and the XOR Metric
//!
//! Every participant in the routing keyspace is addressed by a [`NodeId`]:
//! the SHA-256 digest of either a peer id or a content key. Hashing both
//! through the same function unifies the address space, so "which peers are
//! close to this key" is a meaningful question.
//!
//! Distance between two ids is their byte-wise XOR, compared as a big-endian
//! integer. The metric is symmetric and unidirectional: for a fixed target,
//! every id sits at exactly one distance, which is what makes the per-prefix
//! bucket layout of the routing table work.

use std::cmp::Ordering;
use std::fmt;

use sha2::{Digest, Sha256};

use crate::peer::PeerId;

/// Width of the routing keyspace in bytes.
pub const ID_LEN: usize = 32;

/// A 256-bit identifier in the shared peer/content keyspace.
///
/// Always the output of SHA-256, never raw input bytes. The type does not
/// remember whether it came from a peer id or a content key; once hashed,
/// both are just points under the XOR metric.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    /// Derive the routing id for a peer.
    pub fn from_peer(id: &PeerId) -> Self {
        Self(sha256(id.as_bytes()))
    }

    /// Derive the routing id for an arbitrary content key.
    pub fn from_key(key: &[u8]) -> Self {
        Self(sha256(key))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// XOR distance to another id.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Common prefix length with another id, in bits.
    pub fn common_prefix_len(&self, other: &NodeId) -> usize {
        self.distance(other).leading_zeros()
    }

    #[cfg(test)]
    pub(crate) fn from_raw(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

/// XOR distance between two [`NodeId`]s.
///
/// Ordered as a big-endian unsigned integer. Equal distances across distinct
/// ids cannot occur (XOR against a fixed target is a bijection), so the
/// ordering is total for any one lookup.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Distance([u8; ID_LEN]);

impl Distance {
    /// Index of the first set bit, i.e. the number of leading zero bits.
    ///
    /// An all-zero distance (an id compared with itself) reports
    /// `8 * ID_LEN - 1`, the deepest possible prefix, so a self-distance
    /// lands in the terminal bucket rather than past the end of the table.
    pub fn leading_zeros(&self) -> usize {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_LEN * 8 - 1
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }
}

impl Ord for Distance {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Distance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(&self.0[..8]))
    }
}

fn sha256(data: &[u8]) -> [u8; ID_LEN] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; ID_LEN];
    out.copy_from_slice(&digest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(seed: u8) -> NodeId {
        NodeId::from_key(&[seed])
    }

    #[test]
    fn peer_and_key_conversions_share_keyspace() {
        let peer = PeerId::from_bytes(b"peer_a".to_vec());
        let a = NodeId::from_peer(&peer);
        let b = NodeId::from_key(b"peer_a");
        // Same bytes hash to the same point regardless of origin.
        assert_eq!(a, b);
    }

    #[test]
    fn xor_with_self_is_zero() {
        for seed in 0..32u8 {
            let a = id(seed);
            assert!(a.distance(&a).is_zero());
        }
    }

    #[test]
    fn xor_is_symmetric() {
        for seed in 0..16u8 {
            let a = id(seed);
            let b = id(seed.wrapping_add(1));
            assert_eq!(a.distance(&b), b.distance(&a));
        }
    }

    #[test]
    fn distance_ordering_is_total_and_consistent() {
        let target = id(0);
        let mut dists: Vec<Distance> = (1..64u8).map(|s| id(s).distance(&target)).collect();
        dists.sort();
        for pair in dists.windows(2) {
            assert!(pair[0] <= pair[1]);
            // Distinct ids, distinct distances.
            assert_ne!(pair[0], pair[1]);
        }
    }

    #[test]
    fn common_prefix_len_counts_leading_zero_bits() {
        let mut a = [0u8; ID_LEN];
        let mut b = [0u8; ID_LEN];
        a[0] = 0b1000_0000;
        assert_eq!(NodeId::from_raw(a).common_prefix_len(&NodeId::from_raw(b)), 0);

        a[0] = 0b0000_0001;
        assert_eq!(NodeId::from_raw(a).common_prefix_len(&NodeId::from_raw(b)), 7);

        a[0] = 0;
        b[3] = 0b0100_0000;
        assert_eq!(NodeId::from_raw(a).common_prefix_len(&NodeId::from_raw(b)), 25);
    }

    #[test]
    fn all_zero_distance_reports_terminal_prefix() {
        let a = id(7);
        assert_eq!(a.common_prefix_len(&a), ID_LEN * 8 - 1);
    }
}
