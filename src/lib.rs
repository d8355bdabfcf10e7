//! # Mycel - Content-Addressed Peer Routing
//!
//! Mycel is the peer routing and message exchange engine of a
//! content-addressed peer-to-peer system: peers exchange opaque data blocks
//! named by cryptographic digests and locate each other and content through
//! a Kademlia-style distributed hash table.
//!
//! ## Architecture
//!
//! Three tightly coupled layers:
//!
//! - **Routing table**: XOR-metric k-buckets over a 256-bit id space, with
//!   the terminal bucket splitting as the neighbourhood fills in
//! - **Swarm**: a connection multiplexer fanning many framed TCP streams
//!   in and out of one logical duplex channel
//! - **DHT router**: request/response correlation by message id, timeouts,
//!   a TTL'd provider index, and the iterative lookup operations
//!
//! Peers and content share one keyspace: both peer ids and content keys are
//! hashed with SHA-256 into [`NodeId`]s, so the peers nearest to a key are
//! well-defined and every lookup is a walk through the same metric.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `dht` | Router, handlers, and the public DHT operations |
//! | `swarm` | Connection ownership, framing, fan-in/fan-out |
//! | `routing` | K-bucket routing table |
//! | `id` | 256-bit ids, XOR distance, prefix arithmetic |
//! | `peer` | Peer ids, peer records, multiaddr dialing |
//! | `messages` | Wire envelope and bounded serialization |
//! | `identify` | Hello handshake on fresh connections |
//! | `datastore` | Key/value interface the handlers consume |
//!
//! ## Quick Start
//!
//! ```ignore
//! let peer = Arc::new(Peer::new(peer_id, vec!["/ip4/0.0.0.0/tcp/4001".parse()?]));
//! let dht = Dht::new(peer, DhtConfig::default()).await?;
//! dht.start();
//!
//! dht.connect(&bootstrap_addr).await?;
//! dht.put_value(b"hello", b"world").await?;
//! let value = dht.get_value(b"hello", Duration::from_secs(2)).await?;
//! ```

mod config;
mod datastore;
mod dht;
mod error;
mod id;
mod identify;
mod messages;
mod peer;
mod routing;
mod swarm;

pub use config::DhtConfig;
pub use datastore::{Datastore, DatastoreError, MapDatastore};
pub use dht::{Dht, RouterEvent};
pub use error::DhtError;
pub use id::{Distance, NodeId};
pub use messages::{
    generate_message_id, marshal, unmarshal, DiagInfo, Envelope, MessageKind, PeerInfo,
};
pub use peer::{dial_args, Peer, PeerId};
pub use routing::RoutingTable;
pub use swarm::{Conn, Message, Swarm, SwarmChannels, SwarmError};

// Re-exported so API consumers and tests build addresses without naming the
// multiaddr crate themselves.
pub use multiaddr::Multiaddr;
