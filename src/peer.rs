//! # Peer Identity and Records
//!
//! A [`PeerId`] is an opaque byte string naming a peer (in the ambient
//! system it is a multihash of the peer's public key; the router never looks
//! inside it). A [`Peer`] is the shared record the routing table, swarm and
//! DHT all reference: id, dialable addresses, and a measured latency.
//!
//! Peer records are shared immutably behind `Arc`. The single exception is
//! latency, which ping updates and lookups read concurrently; it sits behind
//! its own reader/writer lock so the hot read path never contends with
//! anything else.

use std::fmt;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{anyhow, Result};
use multiaddr::{Multiaddr, Protocol};
use serde::{Deserialize, Serialize};

/// Opaque peer identifier. Equality is byte equality.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(Vec<u8>);

impl PeerId {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Short hex rendering for log lines.
    pub fn short(&self) -> String {
        let n = self.0.len().min(8);
        hex::encode(&self.0[..n])
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

/// A peer known to this node: identity plus the addresses it can be
/// reached at.
///
/// Constructed once and shared via `Arc`; a peer learned again with a
/// different address becomes a fresh record replacing the old reference.
pub struct Peer {
    id: PeerId,
    addresses: Vec<Multiaddr>,
    latency: RwLock<Duration>,
}

impl Peer {
    pub fn new(id: PeerId, addresses: Vec<Multiaddr>) -> Self {
        Self {
            id,
            addresses,
            latency: RwLock::new(Duration::ZERO),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn addresses(&self) -> &[Multiaddr] {
        &self.addresses
    }

    /// First address whose protocol stack names the given transport
    /// (e.g. `"tcp"`).
    pub fn net_address(&self, network: &str) -> Option<&Multiaddr> {
        self.addresses
            .iter()
            .find(|addr| addr.iter().any(|proto| protocol_name(&proto) == network))
    }

    /// Last measured round-trip time, zero until the first successful ping.
    pub fn latency(&self) -> Duration {
        *self.latency.read().expect("latency lock poisoned")
    }

    pub fn set_latency(&self, rtt: Duration) {
        *self.latency.write().expect("latency lock poisoned") = rtt;
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addresses", &self.addresses)
            .finish()
    }
}

fn protocol_name(proto: &Protocol<'_>) -> &'static str {
    match proto {
        Protocol::Tcp(_) => "tcp",
        Protocol::Udp(_) => "udp",
        Protocol::Ip4(_) => "ip4",
        Protocol::Ip6(_) => "ip6",
        Protocol::Dns(_) | Protocol::Dns4(_) | Protocol::Dns6(_) => "dns",
        _ => "",
    }
}

/// Split a multiaddr into dial arguments: the transport name and a
/// `host:port` string suitable for the socket API.
///
/// Only the shapes this network actually dials are supported: an ip4/ip6/dns
/// component followed by tcp.
pub fn dial_args(addr: &Multiaddr) -> Result<(&'static str, String)> {
    let mut host: Option<String> = None;
    let mut port: Option<u16> = None;

    for proto in addr.iter() {
        match proto {
            Protocol::Ip4(ip) => host = Some(ip.to_string()),
            Protocol::Ip6(ip) => host = Some(format!("[{}]", ip)),
            Protocol::Dns(name) | Protocol::Dns4(name) | Protocol::Dns6(name) => {
                host = Some(name.to_string())
            }
            Protocol::Tcp(p) => port = Some(p),
            _ => {}
        }
    }

    match (host, port) {
        (Some(host), Some(port)) => Ok(("tcp", format!("{}:{}", host, port))),
        _ => Err(anyhow!("no dialable tcp endpoint in {}", addr)),
    }
}
