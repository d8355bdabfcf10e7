//! Per-instance DHT configuration.
//!
//! Every tunable the router consults lives here so that two nodes in one
//! process (the normal shape of the test suite) can run with different
//! settings. Nothing in the crate reads process-global state.

use std::time::Duration;

/// Configuration for a [`crate::Dht`] instance.
///
/// The defaults are the standard Kademlia parameters this network runs with;
/// tests shrink the timing knobs to keep runs fast.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Maximum peers per routing bucket (Kademlia k).
    pub bucket_size: usize,

    /// Number of nearest peers an ADD_PROVIDER announcement is sent to.
    pub pool_size: usize,

    /// Age after which a provider entry is dropped by the sweeper.
    pub provider_ttl: Duration,

    /// Interval between sweeper passes over providers and listeners.
    pub sweep_interval: Duration,

    /// Number of nearest peers a DIAGNOSTIC request is forwarded to.
    pub diag_fanout: usize,

    /// How long a node gathers diagnostic replies before answering with
    /// whatever it has.
    pub diag_local_deadline: Duration,

    /// Listener deadline for forwarded diagnostic replies.
    pub diag_listener_deadline: Duration,

    /// Deadline for the identify exchange on a fresh connection.
    pub handshake_timeout: Duration,

    /// Buffer size of the per-connection frame channels and the swarm
    /// inbox/outbox. Bounded so a slow peer exerts backpressure instead of
    /// growing a queue.
    pub channel_buffer: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bucket_size: 20,
            pool_size: 6,
            provider_ttl: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            diag_fanout: 10,
            diag_local_deadline: Duration::from_secs(20),
            diag_listener_deadline: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            channel_buffer: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let cfg = DhtConfig::default();
        assert_eq!(cfg.bucket_size, 20);
        assert_eq!(cfg.pool_size, 6);
        assert_eq!(cfg.provider_ttl, Duration::from_secs(3600));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(300));
        assert_eq!(cfg.diag_fanout, 10);
    }
}
