//! Integration tests for provider announcement and peer discovery across
//! small clusters.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use tokio::time::{sleep, Duration, Instant};

use mycel::{Dht, DhtConfig, DhtError, Multiaddr, Peer, PeerId};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(46000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

async fn spawn_node(name: String) -> (Arc<Dht>, Multiaddr) {
    let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/{}", next_port())
        .parse()
        .expect("valid multiaddr");
    let peer = Arc::new(Peer::new(
        PeerId::from_bytes(name.into_bytes()),
        vec![addr.clone()],
    ));
    let dht = Dht::new(peer, DhtConfig::default())
        .await
        .expect("node bind failed");
    dht.start();
    (dht, addr)
}

/// Spawn `n` nodes and connect every pair.
async fn spawn_cluster(prefix: &str, n: usize) -> Vec<(Arc<Dht>, Multiaddr)> {
    let mut nodes = Vec::with_capacity(n);
    for i in 0..n {
        nodes.push(spawn_node(format!("{}_{}", prefix, i)).await);
    }
    for i in 0..n {
        for j in (i + 1)..n {
            let addr = nodes[j].1.clone();
            nodes[i].0.connect(&addr).await.expect("cluster connect");
        }
    }
    nodes
}

/// Wait until `check` passes or two seconds elapse.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[tokio::test]
async fn provider_round_trip() {
    let cluster = spawn_cluster("prov", 4).await;
    let announcer_id = cluster[0].0.self_peer().id().clone();

    cluster[0].0.provide(b"k").await.expect("provide failed");

    // The announcement fans out to the nearest pool, which in a
    // four-node cluster is everyone else.
    for (node, _) in &cluster[1..] {
        let node = node.clone();
        let id = announcer_id.clone();
        assert!(
            eventually(move || node
                .providers_for(b"k")
                .iter()
                .any(|p| *p.id() == id))
            .await,
            "announcement should reach every pool member"
        );
    }

    let providers = cluster[0]
        .0
        .find_providers(b"k", Duration::from_secs(2))
        .await
        .expect("find_providers failed");
    assert!(
        providers.iter().any(|p| *p.id() == announcer_id),
        "announcer should come back as a provider"
    );
    // And the query pulled the providers into the local index.
    assert!(cluster[0]
        .0
        .providers_for(b"k")
        .iter()
        .any(|p| *p.id() == announcer_id));

    for (node, _) in &cluster {
        node.halt();
    }
}

#[tokio::test]
async fn find_peer_through_intermediate() {
    let (dht_a, _addr_a) = spawn_node("fp_a".to_string()).await;
    let (dht_b, addr_b) = spawn_node("fp_b".to_string()).await;
    let (dht_c, _addr_c) = spawn_node("fp_c".to_string()).await;

    // A and C both know only B.
    dht_a.connect(&addr_b).await.expect("a -> b");
    dht_c.connect(&addr_b).await.expect("c -> b");

    let wanted = dht_c.self_peer().id().clone();
    let found = dht_a
        .find_peer(&wanted, Duration::from_secs(2))
        .await
        .expect("find_peer failed");
    assert_eq!(*found.id(), wanted);

    dht_a.halt();
    dht_b.halt();
    dht_c.halt();
}

#[tokio::test]
async fn find_unknown_peer_reports_not_found() {
    let (dht_a, _addr_a) = spawn_node("fu_a".to_string()).await;
    let (dht_b, addr_b) = spawn_node("fu_b".to_string()).await;

    dht_a.connect(&addr_b).await.expect("connect failed");

    let ghost = PeerId::from_bytes(b"nobody_has_seen_me".to_vec());
    let result = dht_a.find_peer(&ghost, Duration::from_secs(2)).await;
    assert!(
        matches!(result, Err(DhtError::NotFound) | Err(DhtError::SearchIncomplete)),
        "unknown peer must not resolve"
    );

    dht_a.halt();
    dht_b.halt();
}

#[tokio::test]
async fn providers_expire_from_queries() {
    // The receiving node runs a TTL short enough to observe expiry through
    // the public query.
    let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/{}", next_port())
        .parse()
        .expect("valid multiaddr");
    let peer = Arc::new(Peer::new(
        PeerId::from_bytes(b"ttl_node".to_vec()),
        vec![addr.clone()],
    ));
    let mut config = DhtConfig::default();
    config.provider_ttl = Duration::from_millis(200);
    let dht = Dht::new(peer, config).await.expect("node bind failed");
    dht.start();

    let (announcer, _addr) = spawn_node("ttl_announcer".to_string()).await;
    announcer.connect(&addr).await.expect("connect failed");
    announcer.provide(b"k").await.expect("provide failed");

    let ttl_dht = dht.clone();
    assert!(
        eventually(move || !ttl_dht.providers_for(b"k").is_empty()).await,
        "announcement should land"
    );

    sleep(Duration::from_millis(300)).await;
    assert!(
        dht.providers_for(b"k").is_empty(),
        "expired entries must not be served"
    );

    announcer.halt();
    dht.halt();
}
