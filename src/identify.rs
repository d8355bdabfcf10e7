//! Identify handshake.
//!
//! Runs once on every fresh transport connection, before the connection is
//! registered with the swarm. Each side sends a single `Hello` frame naming
//! its peer id and the addresses it listens on; the initiator writes first.
//! The listen addresses matter for inbound connections: the observed remote
//! port is an ephemeral dial-out port, so without the advertised addresses
//! an inbound peer would not be dialable later.
//!
//! The exchange is unauthenticated plaintext. Identity verification is a
//! concern of the ambient system, not this engine.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

use crate::messages::{marshal, unmarshal};
use crate::peer::{Peer, PeerId};
use crate::swarm::{read_frame, write_frame};

/// The one handshake frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hello {
    pub id: PeerId,
    /// Multiaddr strings the sender accepts connections on.
    pub listen_addrs: Vec<String>,
}

impl Hello {
    fn for_peer(peer: &Peer) -> Self {
        Self {
            id: peer.id().clone(),
            listen_addrs: peer.addresses().iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Handshake as the dialing side: send our hello, then read theirs.
pub async fn outbound(local: &Peer, stream: &mut TcpStream, deadline: Duration) -> Result<Hello> {
    timeout(deadline, async {
        send_hello(local, stream).await?;
        recv_hello(stream).await
    })
    .await
    .map_err(|_| anyhow!("handshake timed out"))?
}

/// Handshake as the accepting side: read the dialer's hello, then answer.
pub async fn inbound(local: &Peer, stream: &mut TcpStream, deadline: Duration) -> Result<Hello> {
    timeout(deadline, async {
        let hello = recv_hello(stream).await?;
        send_hello(local, stream).await?;
        Ok(hello)
    })
    .await
    .map_err(|_| anyhow!("handshake timed out"))?
}

async fn send_hello(local: &Peer, stream: &mut TcpStream) -> Result<()> {
    let bytes = marshal(&Hello::for_peer(local)).context("failed to encode hello")?;
    write_frame(stream, &bytes).await
}

async fn recv_hello(stream: &mut TcpStream) -> Result<Hello> {
    let frame = read_frame(stream)
        .await?
        .ok_or_else(|| anyhow!("connection closed during handshake"))?;
    let hello: Hello = unmarshal(&frame).context("failed to decode hello")?;
    if hello.id.as_bytes().is_empty() {
        return Err(anyhow!("peer sent empty id"));
    }
    trace!(peer = %hello.id, addrs = hello.listen_addrs.len(), "handshake complete");
    Ok(hello)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn make_peer(name: &[u8], addr: &str) -> Peer {
        Peer::new(
            PeerId::from_bytes(name.to_vec()),
            vec![addr.parse().expect("valid multiaddr")],
        )
    }

    #[tokio::test]
    async fn hello_exchange_both_directions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let alice = make_peer(b"alice", "/ip4/127.0.0.1/tcp/7001");
        let bob = make_peer(b"bob", "/ip4/127.0.0.1/tcp/7002");

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            inbound(&bob, &mut stream, Duration::from_secs(2)).await
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let bob_hello = outbound(&alice, &mut stream, Duration::from_secs(2))
            .await
            .unwrap();
        let alice_hello = server.await.unwrap().unwrap();

        assert_eq!(bob_hello.id, PeerId::from_bytes(b"bob".to_vec()));
        assert_eq!(alice_hello.id, PeerId::from_bytes(b"alice".to_vec()));
        assert_eq!(alice_hello.listen_addrs, vec!["/ip4/127.0.0.1/tcp/7001"]);
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept but never speak.
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let alice = make_peer(b"alice", "/ip4/127.0.0.1/tcp/7003");
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let result = outbound(&alice, &mut stream, Duration::from_millis(100)).await;
        assert!(result.is_err());
    }
}
