//! # Connection Swarm
//!
//! The swarm owns every live connection and multiplexes them onto one
//! logical duplex channel. Upper layers address peers, not sockets: they
//! push `{peer, bytes}` messages into the outbox and read `{peer, bytes}`
//! messages from the inbox, and the swarm takes care of which TCP stream
//! the bytes belong to.
//!
//! ## Tasks
//!
//! - one **fan-out** task drains the outbox and forwards each message to
//!   the right connection's write channel;
//! - one **fan-in** task per connection forwards received frames into the
//!   shared inbox;
//! - each connection runs a reader and a writer task against the socket.
//!
//! Frames are length-prefixed (4-byte big-endian) with a size cap matching
//! the wire envelope limit.
//!
//! ## Failure model
//!
//! A send to a peer without an open connection, a handshake failure, or a
//! dead transport all surface on the errors channel; none of them take the
//! swarm down. A failed connection closes alone, and its fan-in task
//! removes it from the map on the way out.
//!
//! The connection map sits behind a reader/writer lock. The lock is taken
//! only to look up, insert or remove an entry; it is never held across a
//! channel send or any other await point.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use multiaddr::Multiaddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::identify;
use crate::messages::MAX_ENVELOPE_SIZE;
use crate::peer::{dial_args, Peer, PeerId};

/// Hard cap on a single wire frame.
pub const MAX_FRAME_SIZE: usize = MAX_ENVELOPE_SIZE as usize;

// ============================================================================
// Framing
// ============================================================================

/// Write one length-prefixed frame.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(anyhow!(
            "frame too large: {} bytes (max {})",
            data.len(),
            MAX_FRAME_SIZE
        ));
    }
    writer.write_u32(data.len() as u32).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. Returns `None` on clean end of stream.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(v) => v as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(anyhow!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

// ============================================================================
// Connection
// ============================================================================

/// One framed duplex stream to a peer, exclusively owned by the swarm.
///
/// The reader and writer tasks hold the socket halves; the `Conn` value
/// itself only holds channel ends and the closed signal, so closing is a
/// signal, not an I/O operation.
pub struct Conn {
    peer: Arc<Peer>,
    remote_addr: Option<SocketAddr>,
    outgoing: mpsc::Sender<Vec<u8>>,
    incoming: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    closed: watch::Sender<bool>,
}

impl Conn {
    /// Take ownership of a handshaken stream and start its reader and
    /// writer tasks.
    fn spawn(peer: Arc<Peer>, stream: TcpStream, buffer: usize) -> Arc<Self> {
        let remote_addr = stream.peer_addr().ok();
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(buffer);
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(buffer);
        let (closed_tx, _) = watch::channel(false);
        let (mut read_half, mut write_half) = stream.into_split();

        let mut writer_closed = closed_tx.subscribe();
        let writer_peer = peer.id().clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_closed.changed() => break,
                    frame = out_rx.recv() => match frame {
                        Some(data) => {
                            if let Err(e) = write_frame(&mut write_half, &data).await {
                                debug!(peer = %writer_peer, error = %e, "connection write failed");
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });

        let mut reader_closed = closed_tx.subscribe();
        let reader_peer = peer.id().clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_closed.changed() => break,
                    frame = read_frame(&mut read_half) => match frame {
                        Ok(Some(data)) => {
                            if in_tx.send(data).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            trace!(peer = %reader_peer, "remote closed stream");
                            break;
                        }
                        Err(e) => {
                            debug!(peer = %reader_peer, error = %e, "connection read failed");
                            break;
                        }
                    }
                }
            }
            // Dropping in_tx here is what tells fan-in the transport is gone.
        });

        Arc::new(Self {
            peer,
            remote_addr,
            outgoing: out_tx,
            incoming: Mutex::new(Some(in_rx)),
            closed: closed_tx,
        })
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Queue one frame for writing. Blocks when the write channel is full;
    /// that backpressure is the flow control for a slow peer.
    pub async fn send_frame(&self, data: Vec<u8>) -> Result<()> {
        if *self.closed.borrow() {
            return Err(anyhow!("connection to {} is closed", self.peer.id()));
        }
        self.outgoing
            .send(data)
            .await
            .map_err(|_| anyhow!("connection to {} is closed", self.peer.id()))
    }

    /// Signal shutdown to both socket tasks. Safe to call more than once.
    pub fn close(&self) {
        let _ = self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// The frame receiver, handed to exactly one fan-in task.
    fn take_incoming(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.incoming.lock().expect("incoming lock poisoned").take()
    }
}

// ============================================================================
// Swarm
// ============================================================================

/// A message crossing the swarm boundary: destination peer on the way out,
/// source peer on the way in.
pub struct Message {
    pub peer: Arc<Peer>,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(peer: Arc<Peer>, data: Vec<u8>) -> Self {
        Self { peer, data }
    }
}

/// Non-fatal swarm failures, delivered on the errors channel.
#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("no open connection to peer {0}")]
    NoConnection(PeerId),

    #[error("connection to peer {0}: {1}")]
    Connection(PeerId, String),

    #[error("handshake with {0} failed: {1}")]
    Handshake(String, String),
}

/// Consumer ends of the swarm's inbox and error stream, handed out once at
/// construction.
pub struct SwarmChannels {
    pub incoming: mpsc::Receiver<Message>,
    pub errors: mpsc::Receiver<SwarmError>,
}

/// Connection multiplexer: a map of live connections plus the channel
/// plumbing that lets the router treat them as one stream.
pub struct Swarm {
    local: Arc<Peer>,
    conns: RwLock<HashMap<PeerId, Arc<Conn>>>,
    outgoing_tx: mpsc::Sender<Message>,
    incoming_tx: mpsc::Sender<Message>,
    errors_tx: mpsc::Sender<SwarmError>,
    shutdown: watch::Sender<bool>,
    channel_buffer: usize,
    handshake_timeout: Duration,
}

impl Swarm {
    /// Build a swarm for the local peer and start the fan-out task. The
    /// returned channels are the single consumer ends for inbound messages
    /// and errors.
    pub fn new(
        local: Arc<Peer>,
        channel_buffer: usize,
        handshake_timeout: Duration,
    ) -> (Arc<Self>, SwarmChannels) {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(channel_buffer);
        let (incoming_tx, incoming_rx) = mpsc::channel(channel_buffer);
        let (errors_tx, errors_rx) = mpsc::channel(channel_buffer);
        let (shutdown, _) = watch::channel(false);

        let swarm = Arc::new(Self {
            local,
            conns: RwLock::new(HashMap::new()),
            outgoing_tx,
            incoming_tx,
            errors_tx,
            shutdown,
            channel_buffer,
            handshake_timeout,
        });

        tokio::spawn(fan_out(swarm.clone(), outgoing_rx));

        (
            swarm,
            SwarmChannels {
                incoming: incoming_rx,
                errors: errors_rx,
            },
        )
    }

    pub fn local(&self) -> &Arc<Peer> {
        &self.local
    }

    /// Sender half of the outbox, for the router to enqueue messages on.
    pub fn outgoing(&self) -> mpsc::Sender<Message> {
        self.outgoing_tx.clone()
    }

    /// Start accepting on every local address. Accept loops run until
    /// shutdown; individual accept or handshake failures are logged and
    /// surfaced, never fatal.
    pub async fn listen(self: &Arc<Self>) -> Result<()> {
        for addr in self.local.addresses() {
            let (_, host) = dial_args(addr)?;
            let listener = TcpListener::bind(&host)
                .await
                .with_context(|| format!("failed to listen on {}", host))?;
            info!(addr = %addr, "swarm listening");

            let swarm = self.clone();
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, remote)) => {
                                let swarm = swarm.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = swarm.handle_inbound(stream, remote).await {
                                        warn!(remote = %remote, error = %e, "inbound connection rejected");
                                        let _ = swarm
                                            .errors_tx
                                            .send(SwarmError::Handshake(remote.to_string(), e.to_string()))
                                            .await;
                                    }
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "accept failed");
                            }
                        }
                    }
                }
            });
        }
        Ok(())
    }

    async fn handle_inbound(self: &Arc<Self>, mut stream: TcpStream, remote: SocketAddr) -> Result<()> {
        let hello = identify::inbound(&self.local, &mut stream, self.handshake_timeout).await?;
        let addresses = parse_addrs(&hello.listen_addrs);
        let peer = Arc::new(Peer::new(hello.id, addresses));
        debug!(peer = %peer.id(), remote = %remote, "inbound connection");
        self.register(Conn::spawn(peer, stream, self.channel_buffer));
        Ok(())
    }

    /// Connection to a peer we already know, reusing an open one if present.
    pub async fn dial(self: &Arc<Self>, peer: &Arc<Peer>) -> Result<Arc<Conn>> {
        if let Some(conn) = self.conn_for(peer.id()) {
            return Ok(conn);
        }
        let addr = peer
            .net_address("tcp")
            .ok_or_else(|| anyhow!("no tcp address for peer {}", peer.id()))?
            .clone();
        self.dial_addr(&addr).await
    }

    /// Dial an address whose peer we may not know yet. The handshake tells
    /// us who answered; the returned connection carries the authoritative
    /// peer record.
    pub async fn dial_addr(self: &Arc<Self>, addr: &Multiaddr) -> Result<Arc<Conn>> {
        let (_, host) = dial_args(addr)?;
        let mut stream = TcpStream::connect(&host)
            .await
            .with_context(|| format!("failed to dial {}", host))?;
        let hello = identify::outbound(&self.local, &mut stream, self.handshake_timeout)
            .await
            .with_context(|| format!("handshake with {} failed", host))?;

        // The handshake may reveal a peer we were already connected to. The
        // remote has accepted this stream as our live connection, so the new
        // one wins; registration closes the one it replaces.
        let mut addresses = vec![addr.clone()];
        for parsed in parse_addrs(&hello.listen_addrs) {
            if parsed != *addr {
                addresses.push(parsed);
            }
        }
        let peer = Arc::new(Peer::new(hello.id, addresses));
        debug!(peer = %peer.id(), addr = %addr, "outbound connection");
        let conn = Conn::spawn(peer, stream, self.channel_buffer);
        self.register(conn.clone());
        Ok(conn)
    }

    /// Enqueue a message for fan-out.
    pub async fn send(&self, msg: Message) -> Result<()> {
        self.outgoing_tx
            .send(msg)
            .await
            .map_err(|_| anyhow!("swarm is shut down"))
    }

    /// The peer record behind an open connection, if any.
    pub fn find(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.conn_for(id).map(|conn| conn.peer().clone())
    }

    pub fn connection_count(&self) -> usize {
        self.conns.read().expect("conns lock poisoned").len()
    }

    /// Close and forget the connection to a peer.
    pub fn drop_peer(&self, id: &PeerId) {
        let conn = {
            let mut conns = self.conns.write().expect("conns lock poisoned");
            conns.remove(id)
        };
        if let Some(conn) = conn {
            conn.close();
        }
    }

    /// Broadcast shutdown to fan-out and every fan-in task.
    pub fn close(&self) {
        let _ = self.shutdown.send_replace(true);
    }

    fn conn_for(&self, id: &PeerId) -> Option<Arc<Conn>> {
        let conns = self.conns.read().expect("conns lock poisoned");
        conns.get(id).filter(|c| !c.is_closed()).cloned()
    }

    fn register(self: &Arc<Self>, conn: Arc<Conn>) {
        let replaced = {
            let mut conns = self.conns.write().expect("conns lock poisoned");
            conns.insert(conn.peer().id().clone(), conn.clone())
        };
        if let Some(old) = replaced {
            old.close();
        }
        tokio::spawn(fan_in(self.clone(), conn));
    }
}

fn parse_addrs(addrs: &[String]) -> Vec<Multiaddr> {
    addrs.iter().filter_map(|a| a.parse().ok()).collect()
}

/// Drain the outbox, routing each message to its connection. A missing
/// connection is an error-channel event, not a stop condition.
async fn fan_out(swarm: Arc<Swarm>, mut outgoing: mpsc::Receiver<Message>) {
    let mut shutdown = swarm.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            msg = outgoing.recv() => match msg {
                Some(msg) => {
                    let conn = swarm.conn_for(msg.peer.id());
                    match conn {
                        Some(conn) => {
                            trace!(peer = %msg.peer.id(), bytes = msg.data.len(), "fan-out");
                            if let Err(e) = conn.send_frame(msg.data).await {
                                let _ = swarm
                                    .errors_tx
                                    .send(SwarmError::Connection(msg.peer.id().clone(), e.to_string()))
                                    .await;
                            }
                        }
                        None => {
                            let _ = swarm
                                .errors_tx
                                .send(SwarmError::NoConnection(msg.peer.id().clone()))
                                .await;
                        }
                    }
                }
                None => break,
            }
        }
    }
    debug!("fan-out task exiting");
}

/// Forward one connection's frames into the shared inbox until the
/// connection dies or the swarm shuts down, then deregister it.
async fn fan_in(swarm: Arc<Swarm>, conn: Arc<Conn>) {
    let peer = conn.peer().clone();
    let mut shutdown = swarm.shutdown.subscribe();
    let mut closed = conn.closed_signal();
    let Some(mut incoming) = conn.take_incoming() else {
        // Another fan-in already owns this connection.
        return;
    };

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                conn.close();
                break;
            }
            _ = closed.changed() => break,
            frame = incoming.recv() => match frame {
                Some(data) => {
                    let msg = Message::new(peer.clone(), data);
                    if swarm.incoming_tx.send(msg).await.is_err() {
                        conn.close();
                        break;
                    }
                }
                None => {
                    let _ = swarm
                        .errors_tx
                        .send(SwarmError::Connection(
                            peer.id().clone(),
                            "transport closed".to_string(),
                        ))
                        .await;
                    conn.close();
                    break;
                }
            }
        }
    }

    let mut conns = swarm.conns.write().expect("conns lock poisoned");
    if let Some(current) = conns.get(peer.id()) {
        if Arc::ptr_eq(current, &conn) {
            conns.remove(peer.id());
        }
    }
    drop(conns);
    debug!(peer = %peer.id(), "connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU16, Ordering};

    static PORT_COUNTER: AtomicU16 = AtomicU16::new(42000);

    fn next_port() -> u16 {
        PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
    }

    fn make_local(name: &[u8], port: u16) -> Arc<Peer> {
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/{}", port)
            .parse()
            .expect("valid multiaddr");
        Arc::new(Peer::new(PeerId::from_bytes(name.to_vec()), vec![addr]))
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_frame(&mut a, b"first").await.unwrap();
        write_frame(&mut a, b"second").await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"second");
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut a, _b) = tokio::io::duplex(64);
        let too_big = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(write_frame(&mut a, &too_big).await.is_err());
    }

    #[tokio::test]
    async fn dial_and_exchange() {
        let port_a = next_port();
        let port_b = next_port();
        let (swarm_a, mut chans_a) =
            Swarm::new(make_local(b"swarm_a", port_a), 10, Duration::from_secs(2));
        let (swarm_b, mut chans_b) =
            Swarm::new(make_local(b"swarm_b", port_b), 10, Duration::from_secs(2));
        swarm_a.listen().await.unwrap();
        swarm_b.listen().await.unwrap();

        let conn = swarm_a.dial(swarm_b.local()).await.unwrap();
        assert_eq!(conn.peer().id(), swarm_b.local().id());

        swarm_a
            .send(Message::new(conn.peer().clone(), b"hello b".to_vec()))
            .await
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), chans_b.incoming.recv())
            .await
            .expect("timed out")
            .expect("channel open");
        assert_eq!(msg.data, b"hello b");
        assert_eq!(msg.peer.id(), swarm_a.local().id());

        // And back, over the inbound-registered connection.
        swarm_b
            .send(Message::new(msg.peer.clone(), b"hello a".to_vec()))
            .await
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), chans_a.incoming.recv())
            .await
            .expect("timed out")
            .expect("channel open");
        assert_eq!(reply.data, b"hello a");

        swarm_a.close();
        swarm_b.close();
    }

    #[tokio::test]
    async fn send_to_unknown_peer_surfaces_error() {
        let port = next_port();
        let (swarm, mut chans) =
            Swarm::new(make_local(b"lonely", port), 10, Duration::from_secs(2));

        let stranger = Arc::new(Peer::new(PeerId::from_bytes(b"stranger".to_vec()), vec![]));
        swarm
            .send(Message::new(stranger.clone(), b"anyone there".to_vec()))
            .await
            .unwrap();

        let err = tokio::time::timeout(Duration::from_secs(2), chans.errors.recv())
            .await
            .expect("timed out")
            .expect("channel open");
        assert!(matches!(err, SwarmError::NoConnection(id) if id == *stranger.id()));
    }

    #[tokio::test]
    async fn dial_reuses_open_connection() {
        let port_a = next_port();
        let port_b = next_port();
        let (swarm_a, _chans_a) =
            Swarm::new(make_local(b"reuse_a", port_a), 10, Duration::from_secs(2));
        let (swarm_b, _chans_b) =
            Swarm::new(make_local(b"reuse_b", port_b), 10, Duration::from_secs(2));
        swarm_b.listen().await.unwrap();

        let first = swarm_a.dial(swarm_b.local()).await.unwrap();
        let second = swarm_a.dial(swarm_b.local()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(swarm_a.connection_count(), 1);
    }

    #[tokio::test]
    async fn drop_peer_closes_connection() {
        let port_a = next_port();
        let port_b = next_port();
        let (swarm_a, _chans_a) =
            Swarm::new(make_local(b"drop_a", port_a), 10, Duration::from_secs(2));
        let (swarm_b, _chans_b) =
            Swarm::new(make_local(b"drop_b", port_b), 10, Duration::from_secs(2));
        swarm_b.listen().await.unwrap();

        let conn = swarm_a.dial(swarm_b.local()).await.unwrap();
        swarm_a.drop_peer(swarm_b.local().id());
        assert!(conn.is_closed());
        assert!(swarm_a.find(swarm_b.local().id()).is_none());
        assert!(conn.send_frame(b"too late".to_vec()).await.is_err());
    }
}
