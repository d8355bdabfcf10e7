//! # DHT Message Router and Operations
//!
//! The router ties the other layers together: it reads envelopes off the
//! swarm inbox, keeps the routing table warm with every sender it hears
//! from, correlates responses with waiting callers by message id, and
//! dispatches requests to the per-kind handlers.
//!
//! ## Structure
//!
//! - [`Dht`]: the public handle; operations are methods, state is shared
//!   behind per-index reader/writer locks
//! - one **message loop** task selecting over swarm inbox, swarm errors,
//!   shutdown, and the sweep tick
//! - a **sweeper** pass every five minutes reaping expired provider
//!   entries and dead listeners
//!
//! ## Correlation
//!
//! Every outbound request registers a listener: a reply channel, an
//! expected reply count, and a deadline. Responses are routed to their
//! listener and the listener is dropped after the last expected reply.
//! A response with no live listener is logged, counted on the event
//! stream, and dropped; that is the normal fate of a reply that lost its
//! race against a timeout.
//!
//! ## Failure policy
//!
//! The loop never aborts on a recoverable condition. Parse failures,
//! unknown-peer sends, datastore errors in handlers and unsolicited
//! replies all become log lines and [`RouterEvent`]s. Caller-facing
//! operations return [`DhtError`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use multiaddr::Multiaddr;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::DhtConfig;
use crate::datastore::{Datastore, DatastoreError, MapDatastore};
use crate::error::DhtError;
use crate::id::NodeId;
use crate::messages::{marshal, unmarshal, DiagInfo, Envelope, MessageKind, PeerInfo};
use crate::peer::{Peer, PeerId};
use crate::routing::RoutingTable;
use crate::swarm::{Message, Swarm, SwarmChannels, SwarmError};

/// Timeout for the registration ping sent to a freshly connected peer.
const CONNECT_PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Buffer of the router event stream. Events are observability, not
/// control flow; when nobody drains them they are dropped.
const EVENT_BUFFER: usize = 64;

/// A caller waiting for replies to one message id.
struct Listener {
    tx: mpsc::UnboundedSender<Envelope>,
    remaining: usize,
    deadline: Instant,
}

/// One peer's claim to hold the value for a content key.
struct ProviderEntry {
    peer: Arc<Peer>,
    inserted: Instant,
}

/// Observable router incidents: everything the loop swallows instead of
/// failing on. Drained via [`Dht::events`], mainly by tests.
#[derive(Debug)]
pub enum RouterEvent {
    /// A transport-level error surfaced by the swarm.
    Swarm(SwarmError),
    /// A response arrived with no live listener (late, or id collision).
    DroppedReply { id: u64, from: PeerId },
    /// An inbound frame that did not decode as an envelope.
    ParseError { from: PeerId },
    /// A handler hit a local failure (datastore write, encode).
    HandlerError { from: PeerId, note: String },
}

/// Kademlia DHT node: routing tables, provider index, reply correlation
/// and the seven wire operations.
pub struct Dht {
    self_peer: Arc<Peer>,
    swarm: Arc<Swarm>,
    datastore: Arc<dyn Datastore>,
    /// Routing tables by level. Only level 0 is populated today; the
    /// lookup loop walks levels so more can be added without touching it.
    routes: Vec<RoutingTable>,
    listeners: RwLock<HashMap<u64, Listener>>,
    providers: RwLock<HashMap<Vec<u8>, Vec<ProviderEntry>>>,
    events_tx: mpsc::Sender<RouterEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<RouterEvent>>>,
    pending_channels: Mutex<Option<SwarmChannels>>,
    shutdown: watch::Sender<bool>,
    birth: Instant,
    stored_keys: AtomicUsize,
    config: DhtConfig,
}

impl Dht {
    /// Create a node for the given local peer with an in-memory datastore,
    /// bind its listeners, and return the handle. Call [`Dht::start`] to
    /// run the message loop.
    pub async fn new(self_peer: Arc<Peer>, config: DhtConfig) -> Result<Arc<Self>, DhtError> {
        Self::with_datastore(self_peer, Arc::new(MapDatastore::new()), config).await
    }

    /// Same as [`Dht::new`] with a caller-provided datastore.
    pub async fn with_datastore(
        self_peer: Arc<Peer>,
        datastore: Arc<dyn Datastore>,
        config: DhtConfig,
    ) -> Result<Arc<Self>, DhtError> {
        let (swarm, channels) =
            Swarm::new(self_peer.clone(), config.channel_buffer, config.handshake_timeout);
        swarm
            .listen()
            .await
            .map_err(|e| DhtError::wrap(e, "failed to start listeners"))?;

        let local_node_id = NodeId::from_peer(self_peer.id());
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (shutdown, _) = watch::channel(false);

        info!(peer = %self_peer.id(), "dht node up");

        Ok(Arc::new(Self {
            self_peer,
            swarm,
            datastore,
            routes: vec![RoutingTable::new(config.bucket_size, local_node_id)],
            listeners: RwLock::new(HashMap::new()),
            providers: RwLock::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            pending_channels: Mutex::new(Some(channels)),
            shutdown,
            birth: Instant::now(),
            stored_keys: AtomicUsize::new(0),
            config,
        }))
    }

    /// Spawn the message loop. Idempotent; the second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        let channels = self
            .pending_channels
            .lock()
            .expect("channels lock poisoned")
            .take();
        if let Some(channels) = channels {
            tokio::spawn(self.clone().handle_messages(channels));
        }
    }

    /// Stop the message loop and shut the swarm down.
    pub fn halt(&self) {
        let _ = self.shutdown.send_replace(true);
        self.swarm.close();
    }

    pub fn self_peer(&self) -> &Arc<Peer> {
        &self.self_peer
    }

    /// Size of the primary routing table.
    pub fn table_size(&self) -> usize {
        self.routes[0].size()
    }

    /// Peers currently recorded as providers for a key, expired entries
    /// excluded.
    pub fn providers_for(&self, key: &[u8]) -> Vec<Arc<Peer>> {
        let providers = self.providers.read().expect("providers lock poisoned");
        let now = Instant::now();
        providers
            .get(key)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| now.duration_since(e.inserted) < self.config.provider_ttl)
                    .map(|e| e.peer.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The router event stream. Single consumer; `None` once taken.
    pub fn events(&self) -> Option<mpsc::Receiver<RouterEvent>> {
        self.events_rx.lock().expect("events lock poisoned").take()
    }

    // ========================================================================
    // Listener registry
    // ========================================================================

    /// Register a reply channel for a message id, expecting `count` replies
    /// before `timeout` elapses.
    pub fn listen_for(
        &self,
        id: u64,
        count: usize,
        timeout: Duration,
    ) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.listeners.write().expect("listeners lock poisoned");
        listeners.insert(
            id,
            Listener {
                tx,
                remaining: count,
                deadline: Instant::now() + timeout,
            },
        );
        rx
    }

    /// Drop the listener for a message id, closing its reply channel.
    pub fn unlisten(&self, id: u64) {
        let mut listeners = self.listeners.write().expect("listeners lock poisoned");
        listeners.remove(&id);
    }

    /// Whether a live, unexpired listener exists for this id. An expired
    /// entry is removed on the way out.
    pub fn is_listening(&self, id: u64) -> bool {
        {
            let listeners = self.listeners.read().expect("listeners lock poisoned");
            match listeners.get(&id) {
                None => return false,
                Some(l) if Instant::now() <= l.deadline => return true,
                Some(_) => {}
            }
        }
        self.unlisten(id);
        false
    }

    /// Pull the reply sink for a response, accounting for the expected
    /// count. Returns `None` for unknown ids and for listeners past their
    /// deadline (which are removed lazily here).
    fn take_reply_sink(&self, id: u64) -> Option<mpsc::UnboundedSender<Envelope>> {
        let mut listeners = self.listeners.write().expect("listeners lock poisoned");
        match listeners.get_mut(&id) {
            None => None,
            Some(l) if Instant::now() > l.deadline => {
                listeners.remove(&id);
                None
            }
            Some(l) => {
                let tx = l.tx.clone();
                l.remaining = l.remaining.saturating_sub(1);
                if l.remaining == 0 {
                    listeners.remove(&id);
                }
                Some(tx)
            }
        }
    }

    // ========================================================================
    // Message loop
    // ========================================================================

    async fn handle_messages(self: Arc<Self>, mut channels: SwarmChannels) {
        debug!("message loop running");
        let mut shutdown = self.shutdown.subscribe();
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.tick().await; // immediate first tick carries no work

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sweep.tick() => self.sweep(),
                err = channels.errors.recv() => match err {
                    Some(e) => {
                        warn!(error = %e, "swarm error");
                        self.emit(RouterEvent::Swarm(e));
                    }
                    None => break,
                },
                msg = channels.incoming.recv() => match msg {
                    Some(msg) => self.dispatch(msg).await,
                    None => break,
                },
            }
        }
        debug!("message loop exiting");
    }

    async fn dispatch(self: &Arc<Self>, msg: Message) {
        let envelope: Envelope = match unmarshal(&msg.data) {
            Ok(env) => env,
            Err(e) => {
                warn!(peer = %msg.peer.id(), error = %e, "dropping undecodable frame");
                self.emit(RouterEvent::ParseError {
                    from: msg.peer.id().clone(),
                });
                return;
            }
        };

        // Whatever the direction, hearing from a peer refreshes it.
        self.update_route(msg.peer.clone());

        if envelope.response {
            self.deliver_reply(&msg.peer, envelope);
            return;
        }

        trace!(
            peer = %msg.peer.id(),
            kind = ?envelope.kind,
            id = envelope.id,
            "request"
        );
        match envelope.kind {
            MessageKind::Ping => self.handle_ping(&msg.peer, &envelope).await,
            MessageKind::GetValue => self.handle_get_value(&msg.peer, &envelope).await,
            MessageKind::PutValue => self.handle_put_value(&msg.peer, &envelope),
            MessageKind::FindNode => self.handle_find_node(&msg.peer, &envelope).await,
            MessageKind::AddProvider => self.handle_add_provider(&msg.peer, &envelope),
            MessageKind::GetProviders => self.handle_get_providers(&msg.peer, &envelope).await,
            MessageKind::Diagnostic => {
                // Gathers replies for up to the local deadline; runs apart
                // from the loop so other traffic keeps flowing.
                let dht = self.clone();
                let peer = msg.peer.clone();
                tokio::spawn(async move { dht.handle_diagnostic(&peer, &envelope).await });
            }
        }
    }

    fn deliver_reply(&self, from: &Arc<Peer>, envelope: Envelope) {
        let id = envelope.id;
        match self.take_reply_sink(id) {
            Some(tx) => {
                // Receiver may have been dropped by a caller that already
                // returned; that is the same late-reply case.
                if tx.send(envelope).is_err() {
                    debug!(id, from = %from.id(), "listener gone, reply dropped");
                    self.emit(RouterEvent::DroppedReply {
                        id,
                        from: from.id().clone(),
                    });
                }
            }
            None => {
                debug!(id, from = %from.id(), "unsolicited response dropped");
                self.emit(RouterEvent::DroppedReply {
                    id,
                    from: from.id().clone(),
                });
            }
        }
    }

    /// Reap expired provider entries and dead listeners.
    fn sweep(&self) {
        let now = Instant::now();
        let ttl = self.config.provider_ttl;
        {
            let mut providers = self.providers.write().expect("providers lock poisoned");
            providers.retain(|key, entries| {
                entries.retain(|e| now.duration_since(e.inserted) < ttl);
                if entries.is_empty() {
                    trace!(key = %hex_key(key), "provider list emptied");
                }
                !entries.is_empty()
            });
        }
        {
            let mut listeners = self.listeners.write().expect("listeners lock poisoned");
            listeners.retain(|_, l| now <= l.deadline);
        }
    }

    // ========================================================================
    // Request handlers
    // ========================================================================

    async fn handle_ping(&self, from: &Arc<Peer>, request: &Envelope) {
        let reply = Envelope::reply_to(request);
        self.send_or_report(from, &reply).await;
    }

    async fn handle_get_value(&self, from: &Arc<Peer>, request: &Envelope) {
        let mut reply = Envelope::reply_to(request).with_key(request.key.clone());
        match self.datastore.get(&request.key) {
            Ok(value) => {
                reply.success = true;
                reply.value = value;
            }
            Err(DatastoreError::NotFound) => {
                let target = NodeId::from_key(&request.key);
                reply.peers = self.peer_infos(
                    self.routes[0].nearest_peers(&target, self.config.bucket_size),
                );
            }
            Err(e) => {
                warn!(key = %hex_key(&request.key), error = %e, "datastore read failed");
                self.emit(RouterEvent::HandlerError {
                    from: from.id().clone(),
                    note: format!("datastore read: {}", e),
                });
                return;
            }
        }
        self.send_or_report(from, &reply).await;
    }

    /// PUT_VALUE takes no reply; a failed write is an event, never fatal.
    fn handle_put_value(&self, from: &Arc<Peer>, request: &Envelope) {
        let fresh = matches!(
            self.datastore.get(&request.key),
            Err(DatastoreError::NotFound)
        );
        match self.datastore.put(&request.key, request.value.clone()) {
            Ok(()) => {
                if fresh {
                    self.stored_keys.fetch_add(1, Ordering::Relaxed);
                }
                debug!(
                    key = %hex_key(&request.key),
                    bytes = request.value.len(),
                    from = %from.id(),
                    "stored value"
                );
            }
            Err(e) => {
                warn!(key = %hex_key(&request.key), error = %e, "datastore write failed");
                self.emit(RouterEvent::HandlerError {
                    from: from.id().clone(),
                    note: format!("datastore write: {}", e),
                });
            }
        }
    }

    /// One handler for peer search: nearest peers to the requested id, with
    /// `success` flagging an exact match among them.
    async fn handle_find_node(&self, from: &Arc<Peer>, request: &Envelope) {
        let wanted = PeerId::from_bytes(request.key.clone());
        let target = NodeId::from_peer(&wanted);
        let nearest = self.routes[0].nearest_peers(&target, self.config.bucket_size);

        let mut reply = Envelope::reply_to(request).with_key(request.key.clone());
        reply.success = nearest.iter().any(|p| *p.id() == wanted);
        reply.peers = self.peer_infos(nearest);
        self.send_or_report(from, &reply).await;
    }

    fn handle_add_provider(&self, from: &Arc<Peer>, request: &Envelope) {
        debug!(
            key = %hex_key(&request.key),
            provider = %from.id(),
            "adding provider"
        );
        self.add_provider_entry(&request.key, from.clone());
    }

    async fn handle_get_providers(&self, from: &Arc<Peer>, request: &Envelope) {
        let providers = self.providers_for(&request.key);
        let mut reply = Envelope::reply_to(request).with_key(request.key.clone());
        reply.success = !providers.is_empty();
        reply.peers = self.peer_infos(providers);
        self.send_or_report(from, &reply).await;
    }

    /// Gossip step: forward the same message id to our nearest peers,
    /// fold their answers into our own diagnostic record, and answer the
    /// originator with the lot.
    async fn handle_diagnostic(self: &Arc<Self>, from: &Arc<Peer>, request: &Envelope) {
        // A DIAGNOSTIC whose id we are already listening on is our own
        // sweep coming back around a cycle; drop it.
        if self.is_listening(request.id) {
            trace!(id = request.id, "diagnostic cycle suppressed");
            return;
        }

        let self_id = NodeId::from_peer(self.self_peer.id());
        let targets = self.routes[0].nearest_peers(&self_id, self.config.diag_fanout);

        let mut infos = vec![self.diag_info()];

        if !targets.is_empty() {
            let mut replies = self.listen_for(
                request.id,
                targets.len(),
                self.config.diag_listener_deadline,
            );
            let forward = Envelope {
                response: false,
                success: false,
                key: Vec::new(),
                value: Vec::new(),
                peers: Vec::new(),
                kind: MessageKind::Diagnostic,
                id: request.id,
            };
            for target in &targets {
                self.send_or_report(target, &forward).await;
            }

            let local_deadline = tokio::time::sleep(self.config.diag_local_deadline);
            tokio::pin!(local_deadline);
            let mut outstanding = targets.len();
            while outstanding > 0 {
                tokio::select! {
                    _ = &mut local_deadline => {
                        debug!(id = request.id, outstanding, "diagnostic local deadline hit");
                        break;
                    }
                    reply = replies.recv() => match reply {
                        Some(reply) => {
                            match unmarshal::<Vec<DiagInfo>>(&reply.value) {
                                Ok(list) => infos.extend(list),
                                Err(e) => {
                                    debug!(id = request.id, error = %e, "bad diagnostic payload, skipping");
                                }
                            }
                            outstanding -= 1;
                        }
                        None => break,
                    }
                }
            }
            self.unlisten(request.id);
        }

        let mut reply = Envelope::reply_to(request);
        reply.success = true;
        match marshal(&infos) {
            Ok(bytes) => reply.value = bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode diagnostic payload");
                self.emit(RouterEvent::HandlerError {
                    from: from.id().clone(),
                    note: format!("diagnostic encode: {}", e),
                });
                return;
            }
        }
        self.send_or_report(from, &reply).await;
    }

    fn diag_info(&self) -> DiagInfo {
        DiagInfo {
            id: self.self_peer.id().clone(),
            addresses: self
                .self_peer
                .addresses()
                .iter()
                .map(|a| a.to_string())
                .collect(),
            table_size: self.routes[0].size(),
            uptime_secs: self.birth.elapsed().as_secs(),
            keys_stored: self.stored_keys.load(Ordering::Relaxed),
        }
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    /// Dial an address, handshake, register the peer, and ping it so both
    /// sides learn each other's routing tables.
    pub async fn connect(self: &Arc<Self>, addr: &Multiaddr) -> Result<Arc<Peer>, DhtError> {
        debug!(addr = %addr, "connecting");
        let conn = self
            .swarm
            .dial_addr(addr)
            .await
            .map_err(|e| DhtError::wrap(e, "connect failed"))?;
        let peer = conn.peer().clone();
        self.update_route(peer.clone());
        self.ping(&peer, CONNECT_PING_TIMEOUT).await?;
        Ok(peer)
    }

    /// Store a value with the peer nearest to the key. Fire-and-forget;
    /// delivery problems surface on the error stream, not here.
    pub async fn put_value(self: &Arc<Self>, key: &[u8], value: &[u8]) -> Result<(), DhtError> {
        let target = NodeId::from_key(key);
        let peer = self.routes[0]
            .nearest_peer(&target)
            .ok_or(DhtError::LookupFailure)?;

        let request = Envelope::request(MessageKind::PutValue)
            .with_key(key)
            .with_value(value.to_vec());
        debug!(key = %hex_key(key), peer = %peer.id(), "put value");
        self.send_envelope(&peer, &request).await
    }

    /// Fetch a value by walking toward it: ask the nearest known peer, and
    /// on a miss follow the closer peer it points at. Each routing level is
    /// exhausted when a miss brings no closer peers.
    pub async fn get_value(
        self: &Arc<Self>,
        key: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, DhtError> {
        let target = NodeId::from_key(key);
        let mut route_level = 0;
        let mut peer = self.routes[route_level]
            .nearest_peer(&target)
            .ok_or(DhtError::LookupFailure)?;

        loop {
            let request = Envelope::request(MessageKind::GetValue).with_key(key);
            let mut replies = self.listen_for(request.id, 1, timeout);
            self.send_envelope(&peer, &request).await?;

            let reply = match tokio::time::timeout(timeout, replies.recv()).await {
                Err(_) => {
                    self.unlisten(request.id);
                    return Err(DhtError::Timeout);
                }
                Ok(None) => return Err(DhtError::Timeout),
                Ok(Some(reply)) => reply,
            };

            if reply.success {
                trace!(key = %hex_key(key), peer = %peer.id(), "value found");
                return Ok(reply.value);
            }

            // A miss names closer peers. Ignore pointers back at ourselves
            // or at the peer we just asked; they cannot make progress.
            let closer = reply
                .peers
                .iter()
                .find(|info| info.id != *self.self_peer.id() && info.id != *peer.id());

            match closer {
                Some(info) => {
                    let next = self.resolve_peer_info(info).await?;
                    self.update_route(next.clone());
                    trace!(key = %hex_key(key), next = %next.id(), "following closer peer");
                    peer = next;
                }
                None => {
                    route_level += 1;
                    if route_level >= self.routes.len() {
                        return Err(DhtError::NotFound);
                    }
                    peer = self.routes[route_level]
                        .nearest_peer(&target)
                        .ok_or(DhtError::LookupFailure)?;
                }
            }
        }
    }

    /// Announce this node as a provider for a key to the nearest pool.
    pub async fn provide(self: &Arc<Self>, key: &[u8]) -> Result<(), DhtError> {
        let target = NodeId::from_key(key);
        let peers = self.routes[0].nearest_peers(&target, self.config.pool_size);
        if peers.is_empty() {
            return Err(DhtError::LookupFailure);
        }

        let request = Envelope::request(MessageKind::AddProvider).with_key(key);
        debug!(key = %hex_key(key), fanout = peers.len(), "announcing provider");
        for peer in &peers {
            self.send_envelope(peer, &request).await?;
        }
        Ok(())
    }

    /// Ask the peer nearest to a key who provides it, and bring every
    /// returned provider into the local index. An unreachable provider is
    /// skipped, not an error.
    pub async fn find_providers(
        self: &Arc<Self>,
        key: &[u8],
        timeout: Duration,
    ) -> Result<Vec<Arc<Peer>>, DhtError> {
        let target = NodeId::from_key(key);
        let peer = self.routes[0]
            .nearest_peer(&target)
            .ok_or(DhtError::LookupFailure)?;

        let request = Envelope::request(MessageKind::GetProviders).with_key(key);
        let mut replies = self.listen_for(request.id, 1, timeout);
        self.send_envelope(&peer, &request).await?;

        let reply = match tokio::time::timeout(timeout, replies.recv()).await {
            Err(_) => {
                self.unlisten(request.id);
                return Err(DhtError::Timeout);
            }
            Ok(None) => return Err(DhtError::Timeout),
            Ok(Some(reply)) => reply,
        };

        let mut found = Vec::new();
        for info in &reply.peers {
            let provider = match self.resolve_peer_info(info).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(provider = %info.id, error = %e, "provider unreachable, skipping");
                    continue;
                }
            };
            self.add_provider_entry(key, provider.clone());
            found.push(provider);
        }
        Ok(found)
    }

    /// Search for a peer by id. A single round against the nearest known
    /// peer: an exact match connects and returns; a merely-near answer
    /// still connects but reports [`DhtError::SearchIncomplete`].
    pub async fn find_peer(
        self: &Arc<Self>,
        id: &PeerId,
        timeout: Duration,
    ) -> Result<Arc<Peer>, DhtError> {
        let target = NodeId::from_peer(id);
        let peer = self.routes[0]
            .nearest_peer(&target)
            .ok_or(DhtError::LookupFailure)?;

        let request = Envelope::request(MessageKind::FindNode).with_key(id.as_bytes());
        let mut replies = self.listen_for(request.id, 1, timeout);
        self.send_envelope(&peer, &request).await?;

        let reply = match tokio::time::timeout(timeout, replies.recv()).await {
            Err(_) => {
                self.unlisten(request.id);
                return Err(DhtError::Timeout);
            }
            Ok(None) => return Err(DhtError::Timeout),
            Ok(Some(reply)) => reply,
        };

        if let Some(exact) = reply.peers.iter().find(|info| info.id == *id) {
            let found = self.resolve_peer_info(exact).await?;
            self.update_route(found.clone());
            return Ok(found);
        }

        let near = reply
            .peers
            .iter()
            .find(|info| info.id != *self.self_peer.id());
        match near {
            Some(info) => {
                let found = self.resolve_peer_info(info).await?;
                debug!(
                    wanted = %id,
                    found = %found.id(),
                    "peer search found a neighbour, not the target"
                );
                self.update_route(found);
                Err(DhtError::SearchIncomplete)
            }
            None => Err(DhtError::NotFound),
        }
    }

    /// Round-trip a PING and record the measured latency on the peer.
    pub async fn ping(self: &Arc<Self>, peer: &Arc<Peer>, timeout: Duration) -> Result<(), DhtError> {
        let request = Envelope::request(MessageKind::Ping);
        let mut replies = self.listen_for(request.id, 1, timeout);

        let before = Instant::now();
        self.send_envelope(peer, &request).await?;

        match tokio::time::timeout(timeout, replies.recv()).await {
            Err(_) => {
                self.unlisten(request.id);
                Err(DhtError::Timeout)
            }
            Ok(None) => Err(DhtError::Timeout),
            Ok(Some(_)) => {
                let rtt = before.elapsed();
                peer.set_latency(rtt);
                debug!(peer = %peer.id(), rtt_ms = rtt.as_millis() as u64, "ping");
                Ok(())
            }
        }
    }

    /// Run a diagnostic sweep over our neighbourhood and collect whatever
    /// reports make it back before the deadline.
    pub async fn get_diagnostic(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<Vec<DiagInfo>, DhtError> {
        let self_id = NodeId::from_peer(self.self_peer.id());
        let targets = self.routes[0].nearest_peers(&self_id, self.config.diag_fanout);
        if targets.is_empty() {
            return Err(DhtError::LookupFailure);
        }

        let request = Envelope::request(MessageKind::Diagnostic);
        let mut replies = self.listen_for(request.id, targets.len(), timeout);
        for target in &targets {
            self.send_envelope(target, &request).await?;
        }

        let mut infos = Vec::new();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut outstanding = targets.len();
        while outstanding > 0 {
            tokio::select! {
                _ = &mut deadline => {
                    self.unlisten(request.id);
                    if infos.is_empty() {
                        return Err(DhtError::Timeout);
                    }
                    debug!(collected = infos.len(), outstanding, "diagnostic deadline, returning partial");
                    break;
                }
                reply = replies.recv() => match reply {
                    Some(reply) => {
                        match unmarshal::<Vec<DiagInfo>>(&reply.value) {
                            Ok(list) => infos.extend(list),
                            Err(e) => debug!(error = %e, "bad diagnostic payload, skipping"),
                        }
                        outstanding -= 1;
                    }
                    None => break,
                }
            }
        }
        Ok(infos)
    }

    /// Read straight from the local datastore.
    pub fn get_local(&self, key: &[u8]) -> Result<Vec<u8>, DhtError> {
        match self.datastore.get(key) {
            Ok(value) => Ok(value),
            Err(DatastoreError::NotFound) => Err(DhtError::NotFound),
            Err(e) => Err(DhtError::wrap(e, "datastore read failed")),
        }
    }

    /// Write straight to the local datastore.
    pub fn put_local(&self, key: &[u8], value: &[u8]) -> Result<(), DhtError> {
        self.datastore
            .put(key, value.to_vec())
            .map_err(|e| DhtError::wrap(e, "datastore write failed"))
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn update_route(&self, peer: Arc<Peer>) {
        if peer.id() == self.self_peer.id() {
            return;
        }
        if let Some(evicted) = self.routes[0].update(peer) {
            debug!(peer = %evicted.id(), "routing table evicted peer");
        }
    }

    fn add_provider_entry(&self, key: &[u8], peer: Arc<Peer>) {
        let mut providers = self.providers.write().expect("providers lock poisoned");
        let entries = providers.entry(key.to_vec()).or_default();
        match entries.iter_mut().find(|e| e.peer.id() == peer.id()) {
            Some(entry) => entry.inserted = Instant::now(),
            None => entries.push(ProviderEntry {
                peer,
                inserted: Instant::now(),
            }),
        }
    }

    /// Turn a wire peer reference into a live peer record: an open
    /// connection if we have one, a fresh dial otherwise.
    async fn resolve_peer_info(self: &Arc<Self>, info: &PeerInfo) -> Result<Arc<Peer>, DhtError> {
        if info.id == *self.self_peer.id() {
            return Ok(self.self_peer.clone());
        }
        if let Some(peer) = self.swarm.find(&info.id) {
            return Ok(peer);
        }
        let addr: Multiaddr = info
            .addr
            .parse()
            .map_err(|e| DhtError::wrap(e, "bad peer address"))?;
        let conn = self
            .swarm
            .dial_addr(&addr)
            .await
            .map_err(|e| DhtError::wrap(e, "dial failed"))?;
        Ok(conn.peer().clone())
    }

    async fn send_envelope(&self, peer: &Arc<Peer>, envelope: &Envelope) -> Result<(), DhtError> {
        let bytes = marshal(envelope)?;
        self.swarm
            .send(Message::new(peer.clone(), bytes))
            .await
            .map_err(|e| DhtError::wrap(e, "send failed"))
    }

    /// Handler-side send: a failed reply is an event, never an error the
    /// remote learns about.
    async fn send_or_report(&self, peer: &Arc<Peer>, envelope: &Envelope) {
        if let Err(e) = self.send_envelope(peer, envelope).await {
            warn!(peer = %peer.id(), error = %e, "failed to send reply");
            self.emit(RouterEvent::HandlerError {
                from: peer.id().clone(),
                note: e.to_string(),
            });
        }
    }

    fn peer_infos(&self, peers: Vec<Arc<Peer>>) -> Vec<PeerInfo> {
        peers
            .iter()
            .filter_map(|peer| {
                let addr = peer.net_address("tcp")?;
                Some(PeerInfo {
                    id: peer.id().clone(),
                    addr: addr.to_string(),
                })
            })
            .collect()
    }

    fn emit(&self, event: RouterEvent) {
        // Best effort: an unclaimed or full event stream drops events.
        let _ = self.events_tx.try_send(event);
    }

    #[cfg(test)]
    pub(crate) fn sweep_now(&self) {
        self.sweep();
    }

    #[cfg(test)]
    pub(crate) fn insert_provider(&self, key: &[u8], peer: Arc<Peer>) {
        self.add_provider_entry(key, peer);
    }
}

fn hex_key(key: &[u8]) -> String {
    let n = key.len().min(8);
    hex::encode(&key[..n])
}
