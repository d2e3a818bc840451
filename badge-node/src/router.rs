//! Router: the single inbound loop of a badge.
//!
//! Decodes every packet heard on air, keeps the neighbor table, runs the
//! handshake and hands application payloads to the connection bound to their
//! app id. A second task sweeps stale neighbors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Instant;

use async_trait::async_trait;
use badge_core::{
    decode_frame, encode_frame, AppId, ConnectionState, DeliveryWindow, Frame, HandshakeOutcome,
    HandshakeReply, LinkConfig, MacAddress, Message, MessageId, MessageIds, NeighborTable,
    Payload, PayloadRegistry, PeerAddress,
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::sender::ReliableSender;
use crate::transport::{InboundPacket, Transport};

/// Decides whether an incoming connection request is taken.
///
/// Called from the router loop under the accept timeout; inbound traffic waits
/// meanwhile, so long-running work belongs in a spawned task that owns the
/// connection.
#[async_trait]
pub trait ConnectionAcceptor: Send + Sync + 'static {
    async fn on_incoming(&self, connection: Connection) -> bool;
}

/// Accepts every request and leaves the connection to whoever looks it up.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

#[async_trait]
impl ConnectionAcceptor for AcceptAll {
    async fn on_incoming(&self, connection: Connection) -> bool {
        info!(peer = %connection.peer(), app_id = connection.app_id(), "accepting connection");
        true
    }
}

/// Declines every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectAll;

#[async_trait]
impl ConnectionAcceptor for RejectAll {
    async fn on_incoming(&self, _connection: Connection) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("peer did not answer in time")]
    TimedOut,
    #[error("peer refused the connection")]
    Rejected,
}

/// State shared by the router tasks and every connection.
pub(crate) struct Shared {
    pub(crate) local: MacAddress,
    pub(crate) config: LinkConfig,
    pub(crate) ids: Arc<MessageIds>,
    pub(crate) sender: ReliableSender,
    pub(crate) epoch: tokio::time::Instant,
    registry: PayloadRegistry,
    acceptor: Arc<dyn ConnectionAcceptor>,
    neighbors: Mutex<NeighborTable>,
    changes: watch::Sender<u64>,
    connections: Mutex<HashMap<AppId, Connection>>,
    delivered: Mutex<DeliveryWindow>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

pub struct RouterBuilder {
    transport: Arc<dyn Transport>,
    config: LinkConfig,
    registry: PayloadRegistry,
    acceptor: Arc<dyn ConnectionAcceptor>,
    ids: Option<Arc<MessageIds>>,
}

impl RouterBuilder {
    /// Application payload kinds this badge understands.
    pub fn registry(mut self, registry: PayloadRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn acceptor(mut self, acceptor: impl ConnectionAcceptor) -> Self {
        self.acceptor = Arc::new(acceptor);
        self
    }

    /// Share an id counter with other senders on the same radio.
    pub fn ids(mut self, ids: Arc<MessageIds>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn build(self) -> Router {
        let config = self.config;
        let (changes, _) = watch::channel(0);
        Router {
            shared: Arc::new(Shared {
                local: self.transport.local_address(),
                ids: self.ids.unwrap_or_default(),
                sender: ReliableSender::new(self.transport, &config),
                epoch: tokio::time::Instant::now(),
                registry: self.registry,
                acceptor: self.acceptor,
                neighbors: Mutex::new(NeighborTable::new(
                    config.neighbor_capacity,
                    config.stale_multiplier,
                )),
                changes,
                connections: Mutex::new(HashMap::new()),
                delivered: Mutex::new(DeliveryWindow::new(config.dedup_window)),
                tasks: StdMutex::new(Vec::new()),
                config,
            }),
        }
    }
}

/// Handle to a badge's router. Clones share one router.
#[derive(Clone)]
pub struct Router {
    shared: Arc<Shared>,
}

impl Router {
    pub fn builder(transport: Arc<dyn Transport>, config: LinkConfig) -> RouterBuilder {
        RouterBuilder {
            transport,
            config,
            registry: PayloadRegistry::new(),
            acceptor: Arc::new(AcceptAll),
            ids: None,
        }
    }

    /// Spawn the inbound loop over `inbound` and the staleness sweep.
    /// Returns false if the router was already started.
    pub fn start(&self, inbound: mpsc::Receiver<InboundPacket>) -> bool {
        let mut tasks = self
            .shared
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            warn!("router already started");
            return false;
        }
        self.shared.sender.start();
        tasks.push(tokio::spawn(dispatch_loop(self.shared.clone(), inbound)));
        tasks.push(tokio::spawn(sweep_loop(self.shared.clone())));
        true
    }

    /// Stop the router loops and the sender. Open connections are terminated without notice.
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = self
            .shared
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        self.shared.sender.stop();
        let open: Vec<Connection> = self
            .shared
            .connections
            .lock()
            .await
            .drain()
            .map(|(_, c)| c)
            .collect();
        for connection in open {
            connection.terminate(false).await;
        }
        info!(address = %self.shared.local, "router stopped");
    }

    pub fn local_address(&self) -> MacAddress {
        self.shared.local
    }

    pub fn config(&self) -> &LinkConfig {
        &self.shared.config
    }

    pub fn sender(&self) -> &ReliableSender {
        &self.shared.sender
    }

    pub fn ids(&self) -> &Arc<MessageIds> {
        &self.shared.ids
    }

    /// Snapshot of the neighbor table.
    pub async fn neighbors(&self) -> Vec<PeerAddress> {
        self.shared.neighbors.lock().await.iter().cloned().collect()
    }

    pub async fn latest_neighbor(&self) -> Option<PeerAddress> {
        self.shared.neighbors.lock().await.latest().cloned()
    }

    /// Connection currently bound to `app_id`.
    pub async fn connection(&self, app_id: AppId) -> Option<Connection> {
        self.shared.connection(app_id).await
    }

    /// Fresh, unconnected handle for `app_id` with `peer`. Call [`Connection::connect`] on it.
    pub fn open(&self, peer: MacAddress, app_id: AppId) -> Connection {
        Connection::new(&self.shared, peer, app_id, ConnectionState::Unconnected)
    }

    /// Run the handshake with `peer` and return the active connection.
    pub async fn connect(
        &self,
        peer: MacAddress,
        app_id: AppId,
    ) -> Result<Connection, ConnectError> {
        let connection = self.open(peer, app_id);
        match connection.connect().await {
            HandshakeOutcome::Acked => Ok(connection),
            HandshakeOutcome::TimedOut => Err(ConnectError::TimedOut),
            HandshakeOutcome::Pending | HandshakeOutcome::Rejected => Err(ConnectError::Rejected),
        }
    }

    /// Neighbor table change notifications, optionally only for one peer.
    pub fn updates(&self, filter: Option<MacAddress>) -> NeighborUpdates {
        NeighborUpdates {
            changes: self.shared.changes.subscribe(),
            shared: Arc::downgrade(&self.shared),
            filter,
        }
    }
}

/// One change of the neighbor table.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborChange {
    /// Most recently heard neighbor after the change; `None` once the table is empty.
    pub latest: Option<PeerAddress>,
    pub neighbors: usize,
}

pub struct NeighborUpdates {
    changes: watch::Receiver<u64>,
    shared: Weak<Shared>,
    filter: Option<MacAddress>,
}

impl NeighborUpdates {
    /// Wait for the next change. Changes that happen while the caller is busy
    /// coalesce into one. Returns `None` once the router is gone.
    pub async fn next(&mut self) -> Option<NeighborChange> {
        loop {
            self.changes.changed().await.ok()?;
            let shared = self.shared.upgrade()?;
            let mut table = shared.neighbors.lock().await;
            let latest = table.latest().cloned();
            let neighbors = table.len();
            drop(table);
            match (&latest, self.filter) {
                (_, None) => return Some(NeighborChange { latest, neighbors }),
                (Some(peer), Some(only)) if peer.address == only => {
                    return Some(NeighborChange { latest, neighbors })
                }
                _ => continue,
            }
        }
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

fn hex_head(bytes: &[u8]) -> String {
    bytes.iter().take(16).map(|b| format!("{b:02x}")).collect()
}

async fn dispatch_loop(shared: Arc<Shared>, mut inbound: mpsc::Receiver<InboundPacket>) {
    info!(address = %shared.local, "router listening");
    while let Some(packet) = inbound.recv().await {
        shared.handle_packet(packet).await;
    }
    info!("radio closed, router stopping");
}

async fn sweep_loop(shared: Arc<Shared>) {
    let mut tick = tokio::time::interval(shared.config.sweep_interval());
    tick.tick().await;
    loop {
        tick.tick().await;
        let removed = shared
            .neighbors
            .lock()
            .await
            .remove_stale(shared.config.beacon_interval(), now());
        if removed > 0 {
            info!(removed, "dropped stale neighbors");
            shared.notify();
        }
    }
}

impl Shared {
    fn notify(&self) {
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub(crate) async fn connection(&self, app_id: AppId) -> Option<Connection> {
        self.connections.lock().await.get(&app_id).cloned()
    }

    /// Bind `connection` to its app id and make sure the radio knows the peer.
    /// Returns the connection it displaced, if any.
    pub(crate) async fn register(&self, connection: &Connection) -> Option<Connection> {
        let displaced = self
            .connections
            .lock()
            .await
            .insert(connection.app_id(), connection.clone())
            .filter(|old| !old.same(connection));
        if let Err(e) = self
            .sender
            .transport()
            .register_peer(connection.peer())
            .await
        {
            debug!(peer = %connection.peer(), error = %e, "peer registration deferred to sender");
        }
        displaced
    }

    /// Remove `connection` if it is still the one bound to its app id.
    pub(crate) async fn unregister(&self, connection: &Connection) {
        let mut connections = self.connections.lock().await;
        if connections
            .get(&connection.app_id())
            .is_some_and(|c| c.same(connection))
        {
            connections.remove(&connection.app_id());
        }
    }

    async fn first_delivery(&self, from: MacAddress, id: MessageId) -> bool {
        self.delivered.lock().await.first_delivery(from, id)
    }

    async fn touch(&self, peer: MacAddress) {
        self.neighbors.lock().await.touch(&peer, now());
    }

    async fn send_ack(&self, to: MacAddress, id: MessageId) {
        let sent = match encode_frame(&Frame::ack(id)) {
            Ok(bytes) => self.sender.send_once(to, bytes).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            warn!(%to, id, error = %e, "could not ack");
        }
    }

    async fn handle_packet(self: &Arc<Self>, packet: InboundPacket) {
        let InboundPacket {
            source,
            bytes,
            signal_strength,
        } = packet;
        if signal_strength < self.config.min_signal_strength {
            return;
        }
        let frame = match decode_frame(&bytes, &self.registry) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%source, len = bytes.len(), head = %hex_head(&bytes), error = %e, "dropping undecodable packet");
                return;
            }
        };
        let Frame { id, message } = frame;
        debug!(%source, id, kind = message.kind(), "received");
        match message {
            Message::Beacon { name } => {
                self.neighbors
                    .lock()
                    .await
                    .upsert(source, name, signal_strength, now());
                self.notify();
            }
            Message::Ack { acked_id } => {
                self.touch(source).await;
                if let Err(e) = self.sender.acked(source, acked_id).await {
                    warn!(%source, acked_id, error = %e, "could not retire acked packet");
                }
            }
            Message::OpenConnection { app_id, accept } => {
                self.touch(source).await;
                self.on_open(source, id, app_id, accept).await;
            }
            Message::CloseConnection { app_id } => {
                self.touch(source).await;
                self.send_ack(source, id).await;
                match self.connection(app_id).await {
                    Some(connection) if connection.peer() == source => {
                        info!(peer = %source, app_id, "peer closed connection");
                        connection.terminate(false).await;
                    }
                    Some(connection) => {
                        warn!(%source, app_id, bound = %connection.peer(), "close from a peer not bound to this app");
                    }
                    None => debug!(%source, app_id, "close for an unknown connection"),
                }
            }
            Message::Application { app_id, payload } => {
                self.touch(source).await;
                self.send_ack(source, id).await;
                self.on_application(source, id, app_id, payload).await;
            }
        }
    }

    async fn on_open(
        self: &Arc<Self>,
        source: MacAddress,
        id: MessageId,
        app_id: AppId,
        accept: bool,
    ) {
        self.send_ack(source, id).await;

        if let Some(existing) = self.connection(app_id).await.filter(|c| c.peer() == source) {
            if existing.state() != ConnectionState::Pending {
                // Retransmitted request or reply; the ack above is all it needs.
                debug!(%source, id, app_id, "duplicate handshake packet");
                return;
            }
            // Reply to our request, or a request crossing ours.
            if let Err(e) = self.sender.acked(source, id).await {
                warn!(%source, id, error = %e, "could not retire handshake request");
            }
            if self.first_delivery(source, id).await {
                existing.complete_handshake(HandshakeReply { app_id, accept });
            }
            return;
        }

        if !accept {
            debug!(%source, app_id, "refusal for a connection we no longer have");
            return;
        }

        let connection = Connection::new(self, source, app_id, ConnectionState::Pending);
        let accepted = tokio::time::timeout(
            self.config.accept_timeout(),
            self.acceptor.on_incoming(connection.clone()),
        )
        .await;
        match accepted {
            Ok(true) => {}
            Ok(false) => {
                info!(peer = %source, app_id, "connection declined");
                connection.terminate(false).await;
                return;
            }
            Err(_) => {
                warn!(peer = %source, app_id, "no accept decision in time, declining");
                connection.terminate(false).await;
                return;
            }
        }
        if connection.state().is_terminated() {
            return;
        }

        if let Some(displaced) = self.register(&connection).await {
            warn!(app_id, old = %displaced.peer(), new = %source, "app rebound to a new peer");
            displaced.terminate(true).await;
        }
        let reply = Frame::new(id, Message::OpenConnection { app_id, accept: true });
        if let Err(e) = self.sender.send_frame(source, &reply).await {
            warn!(peer = %source, app_id, error = %e, "could not answer connection request");
            connection.terminate(false).await;
            return;
        }
        connection.activate();
        info!(peer = %source, app_id, "connection accepted");
    }

    async fn on_application(
        &self,
        source: MacAddress,
        id: MessageId,
        app_id: AppId,
        payload: Payload,
    ) {
        let Some(connection) = self.connection(app_id).await else {
            info!(%source, app_id, "no receiver for app, dropping");
            return;
        };
        if connection.peer() != source {
            warn!(%source, app_id, bound = %connection.peer(), "payload from a peer not bound to this app, dropping");
            return;
        }
        if !self.first_delivery(source, id).await {
            debug!(%source, id, "duplicate, already delivered");
            return;
        }
        connection.deliver(payload).await;
    }
}
