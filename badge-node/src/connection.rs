//! One logical channel between this badge and one peer for one app id.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use badge_core::{
    AppId, AppMessage, AppPayload, ConnectionState, Frame, HandshakeOutcome, HandshakeReply,
    MacAddress, Message, Payload,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::router::Shared;

/// What happened to an outgoing payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the reliable sender.
    Queued,
    /// The connection is terminated; nothing was sent.
    Closed,
    /// The payload could not be encoded or the sender is gone.
    Failed,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    peer: MacAddress,
    app_id: AppId,
    link: Weak<Shared>,
    state: Mutex<ConnectionState>,
    last_activity: Mutex<Instant>,
    /// Dropped on terminate; the receiver then drains and ends.
    inbound_tx: Mutex<Option<mpsc::Sender<AppMessage>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<AppMessage>>,
    handshake: Mutex<Option<oneshot::Sender<HandshakeReply>>>,
    ping: Mutex<Option<(u32, oneshot::Sender<()>)>>,
}

/// Handle to a connection. Clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.inner.peer)
            .field("app_id", &self.inner.app_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        link: &Arc<Shared>,
        peer: MacAddress,
        app_id: AppId,
        state: ConnectionState,
    ) -> Self {
        let (tx, rx) = mpsc::channel(link.config.inbound_queue.max(1));
        Self {
            inner: Arc::new(Inner {
                peer,
                app_id,
                link: Arc::downgrade(link),
                state: Mutex::new(state),
                last_activity: Mutex::new(now()),
                inbound_tx: Mutex::new(Some(tx)),
                inbound_rx: tokio::sync::Mutex::new(rx),
                handshake: Mutex::new(None),
                ping: Mutex::new(None),
            }),
        }
    }

    pub fn peer(&self) -> MacAddress {
        self.inner.peer
    }

    pub fn app_id(&self) -> AppId {
        self.inner.app_id
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// Last time a payload was sent, delivered or received.
    pub fn last_activity(&self) -> Instant {
        *lock(&self.inner.last_activity)
    }

    pub(crate) fn same(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn touch(&self) {
        *lock(&self.inner.last_activity) = now();
    }

    fn transition(&self, next: ConnectionState) -> bool {
        let mut state = lock(&self.inner.state);
        if state.can_become(next) {
            *state = next;
            true
        } else {
            false
        }
    }

    /// Acceptor side: the accept reply is queued.
    pub(crate) fn activate(&self) -> bool {
        self.transition(ConnectionState::Active)
    }

    /// Hand the peer's answer to a waiting [`connect`](Self::connect). False if nobody waits.
    pub(crate) fn complete_handshake(&self, reply: HandshakeReply) -> bool {
        let waiter = lock(&self.inner.handshake).take();
        match waiter {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Ask the peer to open this connection and wait for its answer.
    ///
    /// Only an unconnected handle can connect. On timeout the connection is
    /// terminated and the peer told so; a refusal terminates it silently.
    pub async fn connect(&self) -> HandshakeOutcome {
        let Some(link) = self.inner.link.upgrade() else {
            return HandshakeOutcome::Rejected;
        };
        if !self.transition(ConnectionState::Pending) {
            warn!(peer = %self.peer(), app_id = self.app_id(), state = %self.state(), "connect on a used connection");
            return HandshakeOutcome::Rejected;
        }
        let (tx, rx) = oneshot::channel();
        *lock(&self.inner.handshake) = Some(tx);

        if let Some(displaced) = link.register(self).await {
            warn!(app_id = self.app_id(), old = %displaced.peer(), "replacing connection for app");
            displaced.terminate(true).await;
        }
        let id = link.ids.next_id();
        info!(peer = %self.peer(), app_id = self.app_id(), id, "requesting connection");
        let request = Frame::new(
            id,
            Message::OpenConnection {
                app_id: self.app_id(),
                accept: true,
            },
        );
        if let Err(e) = link.sender.send_frame(self.peer(), &request).await {
            warn!(peer = %self.peer(), error = %e, "could not send connection request");
            self.terminate(false).await;
            return HandshakeOutcome::Rejected;
        }
        let wait = link.config.handshake_timeout();
        drop(link);

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(reply)) if reply.accept && reply.app_id == self.app_id() => {
                if self.transition(ConnectionState::Active) {
                    info!(peer = %self.peer(), app_id = self.app_id(), "connected");
                    HandshakeOutcome::Acked
                } else {
                    HandshakeOutcome::Rejected
                }
            }
            Ok(Ok(reply)) => {
                info!(peer = %self.peer(), app_id = reply.app_id, accept = reply.accept, "connection refused");
                self.terminate(false).await;
                HandshakeOutcome::Rejected
            }
            // Terminated while waiting.
            Ok(Err(_)) => HandshakeOutcome::Rejected,
            Err(_) => {
                warn!(peer = %self.peer(), app_id = self.app_id(), "no answer to connection request");
                self.terminate(true).await;
                HandshakeOutcome::TimedOut
            }
        }
    }

    /// Encode `value` and send it to the peer.
    pub async fn send<T: AppPayload>(&self, value: &T) -> SendOutcome {
        match AppMessage::encode(value) {
            Ok(message) => self.send_message(message).await,
            Err(e) => {
                warn!(kind = T::KIND, error = %e, "could not encode payload");
                SendOutcome::Failed
            }
        }
    }

    pub async fn send_message(&self, message: AppMessage) -> SendOutcome {
        self.send_payload(Payload::App(message)).await
    }

    async fn send_payload(&self, payload: Payload) -> SendOutcome {
        if self.state().is_terminated() {
            info!(peer = %self.peer(), app_id = self.app_id(), "connection closed, not sending");
            return SendOutcome::Closed;
        }
        let Some(link) = self.inner.link.upgrade() else {
            return SendOutcome::Closed;
        };
        let frame = Frame::new(
            link.ids.next_id(),
            Message::Application {
                app_id: self.app_id(),
                payload,
            },
        );
        match link.sender.send_frame(self.peer(), &frame).await {
            Ok(()) => {
                self.touch();
                SendOutcome::Queued
            }
            Err(e) => {
                warn!(peer = %self.peer(), app_id = self.app_id(), error = %e, "send failed");
                SendOutcome::Failed
            }
        }
    }

    /// Next payload from the peer, in arrival order. `None` once the connection is
    /// closed and everything already received has been read.
    pub async fn receive(&self) -> Option<AppMessage> {
        let message = self.inner.inbound_rx.lock().await.recv().await?;
        self.touch();
        Some(message)
    }

    /// Router side: a de-duplicated payload for this connection arrived.
    pub(crate) async fn deliver(&self, payload: Payload) {
        self.touch();
        match payload {
            Payload::Ping {
                mark,
                is_reply: false,
            } => {
                self.send_payload(Payload::Ping {
                    mark,
                    is_reply: true,
                })
                .await;
            }
            Payload::Ping {
                mark,
                is_reply: true,
            } => {
                let waiter = {
                    let mut ping = lock(&self.inner.ping);
                    if ping.as_ref().is_some_and(|(m, _)| *m == mark) {
                        ping.take()
                    } else {
                        None
                    }
                };
                match waiter {
                    Some((_, tx)) => {
                        let _ = tx.send(());
                    }
                    None => debug!(peer = %self.peer(), mark, "late ping reply"),
                }
            }
            Payload::App(message) => {
                if !self.is_active() {
                    info!(peer = %self.peer(), app_id = self.app_id(), state = %self.state(), "connection not active, dropping payload");
                    return;
                }
                let tx = lock(&self.inner.inbound_tx).clone();
                let Some(tx) = tx else {
                    return;
                };
                if let Err(mpsc::error::TrySendError::Full(dropped)) = tx.try_send(message) {
                    warn!(peer = %self.peer(), app_id = self.app_id(), kind = %dropped.kind, "inbound queue full, dropping payload");
                }
            }
        }
    }

    /// Round trip to the peer's connection stack, or `None` without an answer in time.
    pub async fn ping(&self) -> Option<Duration> {
        let Some(link) = self.inner.link.upgrade() else {
            return None;
        };
        // Milliseconds since the router started; wraps after 49 days.
        let mark = link.epoch.elapsed().as_millis() as u32;
        let wait = link.config.ping_timeout();
        drop(link);

        let (tx, rx) = oneshot::channel();
        *lock(&self.inner.ping) = Some((mark, tx));
        let started = tokio::time::Instant::now();
        let sent = self
            .send_payload(Payload::Ping {
                mark,
                is_reply: false,
            })
            .await;
        if sent != SendOutcome::Queued {
            lock(&self.inner.ping).take();
            return None;
        }
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(())) => Some(started.elapsed()),
            _ => {
                lock(&self.inner.ping).take();
                debug!(peer = %self.peer(), app_id = self.app_id(), "ping unanswered");
                None
            }
        }
    }

    /// Close the connection. With `send_out` the peer is told so. Pending
    /// handshake and ping waiters end and `receive` runs dry. Idempotent.
    pub async fn terminate(&self, send_out: bool) {
        let previous = {
            let mut state = lock(&self.inner.state);
            std::mem::replace(&mut *state, ConnectionState::Terminated)
        };
        if previous.is_terminated() {
            return;
        }
        lock(&self.inner.inbound_tx).take();
        lock(&self.inner.handshake).take();
        lock(&self.inner.ping).take();

        let Some(link) = self.inner.link.upgrade() else {
            return;
        };
        link.unregister(self).await;
        if send_out && previous != ConnectionState::Unconnected {
            let close = Frame::new(
                link.ids.next_id(),
                Message::CloseConnection {
                    app_id: self.app_id(),
                },
            );
            if let Err(e) = link.sender.send_frame(self.peer(), &close).await {
                warn!(peer = %self.peer(), error = %e, "could not send close");
            }
        }
        info!(peer = %self.peer(), app_id = self.app_id(), was = %previous, "connection terminated");
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}
