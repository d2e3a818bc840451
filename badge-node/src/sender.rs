//! Reliable sender: one task owning the outbound queue and the ack tracker.
//!
//! Tracked packets are retransmitted every ack timeout until acked or out of
//! retries. Acks and beacons go through the same queue untracked. Transient
//! radio errors are recovered in place; a fatal error ends the task and the
//! next enqueue starts it again with its pending state intact.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use badge_core::{
    encode_frame, AckTracker, EncodeError, Frame, LinkConfig, MacAddress, MessageId,
    OutboundEnvelope,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, trace, warn};

use crate::transport::{Transport, TransportError};

/// Corrective actions tried for one transmission before it is given up as lost on air.
pub const MAX_RECOVERIES: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum SenderError {
    #[error("sender queue closed")]
    Closed,
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("radio: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug)]
enum Outbound {
    Tracked(OutboundEnvelope),
    Once {
        destination: MacAddress,
        bytes: Vec<u8>,
    },
    Acked {
        from: MacAddress,
        id: MessageId,
    },
}

/// Owned by whichever task instance is running; survives restarts.
struct SenderState {
    queue: mpsc::Receiver<Outbound>,
    tracker: AckTracker,
}

struct Inner {
    transport: Arc<dyn Transport>,
    queue: mpsc::Sender<Outbound>,
    state: Arc<tokio::sync::Mutex<SenderState>>,
    task: Mutex<Option<JoinHandle<Result<(), SenderError>>>>,
    ack_timeout: Duration,
    retries: u8,
}

/// Cheap to clone; every clone feeds the same task.
#[derive(Clone)]
pub struct ReliableSender {
    inner: Arc<Inner>,
}

impl ReliableSender {
    pub fn new(transport: Arc<dyn Transport>, config: &LinkConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.outbound_queue.max(1));
        let ack_timeout = config.ack_timeout();
        Self {
            inner: Arc::new(Inner {
                transport,
                queue: tx,
                state: Arc::new(tokio::sync::Mutex::new(SenderState {
                    queue: rx,
                    tracker: AckTracker::new(ack_timeout),
                })),
                task: Mutex::new(None),
                ack_timeout,
                retries: config.retries,
            }),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Default retry budget for tracked packets.
    pub fn retries(&self) -> u8 {
        self.inner.retries
    }

    /// Spawn the send loop unless one is already running. Returns true if it spawned.
    pub fn start(&self) -> bool {
        let mut task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return false;
        }
        let transport = self.inner.transport.clone();
        let state = self.inner.state.clone();
        let ack_timeout = self.inner.ack_timeout;
        *task = Some(tokio::spawn(async move {
            let result = send_loop(transport, state, ack_timeout).await;
            if let Err(e) = &result {
                error!(error = %e, "sender stopped");
            }
            result
        }));
        true
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Cancel the send loop. Queued and waiting packets are kept for the next start.
    pub fn stop(&self) {
        if let Some(task) = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    /// Queue a packet for at-least-once delivery. Waits while the queue is full.
    pub async fn enqueue(
        &self,
        bytes: Vec<u8>,
        destination: MacAddress,
        id: MessageId,
        retries: u8,
    ) -> Result<(), SenderError> {
        self.push(Outbound::Tracked(OutboundEnvelope::new(
            bytes,
            destination,
            id,
            retries,
        )))
        .await
    }

    /// Encode `frame` and queue it with the default retry budget.
    pub async fn send_frame(&self, destination: MacAddress, frame: &Frame) -> Result<(), SenderError> {
        let bytes = encode_frame(frame)?;
        self.enqueue(bytes, destination, frame.id, self.inner.retries)
            .await
    }

    /// Queue a packet that is transmitted once and never tracked.
    pub async fn send_once(
        &self,
        destination: MacAddress,
        bytes: Vec<u8>,
    ) -> Result<(), SenderError> {
        self.push(Outbound::Once { destination, bytes }).await
    }

    /// Retire the packet `id` sent to `from`.
    pub async fn acked(&self, from: MacAddress, id: MessageId) -> Result<(), SenderError> {
        self.push(Outbound::Acked { from, id }).await
    }

    async fn push(&self, item: Outbound) -> Result<(), SenderError> {
        self.start();
        self.inner
            .queue
            .send(item)
            .await
            .map_err(|_| SenderError::Closed)
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn send_loop(
    transport: Arc<dyn Transport>,
    state: Arc<tokio::sync::Mutex<SenderState>>,
    ack_timeout: Duration,
) -> Result<(), SenderError> {
    let mut state = state.lock().await;
    let SenderState { queue, tracker } = &mut *state;
    let mut poll = tokio::time::interval(ack_timeout);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            item = queue.recv() => match item {
                None => return Ok(()),
                Some(Outbound::Tracked(envelope)) => {
                    transmit(&*transport, envelope.destination, &envelope.bytes).await?;
                    trace!(to = %envelope.destination, id = envelope.id, "sent, waiting for ack");
                    tracker.sent(envelope, now());
                }
                Some(Outbound::Once { destination, bytes }) => {
                    transmit(&*transport, destination, &bytes).await?;
                }
                Some(Outbound::Acked { from, id }) => {
                    if tracker.acked(from, id).is_some() {
                        trace!(%from, id, "acked");
                    }
                }
            },
            _ = poll.tick() => {
                let outcome = tracker.poll(now());
                for envelope in outcome.expired {
                    debug!(to = %envelope.destination, id = envelope.id, "no ack, giving up");
                }
                // Every due envelope has spent a retry, so the whole batch goes out
                // before a fatal error ends the task.
                let mut fatal = None;
                for envelope in outcome.retransmit {
                    debug!(
                        to = %envelope.destination,
                        id = envelope.id,
                        left = envelope.retries_remaining,
                        "retransmitting"
                    );
                    let sent = transmit(&*transport, envelope.destination, &envelope.bytes).await;
                    if let Err(e) = sent {
                        fatal.get_or_insert(e);
                    }
                }
                if let Some(e) = fatal {
                    return Err(e.into());
                }
            }
        }
    }
}

/// Put one packet on air, recovering from transient radio errors.
async fn transmit(
    transport: &dyn Transport,
    destination: MacAddress,
    bytes: &[u8],
) -> Result<(), TransportError> {
    let mut recoveries = 0;
    loop {
        match transport.send(destination, bytes).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() => {
                if recoveries == MAX_RECOVERIES {
                    warn!(to = %destination, error = %e, "radio still failing, packet lost");
                    return Ok(());
                }
                recoveries += 1;
                debug!(to = %destination, error = %e, "recovering radio");
                if let Err(e) = transport.recover(e).await {
                    if !e.is_transient() {
                        return Err(e);
                    }
                }
            }
            Err(e) => return Err(e),
        }
    }
}
