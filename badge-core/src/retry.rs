//! Ack tracking: envelopes waiting for acknowledgment, retry budget and expiry.
//! Pure bookkeeping; the sender task owns one tracker and drives it with `poll`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::address::MacAddress;
use crate::protocol::MessageId;

/// Default retransmissions after the first send.
pub const DEFAULT_RETRIES: u8 = 3;

/// Default wait for an ack before retransmitting (also the poll interval).
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(500);

/// One outbound packet tracked until acked or out of retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEnvelope {
    pub bytes: Vec<u8>,
    pub destination: MacAddress,
    pub id: MessageId,
    pub retries_remaining: u8,
}

impl OutboundEnvelope {
    pub fn new(bytes: Vec<u8>, destination: MacAddress, id: MessageId, retries: u8) -> Self {
        Self {
            bytes,
            destination,
            id,
            retries_remaining: retries,
        }
    }

    pub fn key(&self) -> (MacAddress, MessageId) {
        (self.destination, self.id)
    }
}

#[derive(Debug)]
struct Waiting {
    envelope: OutboundEnvelope,
    sent_at: Instant,
}

/// Result of one poll: envelopes to put on air again, and envelopes given up on.
#[derive(Debug, Default)]
pub struct PollOutcome {
    pub retransmit: Vec<OutboundEnvelope>,
    pub expired: Vec<OutboundEnvelope>,
}

#[derive(Debug)]
pub struct AckTracker {
    ack_timeout: Duration,
    waiting: HashMap<(MacAddress, MessageId), Waiting>,
}

impl AckTracker {
    pub fn new(ack_timeout: Duration) -> Self {
        Self {
            ack_timeout,
            waiting: HashMap::new(),
        }
    }

    /// Envelope went on air at `now`. A previous envelope with the same key is replaced.
    pub fn sent(&mut self, envelope: OutboundEnvelope, now: Instant) {
        self.waiting.insert(
            envelope.key(),
            Waiting {
                envelope,
                sent_at: now,
            },
        );
    }

    /// Ack for `id` arrived from `from`. Returns the retired envelope, if any was waiting.
    pub fn acked(&mut self, from: MacAddress, id: MessageId) -> Option<OutboundEnvelope> {
        self.waiting.remove(&(from, id)).map(|w| w.envelope)
    }

    pub fn is_waiting(&self, destination: MacAddress, id: MessageId) -> bool {
        self.waiting.contains_key(&(destination, id))
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Retransmit every envelope whose ack wait elapsed, spending one retry; drop
    /// envelopes with no retries left. Retransmitted envelopes restart their wait at `now`.
    pub fn poll(&mut self, now: Instant) -> PollOutcome {
        let mut outcome = PollOutcome::default();
        let due: Vec<(MacAddress, MessageId)> = self
            .waiting
            .iter()
            .filter(|(_, w)| now.saturating_duration_since(w.sent_at) >= self.ack_timeout)
            .map(|(k, _)| *k)
            .collect();
        for key in due {
            let Some(waiting) = self.waiting.get_mut(&key) else {
                continue;
            };
            if waiting.envelope.retries_remaining == 0 {
                if let Some(w) = self.waiting.remove(&key) {
                    outcome.expired.push(w.envelope);
                }
                continue;
            }
            waiting.envelope.retries_remaining -= 1;
            waiting.sent_at = now;
            outcome.retransmit.push(waiting.envelope.clone());
        }
        outcome
    }
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new(DEFAULT_ACK_TIMEOUT)
    }
}
