//! Delivery de-duplication: remembers the last few (peer, message id) pairs handed
//! to an application so retransmissions are not delivered twice.

use std::collections::VecDeque;

use crate::address::MacAddress;
use crate::protocol::MessageId;

/// Default number of remembered deliveries.
pub const DEFAULT_DEDUP_WINDOW: usize = 5;

#[derive(Debug, Clone)]
pub struct DeliveryWindow {
    size: usize,
    recent: VecDeque<(MacAddress, MessageId)>,
}

impl DeliveryWindow {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            recent: VecDeque::with_capacity(size.max(1)),
        }
    }

    fn contains(&self, from: &MacAddress, id: MessageId) -> bool {
        self.recent.iter().any(|(a, i)| a == from && *i == id)
    }

    /// Record a delivery. Returns false when the pair is already in the window,
    /// i.e. the caller must drop the message as a duplicate.
    pub fn first_delivery(&mut self, from: MacAddress, id: MessageId) -> bool {
        if self.contains(&from, id) {
            return false;
        }
        if self.recent.len() == self.size {
            self.recent.pop_front();
        }
        self.recent.push_back((from, id));
        true
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }
}

impl Default for DeliveryWindow {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}
