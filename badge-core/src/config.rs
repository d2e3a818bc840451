//! Protocol tunables. Defaults match the badge firmware.

use std::time::Duration;

use serde::Deserialize;

use crate::dedup::DEFAULT_DEDUP_WINDOW;
use crate::neighbors::{DEFAULT_NEIGHBOR_CAPACITY, DEFAULT_STALE_MULTIPLIER};
use crate::retry::DEFAULT_RETRIES;

/// Timers, budgets and queue sizes of the link layer.
/// Deserializable as the `[link]` table of the node config; every field is optional.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LinkConfig {
    /// Beacon period; also the base of neighbor staleness.
    pub beacon_interval_secs: u64,
    /// How long an initiator waits for the `OpenConnection` reply.
    pub handshake_timeout_secs: u64,
    /// How long the application may take to accept an incoming connection.
    pub accept_timeout_secs: u64,
    pub ping_timeout_secs: u64,
    /// Ack wait and retry poll period.
    pub ack_timeout_ms: u64,
    pub retries: u8,
    /// Staleness sweep period.
    pub sweep_interval_secs: u64,
    pub neighbor_capacity: usize,
    pub stale_multiplier: f64,
    pub dedup_window: usize,
    /// Packets weaker than this (dBm) are ignored.
    pub min_signal_strength: i8,
    pub outbound_queue: usize,
    pub inbound_queue: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            beacon_interval_secs: 5,
            handshake_timeout_secs: 20,
            accept_timeout_secs: 15,
            ping_timeout_secs: 5,
            ack_timeout_ms: 500,
            retries: DEFAULT_RETRIES,
            sweep_interval_secs: 5,
            neighbor_capacity: DEFAULT_NEIGHBOR_CAPACITY,
            stale_multiplier: DEFAULT_STALE_MULTIPLIER,
            dedup_window: DEFAULT_DEDUP_WINDOW,
            min_signal_strength: -70,
            outbound_queue: 5,
            inbound_queue: 5,
        }
    }
}

impl LinkConfig {
    pub fn beacon_interval(&self) -> Duration {
        Duration::from_secs(self.beacon_interval_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.accept_timeout_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
