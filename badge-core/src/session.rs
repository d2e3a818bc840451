//! Connection lifecycle states and handshake outcomes.

use std::fmt;

/// `Unconnected -> Pending -> Active -> Terminated`. `Terminated` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Unconnected,
    Pending,
    Active,
    Terminated,
}

impl ConnectionState {
    /// Whether moving to `next` is allowed. Any state may terminate; nothing leaves `Terminated`.
    pub fn can_become(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Unconnected, Pending) | (Pending, Active) => true,
            _ => false,
        }
    }

    pub fn is_terminated(self) -> bool {
        self == ConnectionState::Terminated
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Unconnected => "unconnected",
            ConnectionState::Pending => "pending",
            ConnectionState::Active => "active",
            ConnectionState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// How an outbound handshake ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Request sent, no answer yet.
    Pending,
    /// Peer accepted; the connection is active.
    Acked,
    /// No matching reply within the handshake timeout.
    TimedOut,
    /// Peer refused, replied for another app, or the connection was closed meanwhile.
    Rejected,
}

impl HandshakeOutcome {
    pub fn is_connected(self) -> bool {
        self == HandshakeOutcome::Acked
    }
}

/// What the peer answered to an `OpenConnection` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeReply {
    pub app_id: crate::protocol::AppId,
    pub accept: bool,
}
