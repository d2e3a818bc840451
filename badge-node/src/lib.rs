//! Badge link runtime: reliable sender, router, connections and beacon over a
//! broadcast radio, on tokio.

pub mod beacon;
pub mod config;
pub mod connection;
pub mod radio;
pub mod router;
pub mod sender;
pub mod transport;

pub use beacon::Beacon;
pub use connection::{Connection, SendOutcome};
pub use radio::UdpRadio;
pub use router::{
    AcceptAll, ConnectError, ConnectionAcceptor, NeighborChange, NeighborUpdates, RejectAll,
    Router, RouterBuilder,
};
pub use sender::{ReliableSender, SenderError};
pub use transport::{InboundPacket, Transport, TransportError};
