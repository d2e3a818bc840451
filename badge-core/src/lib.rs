//! Badge link protocol core.
//! Host-driven: no I/O and no clock; callers pass `now` and act on returned values.

pub mod address;
pub mod config;
pub mod dedup;
pub mod neighbors;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod session;
pub mod wire;

pub use address::{MacAddress, PeerAddress, DISCOVERY_ADDRESS};
pub use config::LinkConfig;
pub use dedup::DeliveryWindow;
pub use neighbors::NeighborTable;
pub use protocol::{
    AppId, AppMessage, AppPayload, Frame, Message, MessageId, MessageIds, Payload,
    PROTOCOL_VERSION,
};
pub use registry::PayloadRegistry;
pub use retry::{AckTracker, OutboundEnvelope, PollOutcome};
pub use session::{ConnectionState, HandshakeOutcome, HandshakeReply};
pub use wire::{decode_frame, encode_frame, DecodeError, EncodeError, MAX_FRAME_LEN};
