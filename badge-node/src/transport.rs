//! Radio adapter boundary. The sender pushes packets through a [`Transport`];
//! inbound packets arrive on an mpsc stream handed to the router.

use async_trait::async_trait;
use badge_core::MacAddress;

/// One packet heard on air.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    pub source: MacAddress,
    pub bytes: Vec<u8>,
    /// Received signal strength in dBm.
    pub signal_strength: i8,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("radio not active")]
    NotActive,
    #[error("peer {0} not registered with the radio")]
    PeerNotRegistered(MacAddress),
    #[error("network interface down")]
    InterfaceDown,
    #[error("radio I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("radio failure: {0}")]
    Fatal(String),
}

impl TransportError {
    /// Errors the sender recovers from with [`Transport`]'s corrective actions.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::NotActive
                | TransportError::PeerNotRegistered(_)
                | TransportError::InterfaceDown
        )
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Hardware address this radio transmits from.
    fn local_address(&self) -> MacAddress;

    async fn send(&self, destination: MacAddress, bytes: &[u8]) -> Result<(), TransportError>;

    async fn activate(&self) -> Result<(), TransportError>;

    /// Idempotent.
    async fn register_peer(&self, peer: MacAddress) -> Result<(), TransportError>;

    async fn activate_interface(&self) -> Result<(), TransportError>;

    /// Run the corrective action matching a transient error. Fatal errors are returned as is.
    async fn recover(&self, error: TransportError) -> Result<(), TransportError> {
        match error {
            TransportError::NotActive => self.activate().await,
            TransportError::PeerNotRegistered(peer) => self.register_peer(peer).await,
            TransportError::InterfaceDown => self.activate_interface().await,
            other => Err(other),
        }
    }
}
