//! UDP multicast stand-in for the badge radio.
//!
//! All nodes on a LAN join one multicast group and behave like radios on one
//! channel. Datagram layout: `[destination: 6][source: 6][payload]`.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use badge_core::{MacAddress, MAX_FRAME_LEN};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::transport::{InboundPacket, Transport, TransportError};

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 60);
pub const DEFAULT_RADIO_PORT: u16 = 45690;
/// Reported for every datagram; UDP has no signal strength.
pub const NOMINAL_SIGNAL_STRENGTH: i8 = -40;

const HEADER_LEN: usize = 12;
const INBOUND_BACKLOG: usize = 32;

pub struct UdpRadio {
    socket: Arc<UdpSocket>,
    group: SocketAddr,
    local: MacAddress,
    active: AtomicBool,
    peers: Mutex<HashSet<MacAddress>>,
    receiver: JoinHandle<()>,
}

impl UdpRadio {
    /// Join the multicast group on `port` and start listening.
    /// Packets for `local` or the discovery address arrive on the returned stream.
    pub async fn open(
        local: MacAddress,
        port: u16,
    ) -> std::io::Result<(Arc<Self>, mpsc::Receiver<InboundPacket>)> {
        let socket = Arc::new(make_multicast_socket(port)?);
        let (tx, rx) = mpsc::channel(INBOUND_BACKLOG);
        let receiver = tokio::spawn(recv_loop(socket.clone(), local, tx));
        let radio = Arc::new(Self {
            socket,
            group: SocketAddr::from((MULTICAST_GROUP, port)),
            local,
            active: AtomicBool::new(true),
            peers: Mutex::new(HashSet::new()),
            receiver,
        });
        Ok((radio, rx))
    }

    /// Stop transmitting until [`Transport::activate`] is called.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

impl Drop for UdpRadio {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

#[async_trait]
impl Transport for UdpRadio {
    fn local_address(&self) -> MacAddress {
        self.local
    }

    async fn send(&self, destination: MacAddress, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(TransportError::NotActive);
        }
        if !destination.is_discovery()
            && !self
                .peers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&destination)
        {
            return Err(TransportError::PeerNotRegistered(destination));
        }
        let datagram = datagram(destination, self.local, bytes);
        self.socket.send_to(&datagram, self.group).await?;
        trace!(to = %destination, len = bytes.len(), "datagram out");
        Ok(())
    }

    async fn activate(&self) -> Result<(), TransportError> {
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn register_peer(&self, peer: MacAddress) -> Result<(), TransportError> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer);
        Ok(())
    }

    async fn activate_interface(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

fn make_multicast_socket(port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

fn datagram(destination: MacAddress, source: MacAddress, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(destination.as_bytes());
    out.extend_from_slice(source.as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Split a datagram into destination, source and payload.
fn parse_datagram(buf: &[u8]) -> Option<(MacAddress, MacAddress, &[u8])> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let (dest, rest) = buf.split_at(6);
    let (source, payload) = rest.split_at(6);
    Some((
        MacAddress::new(dest.try_into().ok()?),
        MacAddress::new(source.try_into().ok()?),
        payload,
    ))
}

async fn recv_loop(socket: Arc<UdpSocket>, local: MacAddress, tx: mpsc::Sender<InboundPacket>) {
    let mut buf = vec![0u8; HEADER_LEN + MAX_FRAME_LEN + 64];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "radio receive failed");
                return;
            }
        };
        let Some((destination, source, payload)) = parse_datagram(&buf[..n]) else {
            debug!(%from, len = n, "runt datagram");
            continue;
        };
        if source == local || (destination != local && !destination.is_discovery()) {
            continue;
        }
        let packet = InboundPacket {
            source,
            bytes: payload.to_vec(),
            signal_strength: NOMINAL_SIGNAL_STRENGTH,
        };
        match tx.try_send(packet) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(%source, "inbound backlog full, packet lost");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}
