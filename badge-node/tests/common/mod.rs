#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use badge_core::{
    decode_frame, encode_frame, AppId, AppPayload, Frame, LinkConfig, MacAddress, Message,
    MessageIds, PayloadRegistry,
};
use badge_node::{Connection, ConnectionAcceptor, InboundPacket, Router, Transport, TransportError};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration};

pub const A: MacAddress = MacAddress::new([0x02, 0, 0, 0, 0, 0x0a]);
pub const B: MacAddress = MacAddress::new([0x02, 0, 0, 0, 0, 0x0b]);
pub const C: MacAddress = MacAddress::new([0x02, 0, 0, 0, 0, 0x0c]);
pub const D: MacAddress = MacAddress::new([0x02, 0, 0, 0, 0, 0x0d]);

pub const STRONG: i8 = -40;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub text: String,
}

impl Chat {
    pub fn new(text: &str) -> Self {
        Self { text: text.into() }
    }
}

impl AppPayload for Chat {
    const KIND: &'static str = "chat";
}

pub fn registry() -> PayloadRegistry {
    PayloadRegistry::new().with::<Chat>()
}

/// A packet put on air, as seen by the simulated channel.
#[derive(Debug, Clone)]
pub struct Transmission {
    pub from: MacAddress,
    pub to: MacAddress,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
struct AirState {
    radios: HashMap<MacAddress, mpsc::Sender<InboundPacket>>,
    signal: HashMap<MacAddress, i8>,
    cut: HashSet<(MacAddress, MacAddress)>,
    log: Vec<Transmission>,
}

/// One shared radio channel. Every radio hears broadcasts; unicast reaches the addressee only.
#[derive(Default)]
pub struct SimulatedAir {
    state: Mutex<AirState>,
}

impl SimulatedAir {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn join(
        self: &Arc<Self>,
        address: MacAddress,
    ) -> (Arc<AirRadio>, mpsc::Receiver<InboundPacket>) {
        let (tx, rx) = mpsc::channel(64);
        self.state.lock().await.radios.insert(address, tx);
        let radio = Arc::new(AirRadio {
            air: self.clone(),
            local: address,
            failures: Mutex::new(VecDeque::new()),
            recoveries: Mutex::new(Vec::new()),
        });
        (radio, rx)
    }

    /// Take `address` off the air; it neither hears nor is heard.
    pub async fn leave(&self, address: MacAddress) {
        self.state.lock().await.radios.remove(&address);
    }

    /// Signal strength `from` is received with (default [`STRONG`]).
    pub async fn set_signal(&self, from: MacAddress, dbm: i8) {
        self.state.lock().await.signal.insert(from, dbm);
    }

    /// Drop everything `from` sends to `to`.
    pub async fn cut(&self, from: MacAddress, to: MacAddress) {
        self.state.lock().await.cut.insert((from, to));
    }

    pub async fn uncut(&self, from: MacAddress, to: MacAddress) {
        self.state.lock().await.cut.remove(&(from, to));
    }

    pub async fn transmit(&self, from: MacAddress, to: MacAddress, bytes: &[u8]) {
        let mut state = self.state.lock().await;
        state.log.push(Transmission {
            from,
            to,
            bytes: bytes.to_vec(),
        });
        let signal_strength = state.signal.get(&from).copied().unwrap_or(STRONG);
        for (address, radio) in &state.radios {
            let addressed = to.is_discovery() || *address == to;
            if !addressed || *address == from || state.cut.contains(&(from, *address)) {
                continue;
            }
            // A busy receiver misses the packet, like a real radio.
            let _ = radio.try_send(InboundPacket {
                source: from,
                bytes: bytes.to_vec(),
                signal_strength,
            });
        }
    }

    /// Put a hand-made packet on air.
    pub async fn inject(&self, from: MacAddress, to: MacAddress, frame: &Frame) {
        let bytes = encode_frame(frame).expect("test frame encodes");
        self.transmit(from, to, &bytes).await;
    }

    /// Decodable frames `from` put on air, with their destination.
    pub async fn frames_from(&self, from: MacAddress) -> Vec<(MacAddress, Frame)> {
        let registry = registry();
        self.state
            .lock()
            .await
            .log
            .iter()
            .filter(|t| t.from == from)
            .filter_map(|t| decode_frame(&t.bytes, &registry).ok().map(|f| (t.to, f)))
            .collect()
    }

    pub async fn count_from(
        &self,
        from: MacAddress,
        matches: impl Fn(&MacAddress, &Frame) -> bool,
    ) -> usize {
        self.frames_from(from)
            .await
            .iter()
            .filter(|(to, f)| matches(to, f))
            .count()
    }

    pub async fn opens_from(&self, from: MacAddress, to: MacAddress) -> usize {
        self.count_from(from, |dest, f| {
            *dest == to && matches!(f.message, Message::OpenConnection { .. })
        })
        .await
    }

    pub async fn closes_from(&self, from: MacAddress, to: MacAddress) -> usize {
        self.count_from(from, |dest, f| {
            *dest == to && matches!(f.message, Message::CloseConnection { .. })
        })
        .await
    }

    pub async fn acks_from(&self, from: MacAddress, to: MacAddress, id: u8) -> usize {
        self.count_from(from, |dest, f| {
            *dest == to && f.message == Message::Ack { acked_id: id }
        })
        .await
    }

    pub async fn beacons_from(&self, from: MacAddress) -> usize {
        self.count_from(from, |_, f| matches!(f.message, Message::Beacon { .. }))
            .await
    }
}

pub struct AirRadio {
    air: Arc<SimulatedAir>,
    local: MacAddress,
    failures: Mutex<VecDeque<TransportError>>,
    pub recoveries: Mutex<Vec<&'static str>>,
}

impl AirRadio {
    /// Fail the next sends with `errors`, in order.
    pub async fn fail_next(&self, errors: Vec<TransportError>) {
        self.failures.lock().await.extend(errors);
    }
}

#[async_trait]
impl Transport for AirRadio {
    fn local_address(&self) -> MacAddress {
        self.local
    }

    async fn send(&self, destination: MacAddress, bytes: &[u8]) -> Result<(), TransportError> {
        if let Some(e) = self.failures.lock().await.pop_front() {
            return Err(e);
        }
        self.air.transmit(self.local, destination, bytes).await;
        Ok(())
    }

    async fn activate(&self) -> Result<(), TransportError> {
        self.recoveries.lock().await.push("activate");
        Ok(())
    }

    async fn register_peer(&self, _peer: MacAddress) -> Result<(), TransportError> {
        Ok(())
    }

    async fn activate_interface(&self) -> Result<(), TransportError> {
        self.recoveries.lock().await.push("interface");
        Ok(())
    }
}

pub struct Node {
    pub router: Router,
    pub radio: Arc<AirRadio>,
}

impl SimulatedAir {
    pub async fn node(
        self: &Arc<Self>,
        address: MacAddress,
        acceptor: impl ConnectionAcceptor,
    ) -> Node {
        self.node_with(address, LinkConfig::default(), acceptor).await
    }

    pub async fn node_with(
        self: &Arc<Self>,
        address: MacAddress,
        config: LinkConfig,
        acceptor: impl ConnectionAcceptor,
    ) -> Node {
        let (radio, inbound) = self.join(address).await;
        // Disjoint id ranges keep test traffic easy to tell apart.
        let first_id = address.as_bytes()[5].wrapping_mul(16);
        let router = Router::builder(radio.clone(), config)
            .registry(registry())
            .acceptor(acceptor)
            .ids(Arc::new(MessageIds::starting_at(first_id)))
            .build();
        router.start(inbound);
        Node { router, radio }
    }
}

/// Accepts every request and hands the connection to the test.
pub struct Forward(mpsc::UnboundedSender<Connection>);

impl Forward {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Connection>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }
}

#[async_trait]
impl ConnectionAcceptor for Forward {
    async fn on_incoming(&self, connection: Connection) -> bool {
        self.0.send(connection).is_ok()
    }
}

/// Takes its time deciding, then accepts.
pub struct Dawdle(pub Duration);

#[async_trait]
impl ConnectionAcceptor for Dawdle {
    async fn on_incoming(&self, _connection: Connection) -> bool {
        sleep(self.0).await;
        true
    }
}

/// Connect `a` to `b` for `app_id` and return both ends.
pub async fn pair(
    a: &Node,
    incoming: &mut mpsc::UnboundedReceiver<Connection>,
    b: MacAddress,
    app_id: AppId,
) -> (Connection, Connection) {
    let local = a.router.connect(b, app_id).await.expect("peer accepts");
    let remote = incoming.recv().await.expect("acceptor saw the request");
    (local, remote)
}

/// Let every task run until the simulated clock has moved by `d`.
pub async fn settle(d: Duration) {
    sleep(d).await;
}
