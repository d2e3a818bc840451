mod common;

use badge_core::{AppMessage, Frame, LinkConfig, Message, Payload};
use badge_node::AcceptAll;
use common::*;
use tokio::time::{timeout, Duration};

fn chat(app_id: u16, id: u8, text: &str) -> Frame {
    Frame::new(
        id,
        Message::Application {
            app_id,
            payload: Payload::App(AppMessage::encode(&Chat::new(text)).unwrap()),
        },
    )
}

#[tokio::test(start_paused = true)]
async fn duplicate_is_delivered_once_and_acked_twice() {
    let air = SimulatedAir::new();
    let (acceptor, mut incoming) = Forward::channel();
    let a = air.node(A, AcceptAll).await;
    let _b = air.node(B, acceptor).await;
    let (_local, remote) = pair(&a, &mut incoming, B, 7).await;

    let frame = chat(7, 3, "once");
    air.inject(A, B, &frame).await;
    air.inject(A, B, &frame).await;

    let got = remote.receive().await.expect("first copy delivered");
    assert_eq!(got.decode::<Chat>().unwrap(), Chat::new("once"));
    assert!(timeout(Duration::from_secs(2), remote.receive()).await.is_err());
    assert_eq!(air.acks_from(B, A, 3).await, 2);
}

#[tokio::test(start_paused = true)]
async fn arrival_order_is_kept() {
    let air = SimulatedAir::new();
    let (acceptor, mut incoming) = Forward::channel();
    let a = air.node(A, AcceptAll).await;
    let _b = air.node(B, acceptor).await;
    let (_local, remote) = pair(&a, &mut incoming, B, 7).await;

    for (id, text) in [(1, "one"), (2, "two"), (3, "three")] {
        air.inject(A, B, &chat(7, id, text)).await;
    }
    for expected in ["one", "two", "three"] {
        let got = remote.receive().await.unwrap();
        assert_eq!(got.decode::<Chat>().unwrap().text, expected);
    }
}

#[tokio::test(start_paused = true)]
async fn payload_from_unbound_peer_is_dropped() {
    let air = SimulatedAir::new();
    let (acceptor, mut incoming) = Forward::channel();
    let a = air.node(A, AcceptAll).await;
    let _b = air.node(B, acceptor).await;
    let _c = air.node(C, AcceptAll).await;
    let (_local, remote) = pair(&a, &mut incoming, B, 7).await;

    air.inject(C, B, &chat(7, 4, "intruder")).await;
    air.inject(C, B, &chat(8, 5, "nobody listens")).await;
    assert!(timeout(Duration::from_secs(2), remote.receive()).await.is_err());
    // Still acked, so the sender stops retrying.
    assert_eq!(air.acks_from(B, C, 4).await, 1);
    assert_eq!(air.acks_from(B, C, 5).await, 1);
}

#[tokio::test(start_paused = true)]
async fn full_inbound_queue_drops_excess() {
    let air = SimulatedAir::new();
    let (acceptor, mut incoming) = Forward::channel();
    let a = air.node(A, AcceptAll).await;
    let _b = air.node(B, acceptor).await;
    let (_local, remote) = pair(&a, &mut incoming, B, 7).await;

    let queue = LinkConfig::default().inbound_queue as u8;
    for id in 0..queue + 2 {
        air.inject(A, B, &chat(7, id, &format!("m{id}"))).await;
    }
    settle(Duration::from_millis(10)).await;
    for id in 0..queue {
        let got = remote.receive().await.unwrap();
        assert_eq!(got.decode::<Chat>().unwrap().text, format!("m{id}"));
    }
    assert!(timeout(Duration::from_secs(1), remote.receive()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn weak_signal_is_ignored() {
    let air = SimulatedAir::new();
    let b = air.node(B, AcceptAll).await;

    air.set_signal(C, -80).await;
    air.inject(C, B, &Frame::new(1, Message::Beacon { name: "far".into() })).await;
    air.set_signal(D, -70).await;
    air.inject(D, B, &Frame::new(1, Message::Beacon { name: "edge".into() })).await;
    settle(Duration::from_millis(10)).await;

    let neighbors = b.router.neighbors().await;
    assert_eq!(neighbors.len(), 1);
    assert_eq!(neighbors[0].address, D);
    assert_eq!(neighbors[0].signal_strength, -70);
}

#[tokio::test(start_paused = true)]
async fn malformed_packet_does_not_stop_the_router() {
    let air = SimulatedAir::new();
    let b = air.node(B, AcceptAll).await;

    air.transmit(C, B, &[0xff, 0x01, 0x02]).await;
    air.transmit(C, B, &[]).await;
    air.inject(C, B, &Frame::new(1, Message::Beacon { name: "Cleo".into() })).await;
    settle(Duration::from_millis(10)).await;

    let latest = b.router.latest_neighbor().await.expect("beacon after garbage");
    assert_eq!(latest.address, C);
    assert_eq!(latest.display_name, "Cleo");
}
