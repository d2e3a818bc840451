// Badge node: runs the badge link over UDP multicast with an echo application.

use anyhow::Context;
use async_trait::async_trait;
use badge_core::{AppPayload, MacAddress, PayloadRegistry};
use badge_node::config::{self, Config};
use badge_node::{Beacon, Connection, ConnectionAcceptor, Router, SendOutcome, UdpRadio};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Plain text chat payload.
#[derive(Debug, Serialize, Deserialize)]
struct Text {
    body: String,
}

impl AppPayload for Text {
    const KIND: &'static str = "text";
}

/// Accepts every connection and sends each payload straight back.
struct Echo;

#[async_trait]
impl ConnectionAcceptor for Echo {
    async fn on_incoming(&self, connection: Connection) -> bool {
        info!(peer = %connection.peer(), app_id = connection.app_id(), "echo session");
        tokio::spawn(async move {
            while let Some(message) = connection.receive().await {
                if let Ok(text) = message.decode::<Text>() {
                    info!(peer = %connection.peer(), "{}", text.body);
                }
                if connection.send_message(message).await != SendOutcome::Queued {
                    break;
                }
            }
            debug!(peer = %connection.peer(), "echo session over");
        });
        true
    }
}

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("badge-node {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("badge_node=info")),
        )
        .init();

    let cfg = config::load()?;
    let address = cfg.address()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, address))
}

async fn run(cfg: Config, address: MacAddress) -> anyhow::Result<()> {
    let (radio, inbound) = UdpRadio::open(address, cfg.radio_port)
        .await
        .with_context(|| format!("opening radio on UDP port {}", cfg.radio_port))?;
    info!(%address, name = %cfg.display_name, port = cfg.radio_port, "badge up");

    let router = Router::builder(radio, cfg.link.clone())
        .registry(PayloadRegistry::new().with::<Text>())
        .acceptor(Echo)
        .build();
    router.start(inbound);

    let beacon = Beacon::for_router(&router, &cfg.display_name);
    beacon.start();

    let mut updates = router.updates(None);
    let watcher = tokio::spawn(async move {
        while let Some(change) = updates.next().await {
            match change.latest {
                Some(peer) => info!(%peer, neighbors = change.neighbors, "neighbors changed"),
                None => info!("no neighbors in range"),
            }
        }
    });

    shutdown_signal().await?;
    info!("shutting down");
    beacon.stop();
    watcher.abort();
    router.shutdown().await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
