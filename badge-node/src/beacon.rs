//! Periodic presence announcement on the discovery address.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use badge_core::{encode_frame, Frame, MacAddress, Message, MessageIds, DISCOVERY_ADDRESS};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::router::Router;
use crate::sender::ReliableSender;

/// Longest display name put on air, in characters.
pub const MAX_NAME_CHARS: usize = 32;

struct Inner {
    sender: ReliableSender,
    ids: Arc<MessageIds>,
    name: String,
    interval: Duration,
    destination: MacAddress,
    /// `true` while emission is suspended.
    suspended: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the beacon task. Clones control the same beacon.
#[derive(Clone)]
pub struct Beacon {
    inner: Arc<Inner>,
}

impl Beacon {
    pub fn new(
        sender: ReliableSender,
        ids: Arc<MessageIds>,
        display_name: &str,
        interval: Duration,
    ) -> Self {
        let (suspended, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                sender,
                ids,
                name: display_name.chars().take(MAX_NAME_CHARS).collect(),
                interval,
                destination: DISCOVERY_ADDRESS,
                suspended,
                task: Mutex::new(None),
            }),
        }
    }

    /// Beacon sharing the router's sender, id counter and beacon interval.
    pub fn for_router(router: &Router, display_name: &str) -> Self {
        Self::new(
            router.sender().clone(),
            router.ids().clone(),
            display_name,
            router.config().beacon_interval(),
        )
    }

    pub fn display_name(&self) -> &str {
        &self.inner.name
    }

    /// Start announcing. Returns false if already running.
    pub fn start(&self) -> bool {
        let mut task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return false;
        }
        info!(name = %self.inner.name, interval = ?self.inner.interval, "beacon on");
        *task = Some(tokio::spawn(beacon_loop(
            self.inner.clone(),
            self.inner.suspended.subscribe(),
        )));
        true
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Pause or resume emission. A paused beacon finishes its current interval
    /// and then waits; resuming does not reset the period.
    pub fn suspend(&self, suspended: bool) {
        self.inner.suspended.send_replace(suspended);
    }

    pub fn is_suspended(&self) -> bool {
        *self.inner.suspended.borrow()
    }

    pub fn stop(&self) {
        if let Some(task) = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
            info!("beacon off");
        }
    }
}

async fn beacon_loop(inner: Arc<Inner>, mut suspended: watch::Receiver<bool>) {
    loop {
        let paused = *suspended.borrow_and_update();
        if paused {
            debug!("beacon suspended");
            if suspended.wait_for(|s| !*s).await.is_err() {
                return;
            }
            debug!("beacon resumed");
        }
        let beacon = Frame::new(
            inner.ids.next_id(),
            Message::Beacon {
                name: inner.name.clone(),
            },
        );
        match encode_frame(&beacon) {
            Ok(bytes) => {
                if let Err(e) = inner.sender.send_once(inner.destination, bytes).await {
                    warn!(error = %e, "beacon not sent");
                }
            }
            Err(e) => {
                error!(error = %e, "beacon does not fit in a packet");
                return;
            }
        }
        tokio::time::sleep(inner.interval).await;
    }
}
