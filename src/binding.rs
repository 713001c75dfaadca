//! The contract towards the host transport, and a driver that runs the whole
//! protocol on one event loop.
//!
//! The host side owns the actual blob replication; this crate only needs to
//! hand it the packed bytes once per tick ([`HostBinding::publish`]) and to be
//! told about inbound blobs and peer lifecycle changes ([`HostEvent`]). The
//! protocol core is strictly single-threaded, so the driver multiplexes the
//! tick timer and the host event stream on one task instead of sharing state
//! across threads.

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error};

use crate::manager::{NetworkManager, PeerId};

/// What the host reports into the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    MasterChanged(PeerId),
    /// Another peer's blob changed; `data` is its full current content.
    BlobReceived { from: PeerId, data: Vec<u8> },
}

/// The host-side half of the transport: publishing the locally owned blob.
/// Called at most once per tick, just before the host synchronizes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostBinding {
    async fn publish(&mut self, blob: &[u8]) -> anyhow::Result<()>;
}

/// Drives a [`NetworkManager`] from a tick timer and a host event channel.
///
/// `run` multiplexes both sources with `select!`; since the manager is not
/// `Send`, the returned future is meant for a current-thread runtime (or a
/// `LocalSet`), which matches the protocol's single-threaded model.
pub struct TickDriver<B: HostBinding> {
    manager: NetworkManager,
    binding: B,
    events: mpsc::UnboundedReceiver<HostEvent>,
    tick: Duration,
}

impl<B: HostBinding> TickDriver<B> {
    pub fn new(
        manager: NetworkManager,
        binding: B,
        events: mpsc::UnboundedReceiver<HostEvent>,
        tick: Duration,
    ) -> TickDriver<B> {
        TickDriver { manager, binding, events, tick }
    }

    pub fn manager(&self) -> &NetworkManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut NetworkManager {
        &mut self.manager
    }

    pub fn apply_host_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::PeerJoined(peer) => self.manager.on_peer_joined(peer),
            HostEvent::PeerLeft(peer) => self.manager.on_peer_left(peer),
            HostEvent::MasterChanged(peer) => self.manager.on_master_changed(peer),
            HostEvent::BlobReceived { from, data } => self.manager.handle_packet(from, &data),
        }
    }

    /// Runs until the host event channel closes.
    pub async fn run(mut self) {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let blob = self.manager.prepare_send_stream().to_vec();
                    if !blob.is_empty() {
                        if let Err(e) = self.binding.publish(&blob).await {
                            // the packet stays buffered in the reliable rings,
                            // so the next tick retries everything unacked
                            error!("publishing the outgoing blob failed: {}", e);
                        }
                    }
                }
                event = self.events.recv() => {
                    match event {
                        Some(event) => self.apply_host_event(event),
                        None => {
                            debug!("host event channel closed - shutting down");
                            break;
                        }
                    }
                }
            }
        }
    }
}
