//! Utilities for testing code built on this crate: an event-recording
//! listener and a deterministic in-memory multi-peer network.
//!
//! These are used for testing the protocol itself, but they are exported as
//! regular (non-`#[cfg(test)]`) code so applications can drive their own
//! protocol logic through a simulated session too.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::listener::NetworkListener;
use crate::manager::{NetConfig, NetworkManager, PeerId};

/// Everything a [`RecordingListener`] observed, in dispatch order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedEvent {
    Init,
    Connected(PeerId),
    Disconnected(PeerId),
    PrepareSend,
    Received {
        sender: PeerId,
        data: Vec<u8>,
        message_id: Option<u16>,
    },
    SendComplete {
        message_id: u16,
        success: bool,
    },
}

/// A listener that just records every callback for later assertions.
#[derive(Default)]
pub struct RecordingListener {
    pub events: Vec<RecordedEvent>,
}

impl RecordingListener {
    pub fn new_handle() -> Rc<RefCell<RecordingListener>> {
        Rc::new(RefCell::new(RecordingListener::default()))
    }

    /// The received messages, in delivery order.
    pub fn received(&self) -> Vec<(PeerId, Vec<u8>, Option<u16>)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                RecordedEvent::Received { sender, data, message_id } => {
                    Some((*sender, data.clone(), *message_id))
                }
                _ => None,
            })
            .collect()
    }

    /// The send-complete notifications, in completion order.
    pub fn completions(&self) -> Vec<(u16, bool)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                RecordedEvent::SendComplete { message_id, success } => {
                    Some((*message_id, *success))
                }
                _ => None,
            })
            .collect()
    }
}

impl NetworkListener for RecordingListener {
    fn on_init(&mut self, _net: &mut NetworkManager) {
        self.events.push(RecordedEvent::Init);
    }

    fn on_peer_connected(&mut self, _net: &mut NetworkManager, peer: PeerId) {
        self.events.push(RecordedEvent::Connected(peer));
    }

    fn on_peer_disconnected(&mut self, _net: &mut NetworkManager, peer: PeerId) {
        self.events.push(RecordedEvent::Disconnected(peer));
    }

    fn on_prepare_send(&mut self, _net: &mut NetworkManager) {
        self.events.push(RecordedEvent::PrepareSend);
    }

    fn on_received(
        &mut self,
        _net: &mut NetworkManager,
        sender: PeerId,
        data: &[u8],
        message_id: Option<u16>,
    ) {
        self.events.push(RecordedEvent::Received {
            sender,
            data: data.to_vec(),
            message_id,
        });
    }

    fn on_send_complete(&mut self, _net: &mut NetworkManager, message_id: u16, success: bool) {
        self.events.push(RecordedEvent::SendComplete { message_id, success });
    }
}

struct SimPeer {
    id: PeerId,
    manager: NetworkManager,
    listener: Rc<RefCell<RecordingListener>>,
}

/// Decides whether the blob published by `from` this tick is lost on its way
/// to `to`. Deterministic by construction: same schedule, same run.
pub type LossSchedule = Box<dyn FnMut(u64, PeerId, PeerId) -> bool>;

/// A deterministic in-memory rendition of the host transport: every peer owns
/// one blob per tick, published simultaneously and broadcast to all other
/// peers, with optional per-link loss.
pub struct SimNet {
    peers: Vec<SimPeer>,
    index: FxHashMap<PeerId, usize>,
    loss: Option<LossSchedule>,
    tick: u64,
}

impl SimNet {
    /// Creates one manager per peer id and joins every peer on every manager.
    /// The first id is the master.
    pub fn new(total_connections: usize, peer_ids: &[u32]) -> SimNet {
        let master = PeerId(peer_ids[0]);
        let mut peers = Vec::new();
        let mut index = FxHashMap::default();

        for &raw_id in peer_ids {
            let id = PeerId(raw_id);
            let mut config = NetConfig::new(id, master);
            config.total_connections = total_connections;
            let mut manager = NetworkManager::new(config);
            let listener = RecordingListener::new_handle();
            manager.add_listener(listener.clone());
            index.insert(id, peers.len());
            peers.push(SimPeer { id, manager, listener });
        }

        let mut net = SimNet { peers, index, loss: None, tick: 0 };
        for &raw_id in peer_ids {
            net.broadcast_join(PeerId(raw_id));
        }
        net
    }

    pub fn with_loss(mut self, loss: impl FnMut(u64, PeerId, PeerId) -> bool + 'static) -> SimNet {
        self.loss = Some(Box::new(loss));
        self
    }

    pub fn manager(&mut self, peer: u32) -> &mut NetworkManager {
        let index = self.index[&PeerId(peer)];
        &mut self.peers[index].manager
    }

    pub fn events(&self, peer: u32) -> Vec<RecordedEvent> {
        let index = self.index[&PeerId(peer)];
        self.peers[index].listener.borrow().events.clone()
    }

    pub fn received(&self, peer: u32) -> Vec<(PeerId, Vec<u8>, Option<u16>)> {
        let index = self.index[&PeerId(peer)];
        self.peers[index].listener.borrow().received()
    }

    pub fn completions(&self, peer: u32) -> Vec<(u16, bool)> {
        let index = self.index[&PeerId(peer)];
        self.peers[index].listener.borrow().completions()
    }

    /// One transport tick: all peers pack their blobs simultaneously, then
    /// every blob is delivered to every other peer unless the loss schedule
    /// drops that link.
    pub fn run_tick(&mut self) {
        let blobs: Vec<(PeerId, Vec<u8>)> = self
            .peers
            .iter_mut()
            .map(|peer| (peer.id, peer.manager.prepare_send_stream().to_vec()))
            .collect();

        for (from, blob) in &blobs {
            if blob.is_empty() {
                continue;
            }
            for i in 0..self.peers.len() {
                let to = self.peers[i].id;
                if to == *from {
                    continue;
                }
                if let Some(loss) = self.loss.as_mut() {
                    if loss(self.tick, *from, to) {
                        continue;
                    }
                }
                self.peers[i].manager.handle_packet(*from, blob);
            }
        }
        self.tick += 1;
    }

    pub fn run_ticks(&mut self, count: usize) {
        for _ in 0..count {
            self.run_tick();
        }
    }

    /// The peer disappears from the session: its manager is dropped and all
    /// remaining managers observe the departure.
    pub fn peer_leaves(&mut self, peer: u32) {
        let id = PeerId(peer);
        let index = self.index.remove(&id).expect("unknown peer");
        self.peers.remove(index);
        for slot in self.index.values_mut() {
            if *slot > index {
                *slot -= 1;
            }
        }
        for peer in self.peers.iter_mut() {
            peer.manager.on_peer_left(id);
        }
    }

    /// The host elected a new master.
    pub fn master_changes(&mut self, new_master: u32) {
        for peer in self.peers.iter_mut() {
            peer.manager.on_master_changed(PeerId(new_master));
        }
    }

    fn broadcast_join(&mut self, joined: PeerId) {
        for peer in self.peers.iter_mut() {
            peer.manager.on_peer_joined(joined);
        }
    }
}
