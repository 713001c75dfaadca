//! The application-facing event contract.

use crate::manager::{NetworkManager, PeerId};

/// Callbacks a protocol user registers with the [`NetworkManager`]. All
/// methods default to doing nothing, so implementors only write out the events
/// they care about.
///
/// Every callback receives the manager itself, so staging data from inside
/// `on_prepare_send` or answering a message from inside `on_received` needs no
/// extra plumbing. Dispatch is re-entrancy safe: events raised from inside a
/// callback are queued and delivered after the current one returns.
pub trait NetworkListener {
    /// The local and master connections are both established; sending is
    /// possible from now on. Fires exactly once.
    fn on_init(&mut self, net: &mut NetworkManager) {
        let _ = net;
    }

    /// Another peer is bound to a connection slot and ready to receive.
    fn on_peer_connected(&mut self, net: &mut NetworkManager, peer: PeerId) {
        let _ = (net, peer);
    }

    /// A peer left and its connection slot has been released.
    fn on_peer_disconnected(&mut self, net: &mut NetworkManager, peer: PeerId) {
        let _ = (net, peer);
    }

    /// The next outgoing packet is about to be packed; anything sent from
    /// here still participates in it.
    fn on_prepare_send(&mut self, net: &mut NetworkManager) {
        let _ = net;
    }

    /// A message addressed to this peer was delivered. `message_id` is absent
    /// for unreliable messages, which carry no id on the wire.
    fn on_received(
        &mut self,
        net: &mut NetworkManager,
        sender: PeerId,
        data: &[u8],
        message_id: Option<u16>,
    ) {
        let _ = (net, sender, data, message_id);
    }

    /// A previously buffered message finished: acknowledged by every addressed
    /// peer (`success`), or failed by cancellation, peer departure or master
    /// hand-off.
    fn on_send_complete(&mut self, net: &mut NetworkManager, message_id: u16, success: bool) {
        let _ = (net, message_id, success);
    }
}
