//! Three peers on an in-process loopback transport: the master broadcasts a
//! few sequenced text lines, everyone prints what arrives.
//!
//! Run with `cargo run --example loopback`.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use blobnet::{
    HostBinding, HostEvent, NetConfig, NetworkListener, NetworkManager, PeerId, Reliability,
    TickDriver, WireRead, WireWrite,
};
use tokio::sync::mpsc;
use tokio::task::LocalSet;

/// Forwards every published blob to all other peers' event channels, the way
/// the host runtime broadcasts a rewritten sync blob.
struct LoopbackBinding {
    own: PeerId,
    peers: Vec<(PeerId, mpsc::UnboundedSender<HostEvent>)>,
}

#[async_trait]
impl HostBinding for LoopbackBinding {
    async fn publish(&mut self, blob: &[u8]) -> anyhow::Result<()> {
        for (peer, tx) in &self.peers {
            if *peer != self.own {
                tx.send(HostEvent::BlobReceived { from: self.own, data: blob.to_vec() })?;
            }
        }
        Ok(())
    }
}

struct ChatPeer {
    /// lines still to broadcast; only the master's list is non-empty
    outbox: Vec<String>,
}

impl NetworkListener for ChatPeer {
    fn on_init(&mut self, net: &mut NetworkManager) {
        println!("[{}] session ready", net.local_peer());
    }

    fn on_peer_connected(&mut self, net: &mut NetworkManager, peer: PeerId) {
        println!("[{}] {} connected", net.local_peer(), peer);
    }

    fn on_prepare_send(&mut self, net: &mut NetworkManager) {
        if !net.has_other_connections() {
            return;
        }
        if let Some(line) = self.outbox.first() {
            let mut payload = Vec::new();
            payload.put_var_utf8(line);
            if net.send_all(Reliability::ReliableSequenced, &payload).is_some() {
                self.outbox.remove(0);
            }
        }
    }

    fn on_received(
        &mut self,
        net: &mut NetworkManager,
        sender: PeerId,
        data: &[u8],
        _message_id: Option<u16>,
    ) {
        let mut data = data;
        match data.try_get_var_utf8() {
            Ok(line) => println!("[{}] {} says: {}", net.local_peer(), sender, line),
            Err(e) => eprintln!("[{}] undecodable message: {}", net.local_peer(), e),
        }
    }

    fn on_send_complete(&mut self, net: &mut NetworkManager, message_id: u16, success: bool) {
        println!(
            "[{}] message {} {}",
            net.local_peer(),
            message_id,
            if success { "acknowledged by everyone" } else { "failed" }
        );
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::WARN).init();

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let local = LocalSet::new();

    runtime.block_on(local.run_until(async {
        let peer_ids = [PeerId(1), PeerId(2), PeerId(3)];
        let master = peer_ids[0];

        let mut txs = Vec::new();
        let mut rxs = Vec::new();
        for &peer in &peer_ids {
            let (tx, rx) = mpsc::unbounded_channel();
            txs.push((peer, tx));
            rxs.push(rx);
        }

        for (&peer, rx) in peer_ids.iter().zip(rxs) {
            let mut manager = NetworkManager::new(NetConfig::new(peer, master));
            let outbox = if peer == master {
                vec!["hello".to_string(), "from".to_string(), "the master".to_string()]
            } else {
                Vec::new()
            };
            manager.add_listener(Rc::new(RefCell::new(ChatPeer { outbox })));

            // everyone joins everyone, in the same order
            for &joined in &peer_ids {
                manager.on_peer_joined(joined);
            }

            let binding = LoopbackBinding { own: peer, peers: txs.clone() };
            let driver = TickDriver::new(manager, binding, rx, Duration::from_millis(50));
            tokio::task::spawn_local(driver.run());
        }

        tokio::time::sleep(Duration::from_millis(600)).await;
        Ok(())
    }))
}
