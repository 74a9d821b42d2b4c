//! In-process loopback double for [`super::OverlayEngine`], grounded on the
//! teacher's `MockChannel` test fixture (`neutronium/src/net/buffer.rs`):
//! a configurable, in-memory stand-in for the real collaborator, used only
//! from tests so the rest of the engine can be exercised without a real
//! overlay network or real UDP sockets.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hashbrown::HashSet;

use super::{AddrFamily, OverlayEngine, OverlayEvent, StateObject, WireSend};
use crate::addr::{mac_to_node, Nwid};

/// Shared switch fabric for one simulated network of [`SimEngine`]s. Frames
/// sent by one node's `virtual_send` land directly in the destination
/// node's event queue, keyed by the node id recovered from the destination
/// MAC — mirroring how a real L2 overlay demultiplexes by MAC without this
/// crate needing any real socket I/O.
pub struct SimNetwork {
    inboxes: Mutex<HashMap<u64, VecDeque<OverlayEvent>>>,
}

impl SimNetwork {
    pub fn new() -> Arc<SimNetwork> {
        Arc::new(SimNetwork {
            inboxes: Mutex::new(HashMap::new()),
        })
    }

    fn register(&self, node_id: u64) {
        self.inboxes.lock().unwrap().entry(node_id).or_default();
    }

    fn deliver(&self, node_id: u64, event: OverlayEvent) {
        self.inboxes
            .lock()
            .unwrap()
            .entry(node_id)
            .or_default()
            .push_back(event);
    }

    fn drain(&self, node_id: u64) -> Vec<OverlayEvent> {
        self.inboxes
            .lock()
            .unwrap()
            .get_mut(&node_id)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }
}

/// One simulated overlay participant, bound to a fixed node id and MTU.
pub struct SimEngine {
    network: Arc<SimNetwork>,
    node_id: u64,
    mtu: u32,
    joined: HashSet<Nwid>,
}

impl SimEngine {
    pub fn new(network: Arc<SimNetwork>, node_id: u64, mtu: u32) -> SimEngine {
        network.register(node_id);
        SimEngine {
            network,
            node_id,
            mtu,
            joined: HashSet::new(),
        }
    }
}

impl OverlayEngine for SimEngine {
    fn node_id(&self) -> Option<u64> {
        Some(self.node_id)
    }

    fn join_network(&mut self, nwid: Nwid) {
        if self.joined.insert(nwid) {
            self.network.deliver(
                self.node_id,
                OverlayEvent::VirtualConfig {
                    nwid,
                    up: true,
                    mtu: self.mtu,
                },
            );
        }
    }

    fn leave_network(&mut self, nwid: Nwid) {
        self.joined.remove(&nwid);
    }

    fn virtual_send(
        &mut self,
        nwid: Nwid,
        src_mac: [u8; 6],
        dst_mac: [u8; 6],
        ethertype: u16,
        payload: &[u8],
    ) {
        let dest_node = mac_to_node(dst_mac, nwid);
        self.network.deliver(
            dest_node,
            OverlayEvent::VirtualRecv {
                nwid,
                src_mac,
                dst_mac,
                ethertype,
                payload: payload.to_vec(),
            },
        );
    }

    fn wire_recv(&mut self, _from: SocketAddr, _bytes: &[u8]) {
        // The simulated network bypasses real UDP entirely: virtual_send
        // delivers straight into the destination's event queue.
    }

    fn state_get(&mut self, _object: StateObject) -> Option<Vec<u8>> {
        None
    }

    fn do_periodic_work(&mut self, now: Instant) -> Instant {
        now + Duration::from_secs(3600)
    }

    fn drain_events(&mut self) -> Vec<OverlayEvent> {
        self.network.drain(self.node_id)
    }
}

/// No-op `wire-send` collaborator: the simulated network never touches a
/// real socket, so sends always "succeed" without doing anything.
pub struct SimWireSend;

impl WireSend for SimWireSend {
    fn send_datagram(&self, _family: AddrFamily, _to: SocketAddr, _bytes: &[u8]) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_send_delivers_to_destination_node() {
        let net = SimNetwork::new();
        let mut a = SimEngine::new(net.clone(), 1, 1500);
        let mut b = SimEngine::new(net.clone(), 2, 1500);

        let nwid: Nwid = 0xdead_beef;
        let dst_mac = crate::addr::node_to_mac(2, nwid);
        let src_mac = crate::addr::node_to_mac(1, nwid);

        a.virtual_send(nwid, src_mac, dst_mac, 0x0901, b"hello");
        assert!(a.drain_events().is_empty());

        let events = b.drain_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            OverlayEvent::VirtualRecv { payload, .. } => assert_eq!(payload, b"hello"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn join_network_emits_config_up_once() {
        let net = SimNetwork::new();
        let mut a = SimEngine::new(net, 1, 1500);
        a.join_network(42);
        a.join_network(42);
        let events = a.drain_events();
        assert_eq!(events.len(), 1);
    }
}
