//! The overlay library's trait surface (spec.md §4.1, §6).
//!
//! The overlay library itself — node lifecycle, cryptography, peer
//! discovery, path selection — is explicitly out of scope (spec.md §1); this
//! module only defines the interface the Overlay Host plugs into. A
//! production build wires a real FFI binding behind [`OverlayEngine`]; tests
//! and examples use [`sim::SimEngine`], grounded on the teacher's
//! `MockChannel` fixture in `neutronium/src/net/buffer.rs`.

pub mod sim;

use std::net::SocketAddr;
use std::time::Instant;

use crate::addr::Nwid;

/// The small, enumerated set of state objects the overlay asks the host to
/// persist (spec.md §4.1, §6).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum StateObject {
    IdentityPublic,
    IdentitySecret,
    Planet,
}

impl StateObject {
    /// File name used when a home directory is configured (spec.md §6).
    pub fn file_name(self) -> &'static str {
        match self {
            StateObject::IdentityPublic => "identity.public",
            StateObject::IdentitySecret => "identity.secret",
            StateObject::Planet => "planet",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AddrFamily {
    V4,
    V6,
}

/// One event the overlay library delivers to the adapter. In the real
/// collaborator these arrive as direct, synchronous callback invocations
/// with the adapter's global lock already held (spec.md §5's
/// callback-holds-lock discipline). This crate models them as a drained
/// event queue: [`Host`](crate::host::Host) calls into the engine under its
/// own lock, then drains whatever events that call produced, which has the
/// same "lock already held" property without needing the engine to call
/// back into `Host` through a trait object.
#[derive(Debug, Clone)]
pub enum OverlayEvent {
    VirtualRecv {
        nwid: Nwid,
        src_mac: [u8; 6],
        dst_mac: [u8; 6],
        ethertype: u16,
        payload: Vec<u8>,
    },
    VirtualConfig {
        nwid: Nwid,
        up: bool,
        mtu: u32,
    },
    StatePut {
        object: StateObject,
        data: Option<Vec<u8>>,
    },
    Event(String),
}

/// The overlay library's surface, as consumed by the Overlay Host.
pub trait OverlayEngine: Send {
    /// This host's 40-bit node id. `None` until the overlay has assigned one.
    fn node_id(&self) -> Option<u64>;

    fn join_network(&mut self, nwid: Nwid);

    fn leave_network(&mut self, nwid: Nwid);

    /// Hands a fully framed Ethernet payload to the overlay for virtual
    /// transmission. Non-blocking; returns no completion. Failures inside
    /// the library are recorded but not surfaced (spec.md §4.1).
    fn virtual_send(
        &mut self,
        nwid: Nwid,
        src_mac: [u8; 6],
        dst_mac: [u8; 6],
        ethertype: u16,
        payload: &[u8],
    );

    /// Feeds one received UDP datagram into the overlay for decrypt/demux.
    fn wire_recv(&mut self, from: SocketAddr, bytes: &[u8]);

    /// Answers a synchronous `state-get` request (spec.md §6).
    fn state_get(&mut self, object: StateObject) -> Option<Vec<u8>>;

    /// Runs the overlay's periodic background work and returns the next
    /// requested wake time.
    fn do_periodic_work(&mut self, now: Instant) -> Instant;

    /// Drains events produced by the calls above.
    fn drain_events(&mut self) -> Vec<OverlayEvent>;
}

/// The UDP send collaborator (spec.md §4.1, §6 `wire-send`), kept as a
/// trait so [`Host`](crate::host::Host) doesn't depend on a concrete socket
/// type.
pub trait WireSend: Send {
    fn send_datagram(&self, family: AddrFamily, to: SocketAddr, bytes: &[u8]) -> std::io::Result<()>;
}
