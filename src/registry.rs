//! Address & Port Registry (spec.md §4.2).
//!
//! Grounded on the teacher's channel-pool indexing in
//! `neutronium/src/net/endpoint.rs` (a free-list-backed slab plus a
//! `HashMap<SocketAddr, usize>` side index kept consistent with the pool),
//! generalized to the two independent indices spec.md calls for: a
//! port-only table for fast free-port probing, and a full-`addr` table for
//! demux, plus a secondary remote-`addr` table for pipes.

use hashbrown::{HashMap, HashSet};
use rand::Rng;

use crate::addr::{Addr, EPHEMERAL_PORT_MAX, EPHEMERAL_PORT_MIN};
use crate::error::{Result, TransportError};

/// Opaque handle to an [`crate::endpoint::Endpoint`], issued by the owning
/// [`crate::host::Host`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct EndpointId(u64);

/// Opaque handle to a [`crate::pipe::Pipe`], issued by the owning
/// [`crate::host::Host`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct PipeId(u64);

impl EndpointId {
    pub(crate) fn from_raw(raw: u64) -> EndpointId {
        EndpointId(raw)
    }
}

impl PipeId {
    pub(crate) fn from_raw(raw: u64) -> PipeId {
        PipeId(raw)
    }
}

/// Whoever owns a local conversation address: either an endpoint (listener
/// or dialer still mid-handshake) or an established pipe.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Owner {
    Endpoint(EndpointId),
    Pipe(PipeId),
}

/// Monotonic id allocator, separate from port allocation, so endpoints and
/// pipes get stable handles independent of their (reusable) port numbers.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    pub fn next_endpoint(&mut self) -> EndpointId {
        let id = self.next;
        self.next += 1;
        EndpointId(id)
    }

    pub fn next_pipe(&mut self) -> PipeId {
        let id = self.next;
        self.next += 1;
        PipeId(id)
    }
}

/// Address & Port Registry. One instance per Overlay Host.
#[derive(Default)]
pub struct Registry {
    /// Port-only table, for fast free-port probing.
    ports: HashSet<u32>,
    /// Full-address index, for demuxing inbound frames by local address.
    by_local: HashMap<Addr, Owner>,
    /// Secondary index of pipes by remote address.
    by_remote: HashMap<Addr, PipeId>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Allocates a free ephemeral port, starting at a randomized offset
    /// within `[EPHEMERAL_PORT_MIN, EPHEMERAL_PORT_MAX]` and probing forward
    /// (wrapping) until a free slot is found.
    pub fn alloc_ephemeral_port(&mut self) -> Result<u32> {
        let span = EPHEMERAL_PORT_MAX - EPHEMERAL_PORT_MIN + 1;
        let start = rand::thread_rng().gen_range(0..span);

        for offset in 0..span {
            let candidate = EPHEMERAL_PORT_MIN + (start + offset) % span;
            if !self.ports.contains(&candidate) {
                self.ports.insert(candidate);
                return Ok(candidate);
            }
        }
        Err(TransportError::AddressInUse)
    }

    /// Reserves an explicitly requested, non-zero port. Fails with
    /// `address-in-use` if already taken, static or ephemeral.
    pub fn reserve_port(&mut self, port: u32) -> Result<()> {
        debug_assert!(port != 0);
        if self.ports.contains(&port) {
            return Err(TransportError::AddressInUse);
        }
        self.ports.insert(port);
        Ok(())
    }

    /// Releases a port previously allocated or reserved. No-op if the port
    /// isn't currently held, which can happen when an endpoint surrenders
    /// its address to a newly created pipe (see spec.md §4.4's dialer
    /// conn-ack ingest).
    pub fn release_port(&mut self, port: u32) {
        self.ports.remove(&port);
    }

    pub fn port_in_use(&self, port: u32) -> bool {
        self.ports.contains(&port)
    }

    /// Indexes `addr` by its local side. Errs if another owner is already
    /// indexed there (callers are expected to have allocated/reserved the
    /// port first, so this should not normally fail).
    pub fn insert_local(&mut self, addr: Addr, owner: Owner) -> Result<()> {
        if self.by_local.contains_key(&addr) {
            return Err(TransportError::AddressInUse);
        }
        self.by_local.insert(addr, owner);
        Ok(())
    }

    pub fn remove_local(&mut self, addr: Addr) -> Option<Owner> {
        self.by_local.remove(&addr)
    }

    pub fn find_local(&self, addr: Addr) -> Option<Owner> {
        self.by_local.get(&addr).copied()
    }

    pub fn insert_remote(&mut self, addr: Addr, pipe: PipeId) {
        self.by_remote.insert(addr, pipe);
    }

    pub fn remove_remote(&mut self, addr: Addr) -> Option<PipeId> {
        self.by_remote.remove(&addr)
    }

    pub fn find_remote(&self, addr: Addr) -> Option<PipeId> {
        self.by_remote.get(&addr).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_allocation_stays_in_range_and_is_unique() {
        let mut reg = Registry::new();
        let mut seen = HashSet::new();
        for _ in 0..64 {
            let port = reg.alloc_ephemeral_port().unwrap();
            assert!(port >= EPHEMERAL_PORT_MIN && port <= EPHEMERAL_PORT_MAX);
            assert!(seen.insert(port), "port {:#x} allocated twice", port);
        }
    }

    #[test]
    fn explicit_reservation_conflicts() {
        let mut reg = Registry::new();
        reg.reserve_port(0x10).unwrap();
        assert!(matches!(
            reg.reserve_port(0x10),
            Err(TransportError::AddressInUse)
        ));
        reg.release_port(0x10);
        reg.reserve_port(0x10).unwrap();
    }

    #[test]
    fn local_index_round_trips() {
        let mut reg = Registry::new();
        let mut ids = IdAllocator::default();
        let ep = ids.next_endpoint();
        let addr = Addr::new(0, 0x800001);
        reg.insert_local(addr, Owner::Endpoint(ep)).unwrap();
        assert_eq!(reg.find_local(addr), Some(Owner::Endpoint(ep)));
        assert_eq!(reg.remove_local(addr), Some(Owner::Endpoint(ep)));
        assert_eq!(reg.find_local(addr), None);
    }

    #[test]
    fn remote_index_is_independent_of_local() {
        let mut reg = Registry::new();
        let mut ids = IdAllocator::default();
        let pipe = ids.next_pipe();
        let remote = Addr::new(0x1234, 5);
        reg.insert_remote(remote, pipe);
        assert_eq!(reg.find_remote(remote), Some(pipe));
        assert_eq!(reg.find_local(remote), None);
    }
}
