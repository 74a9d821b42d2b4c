//! Overlay Host (spec.md §4.1) and the dispatch glue that ties the Endpoint
//! and Pipe state machines together under spec.md §5's single global lock.
//!
//! Grounded on `neutronium/src/net/endpoint.rs`'s `Endpoint::sync(now)` loop
//! (one tick drains accepts, handshakes, and keepalives under a shared
//! `Poll`), regeneralized from mio readiness polling to the thread +
//! `Mutex`/`Condvar` model spec.md §5 mandates, and on `flux::logging`'s
//! root-logger-plus-child-logger pattern.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use hashbrown::HashMap;
use indexmap::IndexMap;
use slog::{debug, o, trace, warn, Logger};

use crate::addr::{mac_to_node, node_to_mac, Addr, Nwid};
use crate::codec::{self, Frame, ETHERTYPE};
use crate::endpoint::{BacklogEntry, Endpoint, EndpointState, Mode, RetryDecision};
use crate::error::{Result, TransportError, WireErrorCode};
use crate::op::{self, Op};
use crate::overlay::{OverlayEngine, OverlayEvent, StateObject, WireSend};
use crate::persistence::Store;
use crate::pipe::Pipe;
use crate::reassembly::IngestOutcome;
use crate::registry::{EndpointId, IdAllocator, Owner, PipeId, Registry};
use crate::time::monotonic_now;

/// Everything the Overlay Host owns, guarded by [`Host`]'s single lock.
pub struct HostInner {
    overlay: Box<dyn OverlayEngine>,
    wire: Box<dyn WireSend>,
    store: Store,
    registry: Registry,
    ids: IdAllocator,
    endpoints: IndexMap<EndpointId, Endpoint>,
    pipes: IndexMap<PipeId, Pipe>,
    mtu_by_nwid: HashMap<Nwid, u32>,
    next_wake: Instant,
    closed: bool,
    log: Logger,
}

impl HostInner {
    fn own_node(&self) -> Result<u64> {
        self.overlay
            .node_id()
            .ok_or(TransportError::Internal("overlay has not assigned a node id yet"))
    }

    fn send_frame(&mut self, nwid: Nwid, local_addr: Addr, remote_addr: Addr, frame: Frame) {
        let mtu = self.mtu_for(nwid);
        let bytes = match codec::encode_bounded(&frame, mtu as usize) {
            Some(bytes) => bytes,
            None => {
                warn!(self.log, "dropping outgoing frame larger than negotiated mtu"; "nwid" => nwid, "mtu" => mtu);
                return;
            }
        };
        let src_mac = node_to_mac(local_addr.node(), nwid);
        let dst_mac = node_to_mac(remote_addr.node(), nwid);
        trace!(self.log, "send_frame"; "nwid" => nwid, "local" => local_addr.to_string(), "remote" => remote_addr.to_string());
        self.overlay
            .virtual_send(nwid, src_mac, dst_mac, ETHERTYPE, &bytes);
    }

    fn send_error(&mut self, nwid: Nwid, local_addr: Addr, remote_addr: Addr, code: WireErrorCode) {
        let frame = Frame::Error {
            dest_port: remote_addr.port(),
            src_port: local_addr.port(),
            code: code as u8,
            message: code.message().to_string(),
        };
        self.send_frame(nwid, local_addr, remote_addr, frame);
    }

    fn mtu_for(&self, nwid: Nwid) -> u32 {
        self.mtu_by_nwid.get(&nwid).copied().unwrap_or(1500)
    }

    fn request_wake(&mut self, at: Instant) {
        if at < self.next_wake {
            self.next_wake = at;
        }
    }

    // ---- dispatch -------------------------------------------------------

    fn dispatch(&mut self, event: OverlayEvent) {
        match event {
            OverlayEvent::VirtualRecv {
                nwid,
                src_mac,
                dst_mac,
                ethertype,
                payload,
            } => self.dispatch_virtual_recv(nwid, src_mac, dst_mac, ethertype, &payload),
            OverlayEvent::VirtualConfig { nwid, up, mtu } => {
                self.dispatch_virtual_config(nwid, up, mtu)
            }
            OverlayEvent::StatePut { object, data } => {
                if let Err(e) = self.store.put(object, data.as_deref()) {
                    warn!(self.log, "state-put failed"; "error" => %e);
                }
            }
            OverlayEvent::Event(message) => {
                debug!(self.log, "overlay event"; "message" => message);
            }
        }
    }

    fn dispatch_virtual_config(&mut self, nwid: Nwid, up: bool, mtu: u32) {
        debug!(self.log, "virtual-config"; "nwid" => nwid, "up" => up, "mtu" => mtu);
        if up {
            self.mtu_by_nwid.insert(nwid, mtu);
        }
        if !up {
            return;
        }
        // Re-emit conn-req for any dialer with a pending connect op on this
        // network (spec.md §6 virtual-config: "network became usable").
        let now = monotonic_now();
        let ids: Vec<EndpointId> = self
            .endpoints
            .iter()
            .filter(|(_, ep)| ep.nwid == nwid && ep.mode == Mode::Dial && ep.creq_try > 0)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.reemit_conn_req(id, now);
        }
    }

    fn reemit_conn_req(&mut self, endpoint_id: EndpointId, now: Instant) {
        let (nwid, local_addr, remote_addr, proto) = {
            let ep = match self.endpoints.get(&endpoint_id) {
                Some(ep) => ep,
                None => return,
            };
            (ep.nwid, ep.local_addr, ep.remote_addr, ep.proto)
        };
        let frame = Frame::ConnReq {
            dest_port: remote_addr.port(),
            src_port: local_addr.port(),
            proto,
        };
        self.send_frame(nwid, local_addr, remote_addr, frame);
        trace!(self.log, "re-emitted conn-req"; "endpoint" => ?endpoint_id, "at" => ?now);
    }

    fn dispatch_virtual_recv(
        &mut self,
        nwid: Nwid,
        src_mac: [u8; 6],
        dst_mac: [u8; 6],
        ethertype: u16,
        payload: &[u8],
    ) {
        let frame = match codec::decode(ethertype, payload) {
            Some(frame) => frame,
            None => {
                self.handle_undecodable(nwid, dst_mac, src_mac, payload);
                return;
            }
        };

        let own_node = match self.own_node() {
            Ok(n) => n,
            Err(_) => return,
        };
        let local_addr = Addr::new(own_node, frame.dest_port());
        let remote_node = mac_to_node(src_mac, nwid);
        let remote_addr = Addr::new(remote_node, frame.src_port());

        match frame {
            Frame::ConnReq { proto, .. } => {
                self.on_conn_req(nwid, local_addr, remote_addr, proto)
            }
            Frame::ConnAck { proto, .. } => {
                self.on_conn_ack(nwid, local_addr, remote_addr, proto)
            }
            Frame::Data {
                more,
                msg_id,
                frag_size,
                frag_no,
                n_frags,
                payload,
                ..
            } => self.on_data(nwid, local_addr, remote_addr, more, msg_id, frag_size, frag_no, n_frags, &payload),
            Frame::DiscReq { .. } => self.on_disc_req(remote_addr),
            Frame::PingReq { .. } => self.on_ping_req(nwid, local_addr, remote_addr),
            Frame::PingAck { .. } => self.on_ping_ack(remote_addr),
            Frame::Error { code, .. } => self.on_error(remote_addr, code),
        }
    }

    /// A frame that failed codec validation. Per spec.md §4.3 this is
    /// always a silent drop at the codec layer, *except* a length-invalid
    /// `data`/`data-more` frame addressed to an established pipe, which
    /// must close that pipe with a protocol error.
    fn handle_undecodable(&mut self, nwid: Nwid, dst_mac: [u8; 6], src_mac: [u8; 6], payload: &[u8]) {
        let (opcode, dest_port, src_port) = match codec::peek_header(payload) {
            Some(h) => h,
            None => return,
        };
        if !opcode.is_data() {
            return;
        }
        let own_node = match self.own_node() {
            Ok(n) => n,
            Err(_) => return,
        };
        let local_node = mac_to_node(dst_mac, nwid);
        if local_node != own_node {
            return;
        }
        let local_addr = Addr::new(own_node, dest_port);
        let remote_addr = Addr::new(mac_to_node(src_mac, nwid), src_port);
        if let Some(Owner::Pipe(pipe_id)) = self.registry.find_local(local_addr) {
            self.teardown_pipe(pipe_id, nwid, local_addr, remote_addr, true);
        }
    }

    fn on_conn_req(&mut self, nwid: Nwid, local_addr: Addr, remote_addr: Addr, proto: u16) {
        if let Some(pipe_id) = self.registry.find_remote(remote_addr) {
            // Lost-ack retransmission: a pipe already exists, re-send ack.
            if let Some(pipe) = self.pipes.get(&pipe_id) {
                let frame = Frame::ConnAck {
                    dest_port: remote_addr.port(),
                    src_port: pipe.local_addr.port(),
                    proto: pipe.peer_proto,
                };
                let local = pipe.local_addr;
                self.send_frame(nwid, local, remote_addr, frame);
            }
            return;
        }

        let owner = self.registry.find_local(local_addr);
        let endpoint_id = match owner {
            Some(Owner::Endpoint(id)) => id,
            _ => {
                self.send_error(nwid, local_addr, remote_addr, WireErrorCode::Refused);
                return;
            }
        };

        let now = monotonic_now();
        let full = {
            let ep = match self.endpoints.get_mut(&endpoint_id) {
                Some(ep) => ep,
                None => return,
            };
            if !ep.is_listener() {
                self.send_error(nwid, local_addr, remote_addr, WireErrorCode::Refused);
                return;
            }
            if ep.backlog_contains(remote_addr) {
                return; // duplicate request, drop silently
            }
            let pushed = ep.backlog_push(BacklogEntry {
                expire_time: now + crate::endpoint::LISTEN_EXPIRE,
                remote_addr,
                peer_proto: proto,
            });
            !pushed
        };
        if full {
            return;
        }
        self.run_accept_drain(endpoint_id, nwid);
    }

    fn run_accept_drain(&mut self, endpoint_id: EndpointId, nwid: Nwid) {
        loop {
            let now = monotonic_now();
            let drained = match self.endpoints.get_mut(&endpoint_id) {
                Some(ep) => ep.try_accept_drain(now),
                None => None,
            };
            let (entry, waiter) = match drained {
                Some(v) => v,
                None => break,
            };

            let own_node = match self.own_node() {
                Ok(n) => n,
                Err(_) => return,
            };
            let ephemeral_port = match self.registry.alloc_ephemeral_port() {
                Ok(p) => p,
                Err(e) => {
                    waiter.complete(Err(e));
                    continue;
                }
            };
            let pipe_local = Addr::new(own_node, ephemeral_port);
            let mtu = self.mtu_for(nwid);
            let receive_cap = self
                .endpoints
                .get(&endpoint_id)
                .map(|ep| ep.receive_cap)
                .unwrap_or(crate::options::DEFAULT_RECV_MAX_SIZE);

            let pipe_id = self.ids.next_pipe();
            let pipe = Pipe::new(
                pipe_local,
                entry.remote_addr,
                nwid,
                mtu,
                receive_cap,
                entry.peer_proto,
                now,
                self.log.clone(),
            );
            self.pipes.insert(pipe_id, pipe);
            let _ = self.registry.insert_local(pipe_local, Owner::Pipe(pipe_id));
            self.registry.insert_remote(entry.remote_addr, pipe_id);

            let proto = self
                .endpoints
                .get(&endpoint_id)
                .map(|ep| ep.proto)
                .unwrap_or(0);
            let frame = Frame::ConnAck {
                dest_port: entry.remote_addr.port(),
                src_port: pipe_local.port(),
                proto,
            };
            self.send_frame(nwid, pipe_local, entry.remote_addr, frame);
            waiter.complete(Ok(pipe_id));
        }
    }

    fn on_conn_ack(&mut self, nwid: Nwid, local_addr: Addr, remote_addr: Addr, proto: u16) {
        let endpoint_id = match self.registry.find_local(local_addr) {
            Some(Owner::Endpoint(id)) => id,
            _ => return,
        };
        let in_flight = self
            .endpoints
            .get(&endpoint_id)
            .map(|ep| ep.mode == Mode::Dial && ep.creq_try > 0)
            .unwrap_or(false);
        if !in_flight {
            return;
        }
        if self.registry.find_remote(remote_addr).is_some() {
            return; // duplicate ack, drop
        }

        let now = monotonic_now();
        let mtu = self.mtu_for(nwid);
        let receive_cap = self
            .endpoints
            .get(&endpoint_id)
            .map(|ep| ep.receive_cap)
            .unwrap_or(crate::options::DEFAULT_RECV_MAX_SIZE);

        let pipe_id = self.ids.next_pipe();
        let pipe = Pipe::new(local_addr, remote_addr, nwid, mtu, receive_cap, proto, now, self.log.clone());
        self.pipes.insert(pipe_id, pipe);

        // The endpoint surrenders its local address to the new pipe.
        self.registry.remove_local(local_addr);
        let _ = self.registry.insert_local(local_addr, Owner::Pipe(pipe_id));
        self.registry.insert_remote(remote_addr, pipe_id);

        let waiter = self.endpoints.get_mut(&endpoint_id).and_then(|ep| {
            ep.clear_retry();
            ep.remote_addr = Addr::from_raw(0);
            ep.pop_waiter()
        });
        if let Some(waiter) = waiter {
            waiter.complete(Ok(pipe_id));
        }
    }

    fn on_data(
        &mut self,
        _nwid: Nwid,
        local_addr: Addr,
        remote_addr: Addr,
        more: bool,
        msg_id: u16,
        frag_size: u16,
        frag_no: u16,
        n_frags: u16,
        payload: &[u8],
    ) {
        let _ = more;
        let pipe_id = match self.registry.find_local(local_addr) {
            Some(Owner::Pipe(id)) => id,
            _ => {
                // Not-connected: no matching pipe for this address.
                return;
            }
        };
        let now = monotonic_now();
        let nwid = self.pipes.get(&pipe_id).map(|p| p.nwid);
        let outcome = match self.pipes.get_mut(&pipe_id) {
            Some(pipe) => pipe.on_data_frame(now, msg_id, frag_size, frag_no, n_frags, payload),
            None => return,
        };
        if matches!(outcome, IngestOutcome::ProtocolError | IngestOutcome::TooLarge) {
            if let Some(nwid) = nwid {
                self.teardown_pipe(pipe_id, nwid, local_addr, remote_addr, true);
            }
        }
    }

    fn on_disc_req(&mut self, remote_addr: Addr) {
        if let Some(pipe_id) = self.registry.find_remote(remote_addr) {
            if let Some(pipe) = self.pipes.get_mut(&pipe_id) {
                pipe.on_disc_req();
            }
        }
    }

    fn on_ping_req(&mut self, nwid: Nwid, local_addr: Addr, remote_addr: Addr) {
        if let Some(Owner::Pipe(pipe_id)) = self.registry.find_local(local_addr) {
            if let Some(pipe) = self.pipes.get_mut(&pipe_id) {
                pipe.touch_ping(monotonic_now());
            }
            let frame = Frame::PingAck {
                dest_port: remote_addr.port(),
                src_port: local_addr.port(),
            };
            self.send_frame(nwid, local_addr, remote_addr, frame);
        }
    }

    fn on_ping_ack(&mut self, remote_addr: Addr) {
        if let Some(pipe_id) = self.registry.find_remote(remote_addr) {
            if let Some(pipe) = self.pipes.get_mut(&pipe_id) {
                pipe.touch_ping(monotonic_now());
            }
        }
    }

    fn on_error(&mut self, remote_addr: Addr, code: u8) {
        // A dialer is the only thing that expects an `error` frame: it is
        // the reply to a still-outstanding `conn-req` (spec.md §4.4).
        let endpoint_id = self
            .endpoints
            .iter()
            .find(|(_, ep)| {
                ep.mode == Mode::Dial && ep.creq_try > 0 && ep.remote_addr == remote_addr
            })
            .map(|(id, _)| *id);
        let endpoint_id = match endpoint_id {
            Some(id) => id,
            None => return,
        };
        let mapped = WireErrorCode::from_u8(code)
            .map(WireErrorCode::to_transport_error)
            .unwrap_or(TransportError::Internal("unrecognized wire error code"));
        if let Some(ep) = self.endpoints.get_mut(&endpoint_id) {
            ep.clear_retry();
            if let Some(waiter) = ep.pop_waiter() {
                waiter.complete(Err(mapped));
            }
        }
    }

    fn teardown_pipe(&mut self, pipe_id: PipeId, nwid: Nwid, local_addr: Addr, remote_addr: Addr, fatal: bool) {
        if let Some(pipe) = self.pipes.get_mut(&pipe_id) {
            pipe.close();
        }
        self.pipes.remove(&pipe_id);
        self.registry.remove_local(local_addr);
        self.registry.remove_remote(remote_addr);
        self.registry.release_port(local_addr.port());
        if fatal {
            debug!(self.log, "pipe closed on protocol error"; "local" => local_addr.to_string());
        }
        let _ = nwid;
    }

    fn tick_retries(&mut self, now: Instant) {
        let due: Vec<EndpointId> = self
            .endpoints
            .iter()
            .filter(|(_, ep)| {
                ep.mode == Mode::Dial
                    && ep.creq_try > 0
                    && ep.retry_deadline.map(|d| d <= now).unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in due {
            let decision = match self.endpoints.get_mut(&id) {
                Some(ep) => ep.on_retry_timeout(now),
                None => continue,
            };
            match decision {
                RetryDecision::ReemitConnReq => {
                    let (nwid, local_addr) = match self.endpoints.get(&id) {
                        Some(ep) => (ep.nwid, ep.local_addr),
                        None => continue,
                    };
                    self.reemit_conn_req(id, now);
                    self.request_wake(now + crate::endpoint::CONN_INTERVAL);
                    let _ = (nwid, local_addr);
                }
                RetryDecision::GiveUp => {
                    if let Some(ep) = self.endpoints.get_mut(&id) {
                        if let Some(waiter) = ep.pop_waiter() {
                            waiter.complete(Err(TransportError::TimedOut));
                        }
                    }
                }
            }
        }
    }
}

/// The Overlay Host: one instance per home path (spec.md §3), shared by all
/// endpoints referencing that path.
pub struct Host {
    inner: Mutex<HostInner>,
    cv: Condvar,
}

impl Host {
    pub fn new(
        overlay: Box<dyn OverlayEngine>,
        wire: Box<dyn WireSend>,
        home: Option<PathBuf>,
        log: Logger,
    ) -> Arc<Host> {
        let inner = HostInner {
            overlay,
            wire,
            store: Store::new(home),
            registry: Registry::new(),
            ids: IdAllocator::default(),
            endpoints: IndexMap::new(),
            pipes: IndexMap::new(),
            mtu_by_nwid: HashMap::new(),
            next_wake: monotonic_now(),
            closed: false,
            log,
        };
        let host = Arc::new(Host {
            inner: Mutex::new(inner),
            cv: Condvar::new(),
        });
        crate::scheduler::spawn(host.clone());
        host
    }

    /// Runs one iteration of the background scheduler loop (spec.md §4.1
    /// "Background thread protocol"): blocks on the condition variable until
    /// the next scheduled wake (or [`crate::scheduler::EVENT_POLL_INTERVAL`],
    /// whichever is sooner), then pumps once. Returns `false` once the host
    /// has been closed, telling [`crate::scheduler::spawn`]'s loop to stop.
    pub(crate) fn drive_background_once(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return false;
        }
        let now = monotonic_now();
        let wake_at = inner.next_wake.min(now + crate::scheduler::EVENT_POLL_INTERVAL);
        if wake_at > now {
            let wait_for = wake_at - now;
            let (guard, _timeout) = self.cv.wait_timeout(inner, wait_for).unwrap();
            inner = guard;
            if inner.closed {
                return false;
            }
        }
        self.pump_locked(&mut inner);
        true
    }

    /// Runs one drain-and-dispatch pass immediately, without waiting for
    /// the background thread's next scheduled wake. Deterministic tests
    /// use this instead of sleeping past `EVENT_POLL_INTERVAL`.
    pub fn pump(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.pump_locked(&mut inner);
    }

    fn pump_locked(&self, inner: &mut HostInner) {
        let now = monotonic_now();
        if now >= inner.next_wake {
            inner.next_wake = inner.overlay.do_periodic_work(now);
        }
        inner.tick_retries(now);
        for event in inner.overlay.drain_events() {
            inner.dispatch(event);
        }
    }

    pub fn bind(&self, mode: Mode, nwid: Nwid, node: u64, port: u32) -> Result<EndpointId> {
        let mut inner = self.inner.lock().unwrap();
        let own_node = inner.own_node()?;

        if mode == Mode::Listen && node != 0 && node != own_node {
            return Err(TransportError::AddressInvalid);
        }

        let resolved_port = if port == 0 {
            inner.registry.alloc_ephemeral_port()?
        } else {
            inner.registry.reserve_port(port)?;
            port
        };

        inner.overlay.join_network(nwid);

        let local_addr = Addr::new(own_node, resolved_port);
        let log = inner.log.new(o!("endpoint" => local_addr.to_string()));
        let mut endpoint = Endpoint::new(mode, nwid, log);
        endpoint.local_addr = local_addr;
        endpoint.state = match mode {
            Mode::Listen => EndpointState::Listening,
            Mode::Dial => EndpointState::Bound,
        };

        let endpoint_id = inner.ids.next_endpoint();
        inner
            .registry
            .insert_local(local_addr, Owner::Endpoint(endpoint_id))?;
        inner.endpoints.insert(endpoint_id, endpoint);
        self.cv.notify_all();
        Ok(endpoint_id)
    }

    pub fn set_receive_cap(&self, endpoint_id: EndpointId, cap: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let ep = inner
            .endpoints
            .get_mut(&endpoint_id)
            .ok_or(TransportError::Closed)?;
        ep.receive_cap = cap;
        Ok(())
    }

    pub fn set_proto(&self, endpoint_id: EndpointId, proto: u16) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let ep = inner
            .endpoints
            .get_mut(&endpoint_id)
            .ok_or(TransportError::Closed)?;
        ep.proto = proto;
        Ok(())
    }

    pub fn accept(&self, endpoint_id: EndpointId) -> Result<Op<PipeId>> {
        let mut inner = self.inner.lock().unwrap();
        let (op, handle) = op::pair();
        {
            let ep = inner
                .endpoints
                .get_mut(&endpoint_id)
                .ok_or(TransportError::Closed)?;
            if !ep.is_listener() {
                return Err(TransportError::Invalid);
            }
            ep.push_waiter(handle);
        }
        let nwid = inner.endpoints.get(&endpoint_id).unwrap().nwid;
        inner.run_accept_drain(endpoint_id, nwid);
        self.cv.notify_all();
        Ok(op)
    }

    pub fn connect(&self, endpoint_id: EndpointId, remote_node: u64, remote_port: u32) -> Result<Op<PipeId>> {
        let mut inner = self.inner.lock().unwrap();
        let now = monotonic_now();

        let (nwid, local_addr, proto) = {
            let ep = inner
                .endpoints
                .get_mut(&endpoint_id)
                .ok_or(TransportError::Closed)?;
            if ep.mode != Mode::Dial {
                return Err(TransportError::Invalid);
            }
            ep.remote_addr = Addr::new(remote_node, remote_port);
            (ep.nwid, ep.local_addr, ep.proto)
        };
        let remote_addr = Addr::new(remote_node, remote_port);

        let (op, handle) = op::pair();
        let already_retrying = {
            let ep = inner.endpoints.get_mut(&endpoint_id).unwrap();
            ep.push_waiter(handle);
            let was_retrying = ep.creq_try > 0;
            if !was_retrying {
                ep.start_connect_retry(now);
            }
            was_retrying
        };
        if !already_retrying {
            let frame = Frame::ConnReq {
                dest_port: remote_addr.port(),
                src_port: local_addr.port(),
                proto,
            };
            inner.send_frame(nwid, local_addr, remote_addr, frame);
            inner.request_wake(now + crate::endpoint::CONN_INTERVAL);
        }
        self.cv.notify_all();
        Ok(op)
    }

    pub fn pipe_send(&self, pipe_id: PipeId, payload: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let (nwid, local_addr, remote_addr, frames) = {
            let pipe = inner.pipes.get_mut(&pipe_id).ok_or(TransportError::Closed)?;
            let frames = pipe.build_send_frames(payload)?;
            (pipe.nwid, pipe.local_addr, pipe.remote_addr, frames)
        };
        for frame in frames {
            inner.send_frame(nwid, local_addr, remote_addr, frame);
        }
        Ok(payload.len())
    }

    pub fn pipe_recv(&self, pipe_id: PipeId) -> Result<Op<Vec<u8>>> {
        let mut inner = self.inner.lock().unwrap();
        let now = monotonic_now();
        let (op, handle) = op::pair();
        let pipe = inner.pipes.get_mut(&pipe_id).ok_or(TransportError::Closed)?;
        pipe.recv(now, handle);
        Ok(op)
    }

    pub fn pipe_close(&self, pipe_id: PipeId) {
        let mut inner = self.inner.lock().unwrap();
        let (nwid, local_addr, remote_addr) = match inner.pipes.get(&pipe_id) {
            Some(pipe) => (pipe.nwid, pipe.local_addr, pipe.remote_addr),
            None => return,
        };
        if let Some(pipe) = inner.pipes.get_mut(&pipe_id) {
            pipe.close();
        }
        let frame = Frame::DiscReq {
            dest_port: remote_addr.port(),
            src_port: local_addr.port(),
        };
        inner.send_frame(nwid, local_addr, remote_addr, frame);
        inner.pipes.remove(&pipe_id);
        inner.registry.remove_local(local_addr);
        inner.registry.remove_remote(remote_addr);
        inner.registry.release_port(local_addr.port());
        self.cv.notify_all();
    }

    pub fn endpoint_close(&self, endpoint_id: EndpointId) {
        let mut inner = self.inner.lock().unwrap();
        let local_addr = match inner.endpoints.get(&endpoint_id) {
            Some(ep) => ep.local_addr,
            None => return,
        };
        if let Some(ep) = inner.endpoints.get_mut(&endpoint_id) {
            ep.fail_all(|| TransportError::Closed);
            ep.state = EndpointState::Dead;
        }
        inner.endpoints.remove(&endpoint_id);
        inner.registry.remove_local(local_addr);
        inner.registry.release_port(local_addr.port());
        self.cv.notify_all();
    }

    pub fn find_pipe(&self, local_addr: Addr) -> Option<PipeId> {
        let inner = self.inner.lock().unwrap();
        match inner.registry.find_local(local_addr) {
            Some(Owner::Pipe(id)) => Some(id),
            _ => None,
        }
    }

    pub fn find_endpoint(&self, local_addr: Addr) -> Option<EndpointId> {
        let inner = self.inner.lock().unwrap();
        match inner.registry.find_local(local_addr) {
            Some(Owner::Endpoint(id)) => Some(id),
            _ => None,
        }
    }

    /// The address an endpoint was actually bound to, including any
    /// ephemeral port the registry assigned (spec.md §4.2).
    pub fn endpoint_local_addr(&self, endpoint_id: EndpointId) -> Option<Addr> {
        let inner = self.inner.lock().unwrap();
        inner.endpoints.get(&endpoint_id).map(|ep| ep.local_addr)
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.cv.notify_all();
    }

    /// Feeds one received UDP datagram into the overlay (spec.md §4.1 "UDP
    /// receive loop"). A real binding calls this from the dedicated v4/v6
    /// recv threads described there; kept callable directly for tests that
    /// don't open real sockets.
    pub fn wire_recv(&self, from: SocketAddr, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.overlay.wire_recv(from, bytes);
        self.pump_locked(&mut inner);
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::discard;
    use crate::overlay::sim::{SimEngine, SimNetwork, SimWireSend};

    fn make_host(network: &Arc<SimNetwork>, node: u64) -> Arc<Host> {
        let engine = SimEngine::new(network.clone(), node, 1500);
        Host::new(Box::new(engine), Box::new(SimWireSend), None, discard())
    }

    #[test]
    fn dial_accept_round_trip_delivers_full_message() {
        let network = SimNetwork::new();
        let listener_host = make_host(&network, 1);
        let dialer_host = make_host(&network, 2);

        let nwid: Nwid = 0xd00d;
        let listener_ep = listener_host.bind(Mode::Listen, nwid, 0, 0).unwrap();
        listener_host.pump();
        let listener_addr = {
            let inner = listener_host.inner.lock().unwrap();
            inner.endpoints.get(&listener_ep).unwrap().local_addr
        };

        let dialer_ep = dialer_host.bind(Mode::Dial, nwid, 0, 0).unwrap();
        dialer_host.pump();

        let accept_op = listener_host.accept(listener_ep).unwrap();
        let connect_op = dialer_host
            .connect(dialer_ep, listener_addr.node(), listener_addr.port())
            .unwrap();

        // Drive both hosts until the handshake settles.
        for _ in 0..10 {
            listener_host.pump();
            dialer_host.pump();
        }

        let dial_pipe = connect_op.wait().unwrap();
        let accept_pipe = accept_op.wait().unwrap();

        let payload = vec![0xABu8; 4096];
        dialer_host.pipe_send(dial_pipe, &payload).unwrap();
        for _ in 0..5 {
            listener_host.pump();
            dialer_host.pump();
        }

        let recv_op = listener_host.pipe_recv(accept_pipe).unwrap();
        let received = recv_op.wait().unwrap();
        assert_eq!(received, payload);
    }

    #[test]
    fn connect_refusal_maps_to_connection_refused() {
        let network = SimNetwork::new();
        let dialer_host = make_host(&network, 3);
        let nwid: Nwid = 0xbeef;
        let dialer_ep = dialer_host.bind(Mode::Dial, nwid, 0, 0).unwrap();
        dialer_host.pump();

        let connect_op = dialer_host.connect(dialer_ep, 0x9999, 7).unwrap();
        // No listener exists for node 0x9999 in this sim network, so no
        // reply is ever produced; the send simply goes nowhere. This test
        // instead exercises the explicit wire-level refusal path directly.
        {
            let mut inner = dialer_host.inner.lock().unwrap();
            inner.on_error(Addr::new(0x9999, 7), WireErrorCode::Refused as u8);
        }
        assert!(matches!(
            connect_op.wait(),
            Err(TransportError::ConnectionRefused)
        ));
    }

    #[test]
    fn network_config_up_reemits_conn_req_without_duplicating_pipe() {
        let network = SimNetwork::new();
        let listener_host = make_host(&network, 10);
        let dialer_host = make_host(&network, 20);

        let nwid: Nwid = 0xfeed;
        let listener_ep = listener_host.bind(Mode::Listen, nwid, 0, 0).unwrap();
        listener_host.pump();
        let listener_addr = {
            let inner = listener_host.inner.lock().unwrap();
            inner.endpoints.get(&listener_ep).unwrap().local_addr
        };

        let dialer_ep = dialer_host.bind(Mode::Dial, nwid, 0, 0).unwrap();
        dialer_host.pump();

        let accept_op = listener_host.accept(listener_ep).unwrap();
        let connect_op = dialer_host
            .connect(dialer_ep, listener_addr.node(), listener_addr.port())
            .unwrap();

        // Simulate the network reporting "up" again while the conn-req is
        // still outstanding (spec.md §6 virtual-config: "on dialer with
        // pending ops, re-emit conn-req"). The listener's conn-req ingest
        // must dedupe this against the one already in flight rather than
        // spawning a second pipe.
        {
            let mut inner = dialer_host.inner.lock().unwrap();
            inner.dispatch_virtual_config(nwid, true, 1500);
        }

        for _ in 0..10 {
            listener_host.pump();
            dialer_host.pump();
        }

        let _dial_pipe = connect_op.wait().unwrap();
        let _accept_pipe = accept_op.wait().unwrap();
        assert_eq!(listener_host.inner.lock().unwrap().pipes.len(), 1);
        assert_eq!(dialer_host.inner.lock().unwrap().pipes.len(), 1);
    }

    #[test]
    fn duplicate_conn_ack_after_dial_completes_is_dropped() {
        let network = SimNetwork::new();
        let listener_host = make_host(&network, 30);
        let dialer_host = make_host(&network, 40);

        let nwid: Nwid = 0xaced;
        let listener_ep = listener_host.bind(Mode::Listen, nwid, 0, 0).unwrap();
        listener_host.pump();
        let listener_addr = {
            let inner = listener_host.inner.lock().unwrap();
            inner.endpoints.get(&listener_ep).unwrap().local_addr
        };

        let dialer_ep = dialer_host.bind(Mode::Dial, nwid, 0, 0).unwrap();
        dialer_host.pump();
        let dialer_local_addr = dialer_host.endpoint_local_addr(dialer_ep).unwrap();

        let accept_op = listener_host.accept(listener_ep).unwrap();
        let connect_op = dialer_host
            .connect(dialer_ep, listener_addr.node(), listener_addr.port())
            .unwrap();
        for _ in 0..10 {
            listener_host.pump();
            dialer_host.pump();
        }
        let dial_pipe = connect_op.wait().unwrap();
        let _accept_pipe = accept_op.wait().unwrap();

        let (remote_addr, pipes_before) = {
            let inner = dialer_host.inner.lock().unwrap();
            (inner.pipes.get(&dial_pipe).unwrap().remote_addr, inner.pipes.len())
        };

        // A stray duplicate conn-ack addressed to the endpoint's (now
        // pipe-owned) local address must be dropped: no new pipe, no state
        // change (spec.md §4.4 "Duplicate conn-ack").
        {
            let mut inner = dialer_host.inner.lock().unwrap();
            inner.on_conn_ack(nwid, dialer_local_addr, remote_addr, 1);
        }
        assert_eq!(dialer_host.inner.lock().unwrap().pipes.len(), pipes_before);
    }
}
