//! Public binding surface (spec.md §4, §6): resolves `zt://` URLs and an
//! [`OptionTable`] into a running [`Endpoint`]/[`Pipe`] pair, and owns the
//! Overlay Host lifecycle invariant from spec.md §3 — "at most one Overlay
//! Host per home path, shared by all endpoints referencing that path...
//! created lazily on first endpoint bind; destroyed when last endpoint
//! releases it."
//!
//! Grounded on the teacher's `flux::session` pattern of a thin owning handle
//! (`SessionKey`) around shared, lock-guarded state, and on
//! `neutronium`'s `World`-owns-its-subsystems shape: here a [`Transport`] is
//! the shared registry, and [`Endpoint`]/[`Pipe`] are RAII handles into it
//! that release their share on drop instead of requiring an explicit
//! teardown call from every caller.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use slog::Logger;

use crate::addr::{Addr, Nwid};
use crate::endpoint::Mode;
use crate::error::Result;
use crate::host::Host;
use crate::op::Op;
use crate::options::OptionTable;
use crate::overlay::{OverlayEngine, WireSend};
use crate::registry::{EndpointId, PipeId};
use crate::url;

struct HostEntry {
    host: Arc<Host>,
    refcount: usize,
}

/// Registry of Overlay Hosts keyed by home path (`None` for the ephemeral,
/// unkeyed case). Cheap to clone — it's an `Arc` around the registry lock —
/// so every [`Endpoint`] can hold one to release its share on drop.
#[derive(Clone)]
pub struct Transport {
    hosts: Arc<Mutex<HashMap<Option<PathBuf>, HostEntry>>>,
}

impl Default for Transport {
    fn default() -> Self {
        Transport::new()
    }
}

impl Transport {
    pub fn new() -> Transport {
        Transport {
            hosts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of distinct home paths currently backed by a live Overlay
    /// Host. Exposed for tests asserting the refcounted lifecycle rather
    /// than for production use.
    pub fn live_host_count(&self) -> usize {
        self.hosts.lock().unwrap().len()
    }

    fn acquire(
        &self,
        home: Option<PathBuf>,
        make_overlay: impl FnOnce() -> (Box<dyn OverlayEngine>, Box<dyn WireSend>),
        log: Logger,
    ) -> Arc<Host> {
        let mut hosts = self.hosts.lock().unwrap();
        if let Some(entry) = hosts.get_mut(&home) {
            entry.refcount += 1;
            return entry.host.clone();
        }
        let (overlay, wire) = make_overlay();
        let host = Host::new(overlay, wire, home.clone(), log);
        hosts.insert(
            home,
            HostEntry {
                host: host.clone(),
                refcount: 1,
            },
        );
        host
    }

    /// Drops this caller's share of the Host backing `home`. Closes and
    /// evicts it once the last endpoint has released it (spec.md §3).
    fn release(&self, home: &Option<PathBuf>) {
        let mut hosts = self.hosts.lock().unwrap();
        if let Some(entry) = hosts.get_mut(home) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                entry.host.close();
                hosts.remove(home);
            }
        }
    }

    fn bind(
        &self,
        mode: Mode,
        opts: &OptionTable,
        nwid: Nwid,
        node: u64,
        port: u32,
        make_overlay: impl FnOnce() -> (Box<dyn OverlayEngine>, Box<dyn WireSend>),
        log: Logger,
    ) -> Result<Endpoint> {
        let home = opts.home_dir();
        let host = self.acquire(home.clone(), make_overlay, log);
        match host.bind(mode, nwid, node, port) {
            Ok(id) => {
                let _ = host.set_receive_cap(id, opts.recv_max_size());
                Ok(Endpoint {
                    transport: self.clone(),
                    home,
                    host,
                    id,
                })
            }
            Err(err) => {
                self.release(&home);
                Err(err)
            }
        }
    }

    /// Binds a listener from a `zt://` URL (spec.md §6). `make_overlay` is
    /// invoked only if no Host for the resolved home path exists yet.
    pub fn listen(
        &self,
        url: &str,
        opts: &OptionTable,
        make_overlay: impl FnOnce() -> (Box<dyn OverlayEngine>, Box<dyn WireSend>),
        log: Logger,
    ) -> Result<Endpoint> {
        let (nwid, node, port) = url::parse(url)?.resolve_for_listen()?;
        self.bind(Mode::Listen, opts, nwid, node, port, make_overlay, log)
    }

    /// Binds a dialer from a `zt://` URL and starts connecting to its
    /// remote node/port (spec.md §6, §4.4). The local bind uses the URL's
    /// network with a wildcard node and an ephemeral port.
    pub fn dial(
        &self,
        url: &str,
        opts: &OptionTable,
        make_overlay: impl FnOnce() -> (Box<dyn OverlayEngine>, Box<dyn WireSend>),
        log: Logger,
    ) -> Result<(Endpoint, Op<PipeId>)> {
        let (nwid, remote_node, remote_port) = url::parse(url)?.resolve_for_dial()?;
        let endpoint = self.bind(Mode::Dial, opts, nwid, 0, 0, make_overlay, log)?;
        let op = endpoint.connect(remote_node, remote_port)?;
        Ok((endpoint, op))
    }
}

/// An owning handle to a bound endpoint. Releases its share of the
/// backing Overlay Host (and, for listeners, drains any outstanding
/// backlog and accept waiters) when dropped.
pub struct Endpoint {
    transport: Transport,
    home: Option<PathBuf>,
    host: Arc<Host>,
    id: EndpointId,
}

impl Endpoint {
    /// Listener only: returns an op that completes with the next accepted
    /// pipe (spec.md §4.4 "Listener accept-drain").
    pub fn accept(&self) -> Result<Op<PipeId>> {
        self.host.accept(self.id)
    }

    /// Dialer only: starts (or rejoins) the connect-retry sequence toward
    /// `remote_node`/`remote_port` (spec.md §4.4 "Dialer retry").
    pub fn connect(&self, remote_node: u64, remote_port: u32) -> Result<Op<PipeId>> {
        self.host.connect(self.id, remote_node, remote_port)
    }

    pub fn set_receive_cap(&self, cap: u32) -> Result<()> {
        self.host.set_receive_cap(self.id, cap)
    }

    pub fn set_proto(&self, proto: u16) -> Result<()> {
        self.host.set_proto(self.id, proto)
    }

    pub fn local_addr(&self) -> Option<Addr> {
        self.host.endpoint_local_addr(self.id)
    }

    /// Wraps a pipe id produced by [`Endpoint::accept`] or
    /// [`Endpoint::connect`] into an owning [`Pipe`] handle.
    pub fn wrap_pipe(&self, id: PipeId) -> Pipe {
        Pipe {
            host: self.host.clone(),
            id,
        }
    }

    /// Explicit close. Equivalent to dropping the handle; the actual
    /// teardown happens in `Drop` either way.
    pub fn close(self) {}
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.host.endpoint_close(self.id);
        self.transport.release(&self.home);
    }
}

/// An owning handle to an established pipe. A pipe does not pin the
/// Overlay Host's lifetime on its own (spec.md §3 ties that to endpoints
/// only) but holds a live `Arc<Host>` so sends/receives remain valid for
/// as long as the handle exists.
pub struct Pipe {
    host: Arc<Host>,
    id: PipeId,
}

impl Pipe {
    pub fn send(&self, payload: &[u8]) -> Result<usize> {
        self.host.pipe_send(self.id, payload)
    }

    pub fn recv(&self) -> Result<Op<Vec<u8>>> {
        self.host.pipe_recv(self.id)
    }

    /// Explicit close. Equivalent to dropping the handle.
    pub fn close(self) {}
}

impl Drop for Pipe {
    fn drop(&mut self) {
        self.host.pipe_close(self.id);
    }
}
