//! Endpoint State Machine (spec.md §4.4).
//!
//! Grounded on `neutronium/src/net/endpoint.rs`'s `Endpoint` (pool of
//! pending work drained on every `sync(now)` tick, explicit housekeeping
//! constants like `HANDSHAKE_TIMEOUT`/`KEEPALIVE_INTERVAL`), regeneralized
//! from "accept incoming TCP handshakes" to spec.md's listener backlog and
//! dialer connect-retry loop. Like `pipe.rs`, this module holds pure data
//! and state-transition helpers; `Host` drives them under the global lock
//! and performs the actual frame I/O.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use slog::{debug, o, Logger};

use crate::addr::{Addr, Nwid};
use crate::error::TransportError;
use crate::op::OpHandle;
use crate::registry::PipeId;

/// Bound on the connect-request backlog (spec.md §3).
pub const BACKLOG_CAPACITY: usize = 128;
/// Default connect-retry attempt cap (spec.md §4.4).
pub const CONN_ATTEMPTS: u32 = 12;
/// Default connect-retry interval (spec.md §4.4).
pub const CONN_INTERVAL: Duration = Duration::from_secs(5);
/// Backlog entry lifetime. Spec.md §3 requires entries to expire but leaves
/// the exact duration unspecified; chosen to comfortably exceed one
/// `CONN_INTERVAL` retry round so a slow accept() doesn't starve a
/// still-retrying dialer (see DESIGN.md).
pub const LISTEN_EXPIRE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Mode {
    Listen,
    Dial,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EndpointState {
    Fresh,
    Bound,
    Connecting,
    Listening,
    Dead,
}

/// A queued `conn-req` awaiting `accept()` (spec.md §3).
#[derive(Debug, Clone, Copy)]
pub struct BacklogEntry {
    pub expire_time: Instant,
    pub remote_addr: Addr,
    pub peer_proto: u16,
}

/// Either a listener or a dialer owning a local conversation address.
pub struct Endpoint {
    pub mode: Mode,
    pub nwid: Nwid,
    pub local_addr: Addr,
    /// Dial only; zero for listeners.
    pub remote_addr: Addr,
    pub proto: u16,
    pub receive_cap: u32,
    pub state: EndpointState,
    /// Accept waiters (listener) or connect waiters (dialer). A dialer
    /// should normally hold at most one entry at a time: spec.md §4.4's
    /// retry/ack ingest logic talks about completing "the waiting user op"
    /// (singular).
    pending_ops: VecDeque<OpHandle<PipeId>>,
    backlog: VecDeque<BacklogEntry>,
    /// Dialer connect-retry attempt counter; zero means no retry in flight.
    pub creq_try: u32,
    pub retry_deadline: Option<Instant>,
    log: Logger,
}

impl Endpoint {
    pub fn new(mode: Mode, nwid: Nwid, log: Logger) -> Endpoint {
        Endpoint {
            mode,
            nwid,
            local_addr: Addr::from_raw(0),
            remote_addr: Addr::from_raw(0),
            proto: 0,
            receive_cap: crate::options::DEFAULT_RECV_MAX_SIZE,
            state: EndpointState::Fresh,
            pending_ops: VecDeque::new(),
            backlog: VecDeque::new(),
            creq_try: 0,
            retry_deadline: None,
            log,
        }
    }

    pub fn child_log(&self, addr: Addr) -> Logger {
        self.log.new(o!("addr" => addr.to_string()))
    }

    pub fn is_listener(&self) -> bool {
        self.mode == Mode::Listen
    }

    pub fn push_waiter(&mut self, handle: OpHandle<PipeId>) {
        self.pending_ops.push_back(handle);
    }

    pub fn pop_waiter(&mut self) -> Option<OpHandle<PipeId>> {
        self.pending_ops.pop_front()
    }

    pub fn has_waiters(&self) -> bool {
        !self.pending_ops.is_empty()
    }

    /// Evicts backlog entries whose `expire_time < now` (spec.md §4.4
    /// "Listener accept-drain"). Wrap-safe by construction: this walks the
    /// `VecDeque` front-to-back rather than comparing raw indices across a
    /// wraparound, the pitfall spec.md §9's open question calls out.
    pub fn evict_expired_backlog(&mut self, now: Instant) {
        while let Some(front) = self.backlog.front() {
            if front.expire_time < now {
                self.backlog.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn backlog_contains(&self, remote: Addr) -> bool {
        self.backlog.iter().any(|e| e.remote_addr == remote)
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Appends a backlog entry for a fresh `conn-req`. Returns `false` if
    /// the backlog is at capacity (spec.md §4.4: "If backlog full, drop
    /// silently").
    pub fn backlog_push(&mut self, entry: BacklogEntry) -> bool {
        if self.backlog.len() >= BACKLOG_CAPACITY {
            return false;
        }
        self.backlog.push_back(entry);
        true
    }

    /// Drains one `(backlog entry, waiter)` pair if both exist, after
    /// evicting expired entries (spec.md §4.4 "Listener accept-drain").
    pub fn try_accept_drain(&mut self, now: Instant) -> Option<(BacklogEntry, OpHandle<PipeId>)> {
        self.evict_expired_backlog(now);
        if self.backlog.is_empty() || self.pending_ops.is_empty() {
            return None;
        }
        let entry = self.backlog.pop_front()?;
        let waiter = self.pending_ops.pop_front()?;
        Some((entry, waiter))
    }

    /// Starts (or restarts) the dialer connect-retry sequence: first
    /// attempt, scheduled `CONN_INTERVAL` out.
    pub fn start_connect_retry(&mut self, now: Instant) {
        self.creq_try = 1;
        self.retry_deadline = Some(now + CONN_INTERVAL);
        self.state = EndpointState::Connecting;
    }

    /// Decision for what to do when the retry timer fires with no result
    /// yet (spec.md §4.4 "Dialer retry" timeout branch).
    pub fn on_retry_timeout(&mut self, now: Instant) -> RetryDecision {
        if self.creq_try <= CONN_ATTEMPTS {
            self.creq_try += 1;
            self.retry_deadline = Some(now + CONN_INTERVAL);
            RetryDecision::ReemitConnReq
        } else {
            self.creq_try = 0;
            self.retry_deadline = None;
            RetryDecision::GiveUp
        }
    }

    /// Clears retry state on success or hard error.
    pub fn clear_retry(&mut self) {
        self.creq_try = 0;
        self.retry_deadline = None;
    }

    /// Fails every queued waiter with `reason` (close, or a hard connect
    /// error) and clears the backlog/retry state.
    pub fn fail_all(&mut self, reason_factory: impl Fn() -> TransportError) {
        while let Some(waiter) = self.pending_ops.pop_front() {
            waiter.complete(Err(reason_factory()));
        }
        self.backlog.clear();
        self.clear_retry();
        debug!(self.log, "endpoint failed all pending ops");
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetryDecision {
    ReemitConnReq,
    GiveUp,
}
