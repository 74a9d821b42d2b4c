//! Background timer thread glue (spec.md §2 "Scheduler glue", §4.1
//! "Background thread protocol").
//!
//! Grounded on `neutronium/src/net/endpoint.rs`'s `Endpoint::sync(now)` tick
//! pattern, regeneralized from mio readiness polling (driven by an external
//! event loop calling `sync` every iteration) to a dedicated thread blocking
//! on a condition variable, since spec.md §5 mandates a single background
//! thread rather than a framework-driven poll loop. [`Host`] owns the lock
//! and the wake-time bookkeeping; this module only owns the thread and its
//! wait/wake cadence.

use std::sync::Arc;
use std::time::Duration;

use crate::host::Host;

/// How often the background thread wakes even without a scheduled event, to
/// drain overlay events that arrived between scheduled wakes. A real FFI
/// binding would instead be driven by genuine callback invocations; this
/// crate's `OverlayEngine` is event-queue based (see `overlay/mod.rs`), so
/// polling at a short bound stands in for that push notification.
pub const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Spawns the single background thread that drives the overlay's periodic
/// work for `host` (spec.md §4.1). The thread exits once `host` is closed
/// (spec.md §9 "Background thread lifecycle": "must wake promptly on
/// close... the thread observes the flag and exits").
pub fn spawn(host: Arc<Host>) {
    std::thread::spawn(move || while host.drive_background_once() {});
}
