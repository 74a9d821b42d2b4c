//! Clock helper, grounded on `flux::time`.
//!
//! The teacher's `flux::time::timestamp_secs` stamps wall-clock expiry into
//! session tokens; every deadline in this crate (backlog expiry, connect
//! retry, reassembly staleness) is measured against local elapsed time
//! instead, since a wall-clock jump must not reopen an already-expired
//! backlog entry or retry a connect early. `monotonic_now` is the one place
//! that reads the clock, so every timeout in the engine is auditable.

use std::time::Instant;

#[inline]
pub fn monotonic_now() -> Instant {
    Instant::now()
}
