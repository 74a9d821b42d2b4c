//! User-operation completion primitive (spec.md §5 "suspension points").
//!
//! User operations (`accept`, `connect`, pipe `send`/`recv`) register a
//! completion object and return immediately; the caller blocks on that
//! object separately from the global lock, and the engine completes it from
//! inside a locked region once a frame, timer, or close resolves it. This
//! keeps the global lock's critical sections short and means a blocked
//! caller never holds the lock it's waiting for someone else to acquire.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crate::error::{Result, TransportError};

struct Inner<T> {
    state: Mutex<Option<Result<T>>>,
    cv: Condvar,
}

/// The caller-facing half: wait on this to get the operation's result.
pub struct Op<T> {
    inner: Arc<Inner<T>>,
}

/// The engine-facing half: complete the operation from wherever its
/// resolution happens (frame dispatch, timer fire, close). Cheap to clone
/// and stash in a backlog entry or retry-timer record.
pub struct OpHandle<T> {
    inner: Arc<Inner<T>>,
}

/// Creates a fresh, unresolved operation and its completion handle.
pub fn pair<T>() -> (Op<T>, OpHandle<T>) {
    let inner = Arc::new(Inner {
        state: Mutex::new(None),
        cv: Condvar::new(),
    });
    (
        Op {
            inner: inner.clone(),
        },
        OpHandle { inner },
    )
}

impl<T> Op<T> {
    /// Blocks until the operation completes, with no deadline.
    pub fn wait(self) -> Result<T> {
        let mut guard = self.inner.state.lock().unwrap();
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            guard = self.inner.cv.wait(guard).unwrap();
        }
    }

    /// Blocks until the operation completes or `deadline` passes, whichever
    /// is sooner — spec.md §5: "The user op's explicit deadline, if sooner,
    /// wins."
    pub fn wait_deadline(self, deadline: Instant) -> Result<T> {
        let mut guard = self.inner.state.lock().unwrap();
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::TimedOut);
            }
            let (next_guard, _timeout_result) =
                self.inner.cv.wait_timeout(guard, deadline - now).unwrap();
            guard = next_guard;
        }
    }

    /// A handle to this operation's completion slot, for registering a
    /// cancellation hook without consuming `self`.
    pub fn handle(&self) -> OpHandle<T> {
        OpHandle {
            inner: self.inner.clone(),
        }
    }
}

impl<T> OpHandle<T> {
    /// Completes the operation if it hasn't already been completed (first
    /// writer wins — a cancellation racing a completion cannot clobber it).
    pub fn complete(&self, result: Result<T>) {
        let mut guard = self.inner.state.lock().unwrap();
        if guard.is_none() {
            *guard = Some(result);
            self.inner.cv.notify_all();
        }
    }

    /// Cancellation hook (spec.md §5): completes with `closed` unless
    /// already resolved.
    pub fn cancel(&self) {
        self.complete(Err(TransportError::Closed));
    }

    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().unwrap().is_none()
    }
}

impl<T> Clone for OpHandle<T> {
    fn clone(&self) -> Self {
        OpHandle {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn completes_before_wait() {
        let (op, handle) = pair::<u32>();
        handle.complete(Ok(7));
        assert_eq!(op.wait().unwrap(), 7);
    }

    #[test]
    fn completes_after_wait_from_another_thread() {
        let (op, handle) = pair::<u32>();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle.complete(Ok(9));
        });
        assert_eq!(op.wait().unwrap(), 9);
        t.join().unwrap();
    }

    #[test]
    fn wait_deadline_times_out() {
        let (op, _handle) = pair::<u32>();
        let deadline = Instant::now() + Duration::from_millis(10);
        assert!(matches!(op.wait_deadline(deadline), Err(TransportError::TimedOut)));
    }

    #[test]
    fn first_completion_wins() {
        let (op, handle) = pair::<u32>();
        handle.complete(Ok(1));
        handle.complete(Ok(2));
        assert_eq!(op.wait().unwrap(), 1);
    }

    #[test]
    fn cancel_resolves_pending_wait() {
        let (op, handle) = pair::<u32>();
        assert!(handle.is_pending());
        handle.cancel();
        assert!(matches!(op.wait(), Err(TransportError::Closed)));
    }
}
