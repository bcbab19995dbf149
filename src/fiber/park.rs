//! One-shot parking tokens used by the fiber synchronization primitives.

use std::sync::{Condvar, Mutex};
use std::time::Instant;

/// A single-use rendezvous between one parked fiber and one waker.
///
/// Each wait allocates a fresh `Parker`; pairing park/unpark exactly once
/// keeps the hand-off protocols of the primitives free of stale tokens.
pub(crate) struct Parker {
    notified: Mutex<bool>,
    cv: Condvar,
}

impl Parker {
    pub(crate) fn new() -> Parker {
        Parker {
            notified: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Blocks the calling fiber until [`unpark`](Parker::unpark) is called.
    pub(crate) fn park(&self) {
        let mut notified = self.notified.lock().expect("parker lock poisoned");
        while !*notified {
            notified = self.cv.wait(notified).expect("parker lock poisoned");
        }
    }

    /// Blocks until unparked or `deadline` passes. Returns whether the
    /// parker was notified.
    pub(crate) fn park_until(&self, deadline: Instant) -> bool {
        let mut notified = self.notified.lock().expect("parker lock poisoned");
        loop {
            if *notified {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cv
                .wait_timeout(notified, deadline - now)
                .expect("parker lock poisoned");
            notified = guard;
        }
    }

    /// Wakes the parked fiber (or makes the next park return immediately).
    pub(crate) fn unpark(&self) {
        let mut notified = self.notified.lock().expect("parker lock poisoned");
        *notified = true;
        self.cv.notify_one();
    }
}
