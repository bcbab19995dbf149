//! A single-value promise/future rendezvous.
//!
//! The core exposes asynchronous operations through these futures; the one
//! blocking affordance is [`Future::wait`], which suspends the calling
//! fiber until the paired [`Promise`] is fulfilled.

use std::sync::Arc;
use std::time::Instant;

use crate::fiber::{Condvar, Mutex};

enum Slot<T> {
    Empty,
    Value(T),
    // The promise was dropped without a value.
    Broken,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    cv: Condvar,
}

/// The producing half; fulfill with [`Promise::set_value`].
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
    fulfilled: bool,
}

/// The consuming half of a [`channel`].
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

/// Creates a connected promise/future pair.
pub fn channel<T>() -> (Promise<T>, Future<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot::Empty),
        cv: Condvar::new(),
    });
    (
        Promise {
            shared: shared.clone(),
            fulfilled: false,
        },
        Future { shared },
    )
}

impl<T> Promise<T> {
    /// Fulfills the future, waking its waiter if any.
    pub fn set_value(mut self, value: T) {
        let mut slot = self.shared.slot.lock();
        debug_assert!(matches!(*slot, Slot::Empty));
        *slot = Slot::Value(value);
        self.fulfilled = true;
        self.shared.cv.notify_all();
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.fulfilled {
            return;
        }
        let mut slot = self.shared.slot.lock();
        if matches!(*slot, Slot::Empty) {
            *slot = Slot::Broken;
            self.shared.cv.notify_all();
        }
    }
}

impl<T> Future<T> {
    /// Suspends the calling fiber until the value arrives.
    ///
    /// Panics if the promise was dropped unfulfilled; within this crate
    /// every promise is fulfilled exactly once.
    pub fn wait(self) -> T {
        let guard = self.shared.slot.lock();
        let mut guard = self
            .shared
            .cv
            .wait_while(guard, |slot| matches!(slot, Slot::Empty));
        match std::mem::replace(&mut *guard, Slot::Broken) {
            Slot::Value(value) => value,
            Slot::Broken => panic!("promise dropped without a value"),
            Slot::Empty => unreachable!(),
        }
    }

    /// Like [`wait`](Future::wait), giving up at `deadline`.
    ///
    /// On timeout the future is returned so the caller may keep waiting.
    pub fn wait_until(self, deadline: Instant) -> Result<T, Future<T>> {
        {
            let guard = self.shared.slot.lock();
            let (mut guard, satisfied) = self
                .shared
                .cv
                .wait_while_until(guard, deadline, |slot| matches!(slot, Slot::Empty));
            if satisfied {
                return match std::mem::replace(&mut *guard, Slot::Broken) {
                    Slot::Value(value) => Ok(value),
                    Slot::Broken => panic!("promise dropped without a value"),
                    Slot::Empty => unreachable!(),
                };
            }
        }
        Err(self)
    }

    /// Returns the value if it has already arrived.
    pub fn try_take(self) -> Result<T, Future<T>> {
        {
            let mut guard = self.shared.slot.lock();
            if matches!(*guard, Slot::Value(_)) {
                return match std::mem::replace(&mut *guard, Slot::Broken) {
                    Slot::Value(value) => Ok(value),
                    _ => unreachable!(),
                };
            }
        }
        Err(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn value_crosses_threads() {
        let (promise, future) = channel();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            promise.set_value(41);
        });
        assert_eq!(future.wait(), 41);
    }

    #[test]
    fn wait_until_times_out_and_recovers() {
        let (promise, future) = channel::<u32>();
        let future = match future.wait_until(Instant::now() + Duration::from_millis(20)) {
            Ok(_) => panic!("nothing was sent yet"),
            Err(f) => f,
        };
        promise.set_value(7);
        assert_eq!(future.wait(), 7);
    }

    #[test]
    fn immediate_value_is_ready() {
        let (promise, future) = channel();
        promise.set_value("done");
        assert_eq!(future.try_take().ok(), Some("done"));
    }
}
