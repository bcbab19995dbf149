//! A single-use countdown synchronization point.

use std::time::{Duration, Instant};

use super::{Condvar, Mutex};

/// A latch counted down to zero exactly once.
///
/// Once the counter reaches zero all current and future waiters pass
/// without blocking. Usable from fibers and from plain OS threads alike
/// (the watchdog waits on one from its own thread).
pub struct Latch {
    count: Mutex<isize>,
    cv: Condvar,
}

impl Latch {
    /// Creates a latch that opens after `count` total count-downs.
    pub fn new(count: isize) -> Latch {
        assert!(count >= 0);
        Latch {
            count: Mutex::new(count),
            cv: Condvar::new(),
        }
    }

    /// Decrements the counter by `update`, waking all waiters when it hits
    /// zero.
    pub fn count_down(&self, update: isize) {
        let mut count = self.count.lock();
        assert!(*count >= update, "latch counted below zero");
        *count -= update;
        if *count == 0 {
            self.cv.notify_all();
        }
    }

    /// Returns whether the counter has reached zero.
    pub fn try_wait(&self) -> bool {
        *self.count.lock() == 0
    }

    /// Blocks the calling fiber until the counter reaches zero.
    pub fn wait(&self) {
        let guard = self.count.lock();
        let _guard = self.cv.wait_while(guard, |count| *count != 0);
    }

    /// [`wait`](Latch::wait) bounded by a relative timeout. Returns whether
    /// the latch opened in time.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }

    /// [`wait`](Latch::wait) bounded by a deadline. Returns whether the
    /// latch opened in time.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let guard = self.count.lock();
        let (_guard, opened) = self
            .cv
            .wait_while_until(guard, deadline, |count| *count != 0);
        opened
    }

    /// Counts down by `update` and waits for the latch to open.
    pub fn arrive_and_wait(&self, update: isize) {
        self.count_down(update);
        self.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn opens_after_exact_count() {
        let latch = Latch::new(2);
        assert!(!latch.try_wait());
        latch.count_down(1);
        assert!(!latch.try_wait());
        latch.count_down(1);
        assert!(latch.try_wait());
        latch.wait(); // Must not block.
    }

    #[test]
    fn wait_until_reports_timeout() {
        let latch = Latch::new(1);
        assert!(!latch.wait_for(Duration::from_millis(30)));
        latch.count_down(1);
        assert!(latch.wait_for(Duration::from_millis(30)));
    }

    #[test]
    fn cross_thread_count_down() {
        let latch = Arc::new(Latch::new(4));
        for _ in 0..4 {
            let latch = latch.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                latch.count_down(1);
            });
        }
        latch.wait();
        assert!(latch.try_wait());
    }

    #[test]
    #[should_panic(expected = "below zero")]
    fn overdraw_panics() {
        let latch = Latch::new(1);
        latch.count_down(2);
    }
}
