//! Counting and binary semaphores for fibers.

use std::time::{Duration, Instant};

use super::{Condvar, Mutex};

/// A counting semaphore over a `u32` permit counter.
///
/// `MAX` bounds the number of permits the semaphore is allowed to
/// accumulate; [`BinarySemaphore`] pins it at one.
pub struct CountingSemaphore<const MAX: u32 = { u32::MAX }> {
    permits: Mutex<u32>,
    cv: Condvar,
}

/// A semaphore holding at most one permit.
pub type BinarySemaphore = CountingSemaphore<1>;

/// The default, effectively unbounded counting semaphore.
pub type Semaphore = CountingSemaphore;

impl<const MAX: u32> CountingSemaphore<MAX> {
    /// Creates a semaphore with `permits` initial permits.
    pub fn new(permits: u32) -> CountingSemaphore<MAX> {
        assert!(permits <= MAX);
        CountingSemaphore {
            permits: Mutex::new(permits),
            cv: Condvar::new(),
        }
    }

    /// Takes a permit, suspending the calling fiber until one is available.
    pub fn acquire(&self) {
        let guard = self.permits.lock();
        let mut guard = self.cv.wait_while(guard, |permits| *permits == 0);
        *guard -= 1;
    }

    /// Takes a permit if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// [`acquire`](Self::acquire) bounded by a relative timeout.
    pub fn try_acquire_for(&self, timeout: Duration) -> bool {
        self.try_acquire_until(Instant::now() + timeout)
    }

    /// [`acquire`](Self::acquire) bounded by a deadline.
    pub fn try_acquire_until(&self, deadline: Instant) -> bool {
        let guard = self.permits.lock();
        let (mut guard, acquired) =
            self.cv
                .wait_while_until(guard, deadline, |permits| *permits == 0);
        if acquired {
            *guard -= 1;
        }
        acquired
    }

    /// Returns `count` permits.
    pub fn release(&self, count: u32) {
        let mut permits = self.permits.lock();
        *permits = permits
            .checked_add(count)
            .filter(|total| *total <= MAX)
            .expect("semaphore released above its maximum");
        if count == 1 {
            self.cv.notify_one();
        } else {
            self.cv.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn acquire_release_round_trip() {
        let sem: Semaphore = CountingSemaphore::new(2);
        sem.acquire();
        sem.acquire();
        assert!(!sem.try_acquire());
        sem.release(1);
        assert!(sem.try_acquire());
        sem.release(2);
    }

    #[test]
    fn timed_acquire() {
        let sem: Semaphore = CountingSemaphore::new(0);
        assert!(!sem.try_acquire_for(Duration::from_millis(20)));
        sem.release(1);
        assert!(sem.try_acquire_for(Duration::from_millis(20)));
    }

    #[test]
    fn release_many_wakes_many() {
        let sem: Arc<Semaphore> = Arc::new(CountingSemaphore::new(0));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let sem = sem.clone();
                std::thread::spawn(move || sem.acquire())
            })
            .collect();
        std::thread::sleep(Duration::from_millis(20));
        sem.release(3);
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    #[should_panic(expected = "above its maximum")]
    fn binary_semaphore_cannot_overflow() {
        let sem = BinarySemaphore::new(1);
        sem.release(1);
    }
}
