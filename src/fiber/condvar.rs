//! A condition variable for fibers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::mutex::MutexGuard;
use super::park::Parker;

/// Companion to [`Mutex`](super::Mutex); works only with it.
///
/// Waits may wake spuriously; deadline variants respect the deadline.
pub struct Condvar {
    waiters: std::sync::Mutex<VecDeque<Arc<Parker>>>,
}

impl Condvar {
    /// Creates a condition variable with no waiters.
    pub fn new() -> Condvar {
        Condvar {
            waiters: std::sync::Mutex::new(VecDeque::new()),
        }
    }

    /// Releases `guard` and suspends the calling fiber until notified,
    /// then reacquires the mutex.
    pub fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = guard.mutex();
        let parker = Arc::new(Parker::new());
        // Enqueue before releasing the mutex so a notify between unlock and
        // park cannot be lost.
        self.waiters
            .lock()
            .expect("condvar lock poisoned")
            .push_back(parker.clone());
        drop(guard);
        parker.park();
        mutex.lock()
    }

    /// Like [`wait`](Condvar::wait), giving up at `deadline`. The returned
    /// flag is `true` if the deadline passed without a notification.
    pub fn wait_until<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Instant,
    ) -> (MutexGuard<'a, T>, bool) {
        let mutex = guard.mutex();
        let parker = Arc::new(Parker::new());
        self.waiters
            .lock()
            .expect("condvar lock poisoned")
            .push_back(parker.clone());
        drop(guard);
        let mut timed_out = false;
        if !parker.park_until(deadline) {
            let mut waiters = self.waiters.lock().expect("condvar lock poisoned");
            if let Some(at) = waiters.iter().position(|w| Arc::ptr_eq(w, &parker)) {
                waiters.remove(at);
                timed_out = true;
            }
            // Not found: a notifier popped us concurrently with the timeout,
            // which counts as a wake-up.
        }
        (mutex.lock(), timed_out)
    }

    /// [`wait_until`](Condvar::wait_until) with a relative timeout.
    pub fn wait_for<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, bool) {
        self.wait_until(guard, Instant::now() + timeout)
    }

    /// Waits until `predicate` holds.
    pub fn wait_while<'a, T: ?Sized, F>(
        &self,
        mut guard: MutexGuard<'a, T>,
        mut predicate: F,
    ) -> MutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        while predicate(&mut guard) {
            guard = self.wait(guard);
        }
        guard
    }

    /// Waits until `predicate` stops holding or `deadline` passes. Returns
    /// `true` if the predicate released the wait in time.
    pub fn wait_while_until<'a, T: ?Sized, F>(
        &self,
        mut guard: MutexGuard<'a, T>,
        deadline: Instant,
        mut predicate: F,
    ) -> (MutexGuard<'a, T>, bool)
    where
        F: FnMut(&mut T) -> bool,
    {
        loop {
            if !predicate(&mut guard) {
                return (guard, true);
            }
            let (reacquired, timed_out) = self.wait_until(guard, deadline);
            guard = reacquired;
            if timed_out {
                let satisfied = !predicate(&mut guard);
                return (guard, satisfied);
            }
        }
    }

    /// Wakes one waiter.
    pub fn notify_one(&self) {
        let next = self
            .waiters
            .lock()
            .expect("condvar lock poisoned")
            .pop_front();
        if let Some(waiter) = next {
            waiter.unpark();
        }
    }

    /// Wakes every waiter.
    pub fn notify_all(&self) {
        let all: Vec<_> = {
            let mut waiters = self.waiters.lock().expect("condvar lock poisoned");
            waiters.drain(..).collect()
        };
        for waiter in all {
            waiter.unpark();
        }
    }
}

impl Default for Condvar {
    fn default() -> Condvar {
        Condvar::new()
    }
}

#[cfg(test)]
mod tests {
    use super::super::Mutex;
    use super::*;

    #[test]
    fn notify_one_wakes_a_waiter() {
        let state = Arc::new((Mutex::new(false), Condvar::new()));
        let state2 = state.clone();
        let waiter = std::thread::spawn(move || {
            let (lock, cv) = &*state2;
            let guard = lock.lock();
            let _guard = cv.wait_while(guard, |ready| !*ready);
        });
        std::thread::sleep(Duration::from_millis(20));
        {
            let (lock, cv) = &*state;
            *lock.lock() = true;
            cv.notify_one();
        }
        waiter.join().unwrap();
    }

    #[test]
    fn wait_until_times_out() {
        let state = (Mutex::new(()), Condvar::new());
        let start = Instant::now();
        let (_g, timed_out) = state
            .1
            .wait_until(state.0.lock(), start + Duration::from_millis(50));
        assert!(timed_out);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(45), "{:?}", elapsed);
    }

    #[test]
    fn notify_all_releases_everyone() {
        let state = Arc::new((Mutex::new(0usize), Condvar::new()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let state = state.clone();
                std::thread::spawn(move || {
                    let (lock, cv) = &*state;
                    let guard = lock.lock();
                    let mut guard = cv.wait_while(guard, |n| *n == 0);
                    *guard += 1;
                })
            })
            .collect();
        std::thread::sleep(Duration::from_millis(20));
        {
            let (lock, cv) = &*state;
            *lock.lock() = 1;
            cv.notify_all();
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*state.0.lock(), 5);
    }
}
