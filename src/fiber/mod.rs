//! Fibers and their synchronization primitives.
//!
//! A fiber is a lightweight unit of cooperative work pinned to a
//! *scheduling group*. Every primitive in this module suspends only the
//! calling fiber — never unrelated work on the same group — and the
//! mutex/condvar pair tolerates release from a different OS thread than
//! the acquiring one, since fibers may migrate between workers.
//!
//! The crate does not prescribe a particular fiber scheduler; here each
//! fiber is backed by a dedicated worker thread tagged with its scheduling
//! group, which satisfies the same contract.

mod barrier;
mod condvar;
mod latch;
mod mutex;
mod park;
mod rwlock;
mod semaphore;
pub mod timer;
mod work_queue;

pub use barrier::{ArrivalToken, Barrier};
pub use condvar::Condvar;
pub use latch::Latch;
pub use mutex::{Mutex, MutexGuard};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use semaphore::{BinarySemaphore, CountingSemaphore, Semaphore};
pub use work_queue::WorkQueue;

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// Number of scheduling groups, fixed at runtime start.
static SCHEDULING_GROUPS: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static CURRENT_GROUP: Cell<usize> = const { Cell::new(0) };
}

/// Returns the number of scheduling groups the runtime was started with.
pub fn scheduling_group_count() -> usize {
    SCHEDULING_GROUPS.load(Ordering::Relaxed)
}

/// Returns the scheduling group of the calling fiber.
///
/// Threads not owned by the runtime report group 0.
pub fn current_scheduling_group() -> usize {
    CURRENT_GROUP.with(|g| g.get())
}

pub(crate) fn set_scheduling_group_count(count: usize) {
    debug_assert!(count > 0);
    SCHEDULING_GROUPS.store(count, Ordering::Relaxed);
}

/// A handle to a spawned fiber.
///
/// Dropping the handle detaches the fiber; [`join`](Fiber::join) blocks
/// until it finishes.
pub struct Fiber {
    done: Arc<Latch>,
}

impl Fiber {
    /// Waits for the fiber to finish.
    pub fn join(self) {
        self.done.wait();
    }
}

/// Spawns a fiber in the caller's scheduling group.
pub fn spawn<F>(f: F) -> Fiber
where
    F: FnOnce() + Send + 'static,
{
    spawn_in_group(current_scheduling_group(), f)
}

/// Spawns a fiber pinned to `scheduling_group`.
pub fn spawn_in_group<F>(scheduling_group: usize, f: F) -> Fiber
where
    F: FnOnce() + Send + 'static,
{
    debug_assert!(scheduling_group < scheduling_group_count());
    let done = Arc::new(Latch::new(1));
    let done2 = done.clone();
    std::thread::Builder::new()
        .name(format!("strand-fiber/{}", scheduling_group))
        .spawn(move || {
            CURRENT_GROUP.with(|g| g.set(scheduling_group));
            f();
            done2.count_down(1);
        })
        .expect("failed to spawn fiber worker");
    Fiber { done }
}

/// Lets other fibers on this worker make progress.
pub fn yield_now() {
    std::thread::yield_now();
}

/// Suspends the calling fiber for `duration`.
pub fn sleep_for(duration: Duration) {
    std::thread::sleep(duration);
}

/// Suspends the calling fiber until `deadline`.
pub fn sleep_until(deadline: Instant) {
    let now = Instant::now();
    if deadline > now {
        std::thread::sleep(deadline - now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_and_join() {
        let latch = Arc::new(Latch::new(1));
        let latch2 = latch.clone();
        let fiber = spawn(move || latch2.count_down(1));
        fiber.join();
        assert!(latch.try_wait());
    }

    #[test]
    fn group_is_inherited() {
        set_scheduling_group_count(2);
        let fiber = spawn_in_group(1, || {
            assert_eq!(current_scheduling_group(), 1);
            let inner = spawn(|| assert_eq!(current_scheduling_group(), 1));
            inner.join();
        });
        fiber.join();
    }
}
