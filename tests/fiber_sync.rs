//! Cross-fiber behavior of the synchronization primitives.

mod util;

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use strand::fiber::{self, Barrier, Latch, RwLock, Semaphore};

#[test]
fn latch_under_contention() {
    util::init();
    let latch = Arc::new(Latch::new(10));

    let start = Instant::now();
    let fibers: Vec<_> = (0..10)
        .map(|_| {
            let latch = latch.clone();
            let nap = Duration::from_millis(rand::rng().random_range(0..10));
            fiber::spawn(move || {
                fiber::sleep_for(nap);
                latch.count_down(1);
            })
        })
        .collect();

    latch.wait();
    // All ten decrements took at most ~10ms each plus scheduling slack.
    assert!(start.elapsed() < Duration::from_millis(100 + 400));
    assert!(latch.try_wait());

    for f in fibers {
        f.join();
    }
}

#[test]
fn semaphore_bounds_concurrency() {
    util::init();
    let semaphore = Arc::new(Semaphore::new(3));
    let active = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let fibers: Vec<_> = (0..12)
        .map(|_| {
            let semaphore = semaphore.clone();
            let active = active.clone();
            let peak = peak.clone();
            fiber::spawn(move || {
                semaphore.acquire();
                let now = active.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                peak.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
                fiber::sleep_for(Duration::from_millis(5));
                active.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                semaphore.release(1);
            })
        })
        .collect();
    for f in fibers {
        f.join();
    }
    assert!(peak.load(std::sync::atomic::Ordering::SeqCst) <= 3);
}

#[test]
fn barrier_runs_phases_in_lockstep() {
    util::init();
    let phase_log = Arc::new(std::sync::Mutex::new(Vec::new()));
    let barrier = {
        let phase_log = phase_log.clone();
        Arc::new(Barrier::with_completion(4, move || {
            phase_log.lock().unwrap().push("phase");
        }))
    };

    let fibers: Vec<_> = (0..4)
        .map(|i| {
            let barrier = barrier.clone();
            fiber::spawn(move || {
                for _ in 0..3 {
                    fiber::sleep_for(Duration::from_millis(i));
                    barrier.arrive_and_wait();
                }
            })
        })
        .collect();
    for f in fibers {
        f.join();
    }
    assert_eq!(phase_log.lock().unwrap().len(), 3);
}

#[test]
fn rwlock_writer_not_starved_by_new_readers() {
    util::init();
    let lock = Arc::new(RwLock::new(0u32));

    let reader = lock.read();
    let writer = {
        let lock = lock.clone();
        fiber::spawn(move || {
            *lock.write() = 1;
        })
    };
    // Give the writer time to announce itself, then verify latecomers
    // cannot sneak a shared lock in.
    fiber::sleep_for(Duration::from_millis(20));
    assert!(lock.try_read().is_none());

    drop(reader);
    writer.join();
    assert_eq!(*lock.read(), 1);
}
