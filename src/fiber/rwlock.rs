//! A reader-writer lock for fibers, optimized for rare writers.
//!
//! Performance-wise a reader-writer lock only pays off with sizable
//! critical sections; for tiny read paths prefer a snapshot or a plain
//! [`Mutex`](super::Mutex).

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI32, Ordering};

use super::mutex::MutexGuard;
use super::{Condvar, Mutex};

const MAX_READERS: i32 = 0x3fff_ffff;

/// A shared/exclusive lock whose waits suspend only the calling fiber.
///
/// Readers take a single `fetch_sub` on an atomic quota in the fast path; a
/// writer seizes the lock by subtracting the whole quota and waiting for
/// active readers to drain. Readers arriving while a writer is in (or
/// waiting) observe a non-positive quota and park until the releasing
/// writer grants them fresh permits, so a writer only ever waits for the
/// readers that were already active — suited to writer-rare workloads.
pub struct RwLock<T: ?Sized> {
    // Positive if no writer is pending; a pending writer drives it ≤ 0.
    reader_quota: AtomicI32,

    // Synchronizes parked readers and the draining writer.
    wakeup_lock: Mutex<WakeState>,
    wakeup_cv: Condvar,

    // At most one writer may wait on the reader quota at a time.
    writer_lock: Mutex<()>,

    data: UnsafeCell<T>,
}

#[derive(Default)]
struct WakeState {
    exited_readers: i32,
    newly_granted_readers: i32,
}

unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates an unlocked lock holding `value`.
    pub fn new(value: T) -> RwLock<T> {
        RwLock {
            reader_quota: AtomicI32::new(MAX_READERS),
            wakeup_lock: Mutex::new(WakeState::default()),
            wakeup_cv: Condvar::new(),
            writer_lock: Mutex::new(()),
            data: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Acquires the lock in shared mode.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let was = self.reader_quota.fetch_sub(1, Ordering::Acquire);
        debug_assert!(was != 1, "reader quota underflow");
        if was <= 1 {
            // A writer holds (or is draining) the lock; wait for a grant.
            self.wait_for_read();
        }
        RwLockReadGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Acquires the lock in shared mode if no writer is in or pending.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        let mut was = self.reader_quota.load(Ordering::Relaxed);
        loop {
            debug_assert!(was <= MAX_READERS);
            if was <= 0 {
                return None;
            }
            match self.reader_quota.compare_exchange_weak(
                was,
                was - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(RwLockReadGuard {
                        lock: self,
                        _not_send: PhantomData,
                    })
                }
                Err(current) => was = current,
            }
        }
    }

    /// Acquires the lock in exclusive mode.
    ///
    /// The write side is the slow path by design.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        let writer_guard = self.writer_lock.lock();
        let was = self.reader_quota.fetch_sub(MAX_READERS, Ordering::Acquire);
        debug_assert!(was > 0 && was <= MAX_READERS);
        if was != MAX_READERS {
            // Wait for the readers that were already in to leave; newcomers
            // already see a non-positive quota and park.
            let pending = MAX_READERS - was;
            let guard = self.wakeup_lock.lock();
            let mut guard = self
                .wakeup_cv
                .wait_while(guard, |s| s.exited_readers != pending);
            guard.exited_readers = 0;
        }
        RwLockWriteGuard {
            lock: self,
            _writer_guard: Some(writer_guard),
            _not_send: PhantomData,
        }
    }

    /// Acquires the lock in exclusive mode if free of readers and writers.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        let writer_guard = self.writer_lock.try_lock()?;
        if self
            .reader_quota
            .compare_exchange(MAX_READERS, 0, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return None; // Active readers out there; drops writer_guard.
        }
        Some(RwLockWriteGuard {
            lock: self,
            _writer_guard: Some(writer_guard),
            _not_send: PhantomData,
        })
    }

    fn wait_for_read(&self) {
        let guard = self.wakeup_lock.lock();
        let mut guard = self
            .wakeup_cv
            .wait_while(guard, |s| s.newly_granted_readers == 0);
        guard.newly_granted_readers -= 1;
    }

    fn unlock_shared(&self) {
        let was = self.reader_quota.fetch_add(1, Ordering::Release);
        debug_assert!(was < MAX_READERS);
        if was < 0 {
            // A writer is draining us; report the exit.
            let mut guard = self.wakeup_lock.lock();
            guard.exited_readers += 1;
            self.wakeup_cv.notify_all();
        }
    }

    fn unlock_exclusive(&self) {
        let guard = self.wakeup_lock.lock();
        let was = self.reader_quota.fetch_add(MAX_READERS, Ordering::Release);
        debug_assert!(was <= 0, "exclusive unlock with readers inside");
        if was != 0 {
            // `-was` readers queued up while we held the lock; grant them
            // their permits. A newcomer may snatch a grant from an older
            // reader, which is tolerable with writers being rare.
            let mut guard = guard;
            guard.newly_granted_readers = -was;
            self.wakeup_cv.notify_all();
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_read() {
            Some(guard) => f.debug_struct("RwLock").field("data", &&*guard).finish(),
            None => f.debug_struct("RwLock").field("data", &"<locked>").finish(),
        }
    }
}

/// Shared-mode guard returned by [`RwLock::read`].
pub struct RwLockReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T: ?Sized> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_shared();
    }
}

/// Exclusive-mode guard returned by [`RwLock::write`].
pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
    _writer_guard: Option<MutexGuard<'a, ()>>,
    _not_send: PhantomData<*const ()>,
}

impl<T: ?Sized> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_exclusive();
        // The writer mutex is released afterwards, letting the next writer
        // in only once the quota is restored.
        self._writer_guard.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn readers_share() {
        let lock = RwLock::new(7);
        let a = lock.read();
        let b = lock.read();
        assert_eq!(*a + *b, 14);
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = Arc::new(RwLock::new(0));
        let mut w = lock.write();
        *w = 1;
        assert!(lock.try_read().is_none());
        drop(w);
        assert_eq!(*lock.read(), 1);
    }

    #[test]
    fn try_write_fails_under_readers() {
        let lock = RwLock::new(());
        let r = lock.read();
        assert!(lock.try_write().is_none());
        drop(r);
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn writer_waits_for_active_readers_only() {
        let lock = Arc::new(RwLock::new(0u32));
        let reader = lock.read();
        let lock2 = lock.clone();
        let writer = std::thread::spawn(move || {
            let mut guard = lock2.write();
            *guard += 1;
        });
        std::thread::sleep(Duration::from_millis(20));
        // Writer is parked on us; new try_lock_shared attempts must fail.
        assert!(lock.try_read().is_none());
        drop(reader);
        writer.join().unwrap();
        assert_eq!(*lock.read(), 1);
    }

    #[test]
    fn contended_mixed_load() {
        let lock = Arc::new(RwLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let lock = lock.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    *lock.write() += 1;
                }
            }));
        }
        for _ in 0..4 {
            let lock = lock.clone();
            handles.push(std::thread::spawn(move || {
                let mut last = 0;
                for _ in 0..500 {
                    let seen = *lock.read();
                    assert!(seen >= last);
                    last = seen;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.read(), 400);
    }
}
