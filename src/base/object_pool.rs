//! A small free-list object pool.
//!
//! Call sites that allocate the same short-lived structure at a very high
//! rate (one per RPC) recycle them here instead of round-tripping through
//! the allocator. Objects are handed out as [`Pooled<T>`] smart pointers
//! that return to the pool on drop.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A type that can be recycled through a [`Pool`].
pub trait Poolable: Send + 'static {
    /// Number of idle objects the pool retains unconditionally.
    const LOW_WATER_MARK: usize = 8192;
    /// Idle objects beyond the low-water mark are dropped once they have
    /// been unused for this long.
    const MAX_IDLE: Duration = Duration::from_secs(10);

    /// Creates a fresh object.
    fn new_pooled() -> Self;

    /// Resets the object before it re-enters the free list.
    ///
    /// Implementations should assert their own "fully consumed" invariants
    /// here (e.g. a completion callback that must have been taken).
    fn on_put(&mut self);
}

/// A free-list pool of `T`.
pub struct Pool<T: Poolable> {
    free: Mutex<FreeList<T>>,
}

struct FreeList<T> {
    entries: Vec<Box<T>>,
    last_trim: Option<Instant>,
}

impl<T: Poolable> Pool<T> {
    /// Creates an empty pool.
    pub const fn new() -> Pool<T> {
        Pool {
            free: Mutex::new(FreeList {
                entries: Vec::new(),
                last_trim: None,
            }),
        }
    }

    /// Takes an object from the pool, creating one if the free list is
    /// empty.
    pub fn get(&'static self) -> Pooled<T> {
        let recycled = {
            let mut free = self.free.lock().expect("object pool lock poisoned");
            free.entries.pop()
        };
        let object = recycled.unwrap_or_else(|| Box::new(T::new_pooled()));
        Pooled {
            pool: self,
            object: Some(object),
        }
    }

    fn put(&self, mut object: Box<T>) {
        object.on_put();
        let now = Instant::now();
        let mut free = self.free.lock().expect("object pool lock poisoned");
        free.entries.push(object);

        // Trim idle surplus at most once per idle period; the exact
        // recycling moment is not important.
        let due = match free.last_trim {
            Some(at) => now.saturating_duration_since(at) >= T::MAX_IDLE,
            None => {
                free.last_trim = Some(now);
                false
            }
        };
        if due {
            free.last_trim = Some(now);
            if free.entries.len() > T::LOW_WATER_MARK {
                free.entries.truncate(T::LOW_WATER_MARK);
            }
        }
    }
}

/// An object borrowed from a [`Pool`]; returns on drop.
pub struct Pooled<T: Poolable> {
    pool: &'static Pool<T>,
    object: Option<Box<T>>,
}

impl<T: Poolable> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.object.as_ref().expect("pooled object already returned")
    }
}

impl<T: Poolable> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.object.as_mut().expect("pooled object already returned")
    }
}

impl<T: Poolable> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            self.pool.put(object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static CREATED: AtomicUsize = AtomicUsize::new(0);
    static RESET: AtomicUsize = AtomicUsize::new(0);

    struct Counted {
        scratch: usize,
    }

    impl Poolable for Counted {
        const LOW_WATER_MARK: usize = 4;

        fn new_pooled() -> Counted {
            CREATED.fetch_add(1, Ordering::Relaxed);
            Counted { scratch: 0 }
        }

        fn on_put(&mut self) {
            RESET.fetch_add(1, Ordering::Relaxed);
            self.scratch = 0;
        }
    }

    static POOL: Pool<Counted> = Pool::new();

    #[test]
    fn objects_are_recycled() {
        {
            let mut a = POOL.get();
            a.scratch = 42;
        }
        let created = CREATED.load(Ordering::Relaxed);
        let b = POOL.get();
        assert_eq!(b.scratch, 0, "on_put must reset state");
        assert_eq!(CREATED.load(Ordering::Relaxed), created, "expected reuse");
        assert!(RESET.load(Ordering::Relaxed) >= 1);
    }
}
