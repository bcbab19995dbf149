//! Batched numeric ID allocation.
//!
//! Handing out IDs straight from a global atomic is cheap, but on hot paths
//! even a contended `fetch_add` shows up. Instead each thread grabs a batch
//! of IDs at a time and serves allocations from it locally.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::LocalKey;

/// Describes an ID space: its bounds, the per-thread batch size, and the
/// storage backing it.
///
/// Implementors declare one global cursor and one thread-local batch cell,
/// typically via [`define_id_space!`](crate::define_id_space).
pub trait IdTraits: 'static {
    /// Smallest ID ever returned.
    const MIN: u32;
    /// Largest ID ever returned. Allocation wraps back to `MIN` past it.
    const MAX: u32;
    /// Number of IDs a thread reserves at a time.
    ///
    /// Too large a batch shrinks the reuse window (a mostly-idle thread sits
    /// on unissued IDs); too small a batch degrades to the global atomic.
    const BATCH_SIZE: u32;

    /// The global cursor of this ID space.
    fn cursor() -> &'static AtomicU64;

    /// This thread's `(next, remaining)` batch for this ID space.
    fn local_batch() -> &'static LocalKey<Cell<(u32, u32)>>;
}

/// Declares an ID space: a zero-sized type implementing
/// [`IdTraits`](crate::base::id_alloc::IdTraits) with its own cursor and
/// thread-local batch storage.
#[macro_export]
macro_rules! define_id_space {
    ($vis: vis $name: ident, min: $min: expr, max: $max: expr, batch: $batch: expr) => {
        $vis struct $name;

        impl $crate::base::id_alloc::IdTraits for $name {
            const MIN: u32 = $min;
            const MAX: u32 = $max;
            const BATCH_SIZE: u32 = $batch;

            fn cursor() -> &'static std::sync::atomic::AtomicU64 {
                static CURSOR: std::sync::atomic::AtomicU64 =
                    std::sync::atomic::AtomicU64::new(0);
                &CURSOR
            }

            fn local_batch()
            -> &'static std::thread::LocalKey<std::cell::Cell<(u32, u32)>> {
                thread_local! {
                    static BATCH: std::cell::Cell<(u32, u32)> =
                        const { std::cell::Cell::new((0, 0)) };
                }
                &BATCH
            }
        }
    };
}

/// Returns the next ID in `T`'s space.
pub fn next<T: IdTraits>() -> u32 {
    T::local_batch().with(|cell| {
        let (cur, remaining) = cell.get();
        if remaining != 0 {
            cell.set((cur.wrapping_add(1), remaining - 1));
            return cur;
        }
        let (start, count) = grab_batch::<T>();
        cell.set((start.wrapping_add(1), count - 1));
        start
    })
}

// Reserves `count` IDs starting at `start` from the global cursor, wrapping
// inside `[MIN, MAX]`.
fn grab_batch<T: IdTraits>() -> (u32, u32) {
    debug_assert!(T::MIN < T::MAX);
    debug_assert!(T::BATCH_SIZE > 0);
    let span = (T::MAX - T::MIN) as u64 + 1;
    let batch = u64::from(T::BATCH_SIZE);
    let raw = T::cursor().fetch_add(batch, Ordering::Relaxed);
    let offset = raw % span;
    let start = T::MIN as u64 + offset;
    // Never straddle the wrap point; a short batch once per wrap is fine.
    let count = std::cmp::min(batch, span - offset);
    (start as u32, count as u32)
}
