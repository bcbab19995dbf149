//! An MPSC queue staging outbound buffers for one socket.
//!
//! Any number of producers append; a single consumer (the event loop's
//! writable path) drains the queue into one vectored write. Appending to an
//! empty list makes the producer responsible for scheduling that flush,
//! which is how many writers funnel into one syscall site without a lock.

use std::cell::UnsafeCell;
use std::io::{self, IoSlice};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use bytes::{Buf, Bytes};

use super::stream_io::StreamIo;

struct Node {
    next: AtomicPtr<Node>,
    // Only the consumer touches these after the node is linked in.
    buffer: UnsafeCell<Bytes>,
    ctx: usize,
}

/// The multi-producer single-consumer writing buffer list.
pub struct WritingBufferList {
    // Where the last flush left off. Consumer-owned, except that the
    // producer reviving an empty list seeds it.
    head: AtomicPtr<Node>,
    // The last node; producers contend on this.
    tail: AtomicPtr<Node>,
}

unsafe impl Send for WritingBufferList {}
unsafe impl Sync for WritingBufferList {}

impl WritingBufferList {
    /// Creates an empty list.
    pub fn new() -> WritingBufferList {
        WritingBufferList {
            head: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Appends `buffer` for writing. `ctx` is reported through `flushed_ctxs`
    /// of [`flush_to`](Self::flush_to) once the buffer has been written out
    /// in its entirety.
    ///
    /// Safe to call from any thread. Returns `true` if the list was empty
    /// before, in which case the caller is responsible for getting a flush
    /// scheduled.
    pub fn append(&self, buffer: Bytes, ctx: usize) -> bool {
        let node = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            buffer: UnsafeCell::new(buffer),
            ctx,
        }));
        let prev = self.tail.swap(node, Ordering::AcqRel);
        if prev.is_null() {
            // The list was empty; we own the head now. The consumer only
            // runs after this append reports "was empty", so the store
            // cannot race a flush.
            self.head.store(node, Ordering::Release);
            true
        } else {
            // SAFETY: `prev` came out of `tail`, so it has not been freed:
            // the consumer does not release a tail node before unlinking it
            // from `tail` first.
            unsafe { (*prev).next.store(node, Ordering::Release) };
            false
        }
    }

    /// Flushes buffered data into `io`, up to `max_bytes` bytes, with one
    /// vectored write.
    ///
    /// Only one thread may call this at a time. Returns the number of bytes
    /// written; the return value can be less than `max_bytes` even when
    /// more could be written, so callers keep flushing until either the
    /// write fails with `WouldBlock` or `short_write` is set (a genuine
    /// short write; on a socket, the peer has likely closed).
    ///
    /// On success, `flushed_ctxs` receives the `ctx` of every buffer that
    /// was *fully* written, in append order. `emptied` reports whether this
    /// call drained the list.
    pub fn flush_to(
        &self,
        io: &dyn StreamIo,
        max_bytes: usize,
        flushed_ctxs: &mut Vec<usize>,
        emptied: &mut bool,
        short_write: &mut bool,
    ) -> io::Result<usize> {
        *emptied = false;
        *short_write = false;

        let head = self.head.load(Ordering::Acquire);
        if head.is_null() {
            *emptied = true;
            return Ok(0);
        }

        // Gather slices across nodes, bounded by `max_bytes`.
        let mut slices: Vec<IoSlice<'_>> = Vec::new();
        let mut offered = 0;
        let mut cursor = head;
        while !cursor.is_null() && offered < max_bytes {
            // SAFETY: nodes between `head` and `tail` stay alive until the
            // consumer (us) frees them below.
            let buffer = unsafe { &*(*cursor).buffer.get() };
            let take = buffer.len().min(max_bytes - offered);
            if take > 0 {
                slices.push(IoSlice::new(&buffer[..take]));
                offered += take;
            }
            cursor = unsafe { (*cursor).next.load(Ordering::Acquire) };
        }

        let written = io.write_vectored(&slices)?;
        *short_write = written < offered;

        // Advance `head` across everything that went out.
        let mut remaining = written;
        let mut cursor = head;
        loop {
            // SAFETY: as above; we have not freed `cursor` yet.
            let node = unsafe { &*cursor };
            let buffer = unsafe { &mut *node.buffer.get() };
            if remaining < buffer.len() {
                buffer.advance(remaining);
                self.head.store(cursor, Ordering::Release);
                break;
            }
            remaining -= buffer.len();
            flushed_ctxs.push(node.ctx);

            let next = node.next.load(Ordering::Acquire);
            if next.is_null() {
                // `cursor` looks like the tail. Clear `head` *before*
                // detaching the tail: the instant the tail CAS succeeds, a
                // producer may seed `head` again, and we must not clobber
                // that store.
                self.head.store(ptr::null_mut(), Ordering::Release);
                if self
                    .tail
                    .compare_exchange(cursor, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    // SAFETY: unlinked from both `head` and `tail`; no
                    // producer obtained `cursor` from `tail` since the CAS
                    // observed it unchanged.
                    drop(unsafe { Box::from_raw(cursor) });
                    *emptied = true;
                    break;
                }
                // A producer is in the middle of appending after `cursor`;
                // its `next` store lands momentarily.
                let mut next = node.next.load(Ordering::Acquire);
                while next.is_null() {
                    std::hint::spin_loop();
                    next = node.next.load(Ordering::Acquire);
                }
                self.head.store(next, Ordering::Release);
                drop(unsafe { Box::from_raw(cursor) });
                if remaining == 0 {
                    break;
                }
                cursor = next;
            } else {
                self.head.store(next, Ordering::Release);
                // SAFETY: fully drained and unlinked.
                drop(unsafe { Box::from_raw(cursor) });
                if remaining == 0 {
                    break;
                }
                cursor = next;
            }
        }
        debug_assert_eq!(remaining, 0, "wrote more than we offered");

        Ok(written)
    }
}

impl Default for WritingBufferList {
    fn default() -> WritingBufferList {
        WritingBufferList::new()
    }
}

impl Drop for WritingBufferList {
    fn drop(&mut self) {
        // Free whatever never got flushed.
        let mut cursor = *self.head.get_mut();
        while !cursor.is_null() {
            let node = unsafe { Box::from_raw(cursor) };
            cursor = node.next.load(Ordering::Relaxed);
        }
    }
}
