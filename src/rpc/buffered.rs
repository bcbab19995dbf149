//! Bounded buffering providers backing streaming RPCs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use log::debug;

use crate::fiber::timer::{self, TimerId};

use super::stream::{
    CloseCallback, PeekCallback, ReadCallback, StreamError, StreamReaderProvider,
    StreamWriterProvider, WriteCallback,
};

/// Hooks a [`BufferedReaderProvider`] reports through.
pub struct ReaderHooks {
    /// Runs (unconditionally) every time the consumer takes an object out
    /// of the buffer.
    pub on_buffer_available: Arc<dyn Fn() + Send + Sync>,
    /// Runs when the stream closes, before the consumer's own callback.
    pub on_close: Box<dyn FnOnce() + Send>,
    /// Runs after the consumer's callback, once the stream is fully done.
    pub on_cleanup: Box<dyn FnOnce() + Send>,
}

/// Read side of a streaming RPC: a bounded queue of objects (or errors)
/// fed by the transport.
///
/// Holds at most `buffer_size` objects while the consumer is idle; the
/// producer is expected to stop feeding once told to (more objects are
/// still buffered, the bound is soft).
pub struct BufferedReaderProvider<T> {
    buffer_size: usize,
    inner: Mutex<ReaderInner<T>>,
    weak_self: Weak<BufferedReaderProvider<T>>,
}

struct ReaderInner<T> {
    // Set when `close` is called or a read/peek delivered an error; not on
    // the error's arrival, so the consumer learns the stream broke.
    closed: bool,
    expiration_timer: Option<TimerId>,
    peek_cb: Option<PeekCallback<T>>,
    read_cb: Option<ReadCallback<T>>,
    objects: VecDeque<Result<T, StreamError>>,
    hooks: Option<ReaderHooks>,
    on_cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl<T: Send + 'static> BufferedReaderProvider<T> {
    /// Creates the provider.
    pub fn new(buffer_size: usize, hooks: ReaderHooks) -> Arc<BufferedReaderProvider<T>> {
        assert!(buffer_size > 0, "be sane");
        Arc::new_cyclic(|weak_self| BufferedReaderProvider {
            buffer_size,
            inner: Mutex::new(ReaderInner {
                closed: false,
                expiration_timer: None,
                peek_cb: None,
                read_cb: None,
                objects: VecDeque::new(),
                hooks: Some(hooks),
                on_cleanup: None,
            }),
            weak_self: weak_self.clone(),
        })
    }

    /// Feeds the next object (or error) in. Not to be called concurrently
    /// with itself.
    pub fn on_data_available(&self, object: Result<T, StreamError>) {
        let inner = self.inner.lock().expect("reader provider poisoned");

        if inner.closed {
            debug!("data arrived on a closed stream, dropped silently");
            return;
        }

        // Whether `object` is an error is checked on peek/read, not here.
        let mut inner = inner;
        inner.objects.push_back(object);

        let inner = self.try_complete_peek(inner);
        drop(self.try_complete_read(inner));
    }

    fn sanity_check(inner: &ReaderInner<T>) {
        assert!(
            inner.peek_cb.is_none() && inner.read_cb.is_none(),
            "there's already a pending call to `peek` or `read`"
        );
        assert!(
            !inner.closed,
            "the stream is in an error state or has already been closed"
        );
    }

    // Marks the stream closed and runs the close hook, lock released.
    // Returns with the lock dropped.
    fn notify_close(&self, mut inner: MutexGuard<'_, ReaderInner<T>>) {
        assert!(!inner.closed);
        inner.closed = true;
        let hooks = inner.hooks.take().expect("close hook already consumed");
        inner.on_cleanup = Some(hooks.on_cleanup);
        if let Some(timer_id) = inner.expiration_timer.take() {
            timer::kill_timer(timer_id);
        }
        drop(inner);
        (hooks.on_close)();
    }

    // Runs the cleanup hook. The lock must not be held.
    fn notify_cleanup(&self) {
        let cleanup = {
            let mut inner = self.inner.lock().expect("reader provider poisoned");
            inner.on_cleanup.take().expect("cleanup hook already consumed")
        };
        cleanup();
    }

    fn try_complete_peek<'a>(
        &'a self,
        mut inner: MutexGuard<'a, ReaderInner<T>>,
    ) -> MutexGuard<'a, ReaderInner<T>> {
        if inner.objects.is_empty() {
            return inner; // Nothing to peek.
        }
        let cb = match inner.peek_cb.take() {
            Some(cb) => cb,
            None => return inner, // No pending peek.
        };

        assert!(!inner.closed, "an erroneous stream should have been closed");
        let need_close = inner.objects.front().expect("checked above").is_err();
        if need_close {
            self.notify_close(inner);
            // The object stays queued; `closed` keeps producers out and the
            // single-consumer contract keeps readers out, so the reference
            // below is stable.
            let mut reacquired = self.inner.lock().expect("reader provider poisoned");
            cb(reacquired.objects.front_mut().expect("peeked object vanished"));
            drop(reacquired);
            self.notify_cleanup();
            return self.inner.lock().expect("reader provider poisoned");
        }

        cb(inner.objects.front().expect("checked above"));
        inner
    }

    fn try_complete_read<'a>(
        &'a self,
        mut inner: MutexGuard<'a, ReaderInner<T>>,
    ) -> MutexGuard<'a, ReaderInner<T>> {
        if inner.objects.is_empty() {
            return inner; // Nothing to read.
        }
        let cb = match inner.read_cb.take() {
            Some(cb) => cb,
            None => return inner, // No reader.
        };

        assert!(!inner.closed, "an erroneous stream should have been closed");
        // After popping this object the buffer is non-full again.
        let object = inner.objects.pop_front().expect("checked above");
        let need_close = object.is_err();
        let on_buffer_available = inner
            .hooks
            .as_ref()
            .expect("hooks gone before close")
            .on_buffer_available
            .clone();
        drop(inner);

        on_buffer_available(); // Called unconditionally.

        let inner = self.inner.lock().expect("reader provider poisoned");
        if need_close {
            // By the time the consumer reads an erroneous value it must
            // treat the stream as closed, so closing before its callback
            // runs is not observable to it.
            self.notify_close(inner);
        } else {
            drop(inner);
        }
        cb(object);
        if need_close {
            self.notify_cleanup();
        }
        self.inner.lock().expect("reader provider poisoned")
    }
}

impl<T: Send + 'static> StreamReaderProvider<T> for BufferedReaderProvider<T> {
    fn set_expiration(&self, expires_at: Instant) {
        let mut inner = self.inner.lock().expect("reader provider poisoned");
        if inner.closed {
            debug!("setting expiration on a closed stream has no effect");
            return;
        }
        if let Some(timer_id) = inner.expiration_timer.take() {
            timer::kill_timer(timer_id);
        }
        // Firing multiple times won't hurt; a late timer sees `closed`.
        let weak = self.weak_self.clone();
        inner.expiration_timer = Some(timer::set_timer(expires_at, move || {
            if let Some(provider) = weak.upgrade() {
                provider.on_data_available(Err(StreamError::Timeout));
            }
        }));
    }

    fn peek(&self, cb: PeekCallback<T>) {
        let mut inner = self.inner.lock().expect("reader provider poisoned");
        Self::sanity_check(&inner);
        inner.peek_cb = Some(cb);
        drop(self.try_complete_peek(inner));
    }

    fn read(&self, cb: ReadCallback<T>) {
        let mut inner = self.inner.lock().expect("reader provider poisoned");
        Self::sanity_check(&inner);
        inner.read_cb = Some(cb);
        drop(self.try_complete_read(inner));
    }

    fn close(&self, cb: CloseCallback) {
        let inner = self.inner.lock().expect("reader provider poisoned");
        Self::sanity_check(&inner);
        self.notify_close(inner);
        cb();
        self.notify_cleanup();
    }
}

impl<T> Drop for BufferedReaderProvider<T> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().expect("reader provider poisoned");
        assert!(
            inner.closed,
            "you forgot to close the stream prior to destroying it"
        );
        assert!(inner.expiration_timer.is_none());
    }
}

/// Hooks a [`BufferedWriterProvider`] reports through.
pub struct WriterHooks<T> {
    /// Issues one object to the transport.
    pub write: Box<dyn Fn(T) + Send + Sync>,
    /// Runs when the stream closes, before the consumer's own callback.
    pub on_close: Box<dyn FnOnce() + Send>,
    /// Runs after the consumer's callback, once the stream is fully done.
    pub on_cleanup: Box<dyn FnOnce() + Send>,
}

/// Write side of a streaming RPC.
///
/// While fewer than `buffer_size` writes are in flight, a write completes
/// immediately — before it was even attempted. That early "success" is
/// acceptable here since even a truly written object can still be lost on
/// the network, but it is worth keeping in mind.
pub struct BufferedWriterProvider<T> {
    buffer_size: usize,
    write: Box<dyn Fn(T) + Send + Sync>,
    inner: Mutex<WriterInner>,
    weak_self: Weak<BufferedWriterProvider<T>>,
}

struct WriterInner {
    // For assertions only; `broken` is what drives behavior.
    closed: bool,
    broken: bool,
    // Number of `write`s completed before they actually finished.
    pending_writes: usize,
    expiration_timer: Option<TimerId>,
    write_cb: Option<WriteCallback>,
    last_write_cb: Option<WriteCallback>,
    close_cb: Option<CloseCallback>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
    on_cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl<T: Send + 'static> BufferedWriterProvider<T> {
    /// Creates the provider.
    pub fn new(buffer_size: usize, hooks: WriterHooks<T>) -> Arc<BufferedWriterProvider<T>> {
        assert!(
            buffer_size > 0,
            "allow at least one uncompleted write (that disables buffering altogether)"
        );
        Arc::new_cyclic(|weak_self| BufferedWriterProvider {
            buffer_size,
            write: hooks.write,
            inner: Mutex::new(WriterInner {
                closed: false,
                broken: false,
                pending_writes: 0,
                expiration_timer: None,
                write_cb: None,
                last_write_cb: None,
                close_cb: None,
                on_close: Some(hooks.on_close),
                on_cleanup: Some(hooks.on_cleanup),
            }),
            weak_self: weak_self.clone(),
        })
    }

    /// Reports completion of one transport write.
    ///
    /// Successful completions pair with writes one to one. A single
    /// failure completion is enough to fail every pending write.
    pub fn on_write_completion(&self, success: bool) {
        let mut inner = self.inner.lock().expect("writer provider poisoned");

        if inner.broken {
            // Every pending operation completed the moment we first
            // learned the stream broke.
            debug_assert!(
                inner.write_cb.is_none()
                    && inner.last_write_cb.is_none()
                    && inner.close_cb.is_none()
            );
            return;
        }

        if !success {
            inner.broken = true;
        }

        if inner.pending_writes > 0 {
            inner.pending_writes -= 1;
            debug_assert!(inner.pending_writes < self.buffer_size);
        } else {
            // More completions than writes should be impossible; however
            // the transport blindly reports failure on broken media or
            // timeout, which lands here. Ignore it.
            debug_assert!(inner.broken);
            debug!("write completion without a pending write, lower layer broken?");
            return;
        }

        // At most one pending operation may exist.
        debug_assert!(
            (inner.write_cb.is_some() as usize)
                + (inner.last_write_cb.is_some() as usize)
                + (inner.close_cb.is_some() as usize)
                <= 1
        );

        // A blocked write unblocks now. Because of buffering, this
        // completion belongs to an *earlier* write; unblocking the current
        // one is, again, an early completion.
        if let Some(cb) = inner.write_cb.take() {
            debug_assert!(inner.last_write_cb.is_none() && inner.close_cb.is_none());
            drop(inner);
            cb(success);
            // Nothing else can be pending; return before the consumer's
            // callback possibly frees us.
            return;
        }

        // If the buffer has drained and a "last write" (or close) waits,
        // fire it. On error it fires early; the outcome is failure anyway.
        if inner.pending_writes == 0 || !success {
            let last_write_cb = inner.last_write_cb.take();
            let close_cb = inner.close_cb.take();
            let notify_close = last_write_cb.is_some() || close_cb.is_some();
            debug_assert!(last_write_cb.is_none() || close_cb.is_none());

            if notify_close {
                self.notify_close(inner);
            } else {
                drop(inner);
            }
            if let Some(cb) = last_write_cb {
                cb(success);
            } // The stream counts as closed once the last-write cb ran.
            if let Some(cb) = close_cb {
                cb();
            }
            if notify_close {
                self.notify_cleanup();
            }
        }
    }

    fn sanity_check(inner: &WriterInner) {
        assert!(
            inner.write_cb.is_none() && inner.last_write_cb.is_none() && inner.close_cb.is_none(),
            "operation being performed on this stream has not completed yet"
        );
        assert!(!inner.closed, "the stream has been closed");
    }

    // Returns with the lock dropped and the close hook run.
    fn notify_close(&self, mut inner: MutexGuard<'_, WriterInner>) {
        debug_assert!(inner.write_cb.is_none() && inner.last_write_cb.is_none());
        assert!(!inner.closed);
        inner.closed = true;
        let on_close = inner.on_close.take().expect("close hook already consumed");
        if let Some(timer_id) = inner.expiration_timer.take() {
            timer::kill_timer(timer_id);
        }
        drop(inner);
        on_close();
    }

    fn notify_cleanup(&self) {
        let cleanup = {
            let mut inner = self.inner.lock().expect("writer provider poisoned");
            inner.on_cleanup.take().expect("cleanup hook already consumed")
        };
        cleanup();
    }
}

impl<T: Send + 'static> StreamWriterProvider<T> for BufferedWriterProvider<T> {
    fn set_expiration(&self, expires_at: Instant) {
        let mut inner = self.inner.lock().expect("writer provider poisoned");
        if inner.closed {
            debug!("setting expiration on a closed stream has no effect");
            return;
        }
        if let Some(timer_id) = inner.expiration_timer.take() {
            timer::kill_timer(timer_id);
        }
        let weak = self.weak_self.clone();
        inner.expiration_timer = Some(timer::set_timer(expires_at, move || {
            if let Some(provider) = weak.upgrade() {
                provider.on_write_completion(false);
            }
        }));
    }

    fn write(&self, object: T, last: bool, cb: WriteCallback) {
        let mut inner = self.inner.lock().expect("writer provider poisoned");
        Self::sanity_check(&inner);

        // `closed` flips when the last-write callback runs, not here.

        if inner.broken {
            // Complete immediately; a last write also closes the stream.
            if last {
                self.notify_close(inner);
            } else {
                drop(inner);
            }
            cb(false);
            if last {
                self.notify_cleanup();
            }
            return;
        }

        inner.pending_writes += 1;
        if last {
            // The last write's completion waits for a full flush.
            inner.last_write_cb = Some(cb);
            drop(inner);
        } else if inner.pending_writes < self.buffer_size {
            // Room left: early completion.
            drop(inner);
            cb(true);
        } else {
            inner.write_cb = Some(cb);
            drop(inner);
        }

        // Issue the write, lock released.
        (self.write)(object);
    }

    fn close(&self, cb: CloseCallback) {
        let mut inner = self.inner.lock().expect("writer provider poisoned");
        Self::sanity_check(&inner);

        if inner.pending_writes > 0 && !inner.broken {
            // Deferred exactly like a last-write callback;
            // `on_write_completion` picks it up.
            inner.close_cb = Some(cb);
        } else {
            self.notify_close(inner);
            cb();
            self.notify_cleanup();
        }
    }
}

impl<T> Drop for BufferedWriterProvider<T> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().expect("writer provider poisoned");
        assert!(
            inner.closed,
            "you forgot to close the stream prior to destroying it"
        );
        assert!(inner.expiration_timer.is_none());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn reader_hooks(
        consumed: &Arc<AtomicUsize>,
        closed: &Arc<AtomicUsize>,
        cleaned: &Arc<AtomicUsize>,
    ) -> ReaderHooks {
        let consumed = consumed.clone();
        let closed = closed.clone();
        let cleaned = cleaned.clone();
        ReaderHooks {
            on_buffer_available: Arc::new(move || {
                consumed.fetch_add(1, Ordering::SeqCst);
            }),
            on_close: Box::new(move || {
                closed.fetch_add(1, Ordering::SeqCst);
            }),
            on_cleanup: Box::new(move || {
                cleaned.fetch_add(1, Ordering::SeqCst);
            }),
        }
    }

    #[test]
    fn reader_buffers_and_preserves_order() {
        let consumed = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let cleaned = Arc::new(AtomicUsize::new(0));
        let provider =
            BufferedReaderProvider::new(10, reader_hooks(&consumed, &closed, &cleaned));

        for i in 0..5 {
            provider.on_data_available(Ok(i));
        }
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        for _ in 0..5 {
            let seen = seen.clone();
            provider.read(Box::new(move |object| {
                seen.lock().unwrap().push(object.unwrap());
            }));
        }
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(consumed.load(Ordering::SeqCst), 5);

        provider.close(Box::new(|| {}));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reader_satisfies_pending_read_on_arrival() {
        let consumed = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let cleaned = Arc::new(AtomicUsize::new(0));
        let provider =
            BufferedReaderProvider::new(4, reader_hooks(&consumed, &closed, &cleaned));

        let got = Arc::new(AtomicUsize::new(0));
        let got2 = got.clone();
        provider.read(Box::new(move |object| {
            got2.store(object.unwrap(), Ordering::SeqCst);
        }));
        assert_eq!(got.load(Ordering::SeqCst), 0);
        provider.on_data_available(Ok(42));
        assert_eq!(got.load(Ordering::SeqCst), 42);

        provider.close(Box::new(|| {}));
    }

    #[test]
    fn reader_error_closes_before_callback() {
        let consumed = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let cleaned = Arc::new(AtomicUsize::new(0));
        let provider: Arc<BufferedReaderProvider<u32>> =
            BufferedReaderProvider::new(4, reader_hooks(&consumed, &closed, &cleaned));

        provider.on_data_available(Err(StreamError::IoError));
        let closed_at_cb = Arc::new(AtomicUsize::new(usize::MAX));
        let closed_at_cb2 = closed_at_cb.clone();
        let closed2 = closed.clone();
        provider.read(Box::new(move |object| {
            assert_eq!(object.unwrap_err(), StreamError::IoError);
            closed_at_cb2.store(closed2.load(Ordering::SeqCst), Ordering::SeqCst);
        }));
        // The close hook ran before the consumer's callback.
        assert_eq!(closed_at_cb.load(Ordering::SeqCst), 1);
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reader_expiration_synthesizes_timeout() {
        let consumed = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let cleaned = Arc::new(AtomicUsize::new(0));
        let provider: Arc<BufferedReaderProvider<u32>> =
            BufferedReaderProvider::new(10, reader_hooks(&consumed, &closed, &cleaned));

        provider.set_expiration(Instant::now() + Duration::from_millis(100));
        let start = Instant::now();
        let done = Arc::new(crate::fiber::Latch::new(1));
        let done2 = done.clone();
        provider.read(Box::new(move |object| {
            assert_eq!(object.unwrap_err(), StreamError::Timeout);
            done2.count_down(1);
        }));
        done.wait();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(90), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(400), "{:?}", elapsed);
    }

    #[test]
    fn writer_completes_early_until_buffer_full() {
        let issued = Arc::new(AtomicUsize::new(0));
        let issued2 = issued.clone();
        let provider: Arc<BufferedWriterProvider<u32>> = BufferedWriterProvider::new(
            2,
            WriterHooks {
                write: Box::new(move |_| {
                    issued2.fetch_add(1, Ordering::SeqCst);
                }),
                on_close: Box::new(|| {}),
                on_cleanup: Box::new(|| {}),
            },
        );

        let early = Arc::new(AtomicUsize::new(0));
        let early2 = early.clone();
        provider.write(
            1,
            false,
            Box::new(move |ok| {
                assert!(ok);
                early2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        // First write completed synchronously (1 < buffer_size).
        assert_eq!(early.load(Ordering::SeqCst), 1);
        assert_eq!(issued.load(Ordering::SeqCst), 1);

        // Second write fills the buffer; its callback parks until a
        // completion arrives.
        let parked = Arc::new(AtomicUsize::new(0));
        let parked2 = parked.clone();
        provider.write(
            2,
            false,
            Box::new(move |ok| {
                assert!(ok);
                parked2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(parked.load(Ordering::SeqCst), 0);
        provider.on_write_completion(true);
        assert_eq!(parked.load(Ordering::SeqCst), 1);

        provider.on_write_completion(true);
        provider.close(Box::new(|| {}));
    }

    #[test]
    fn writer_last_write_waits_for_flush() {
        let provider: Arc<BufferedWriterProvider<u32>> = BufferedWriterProvider::new(
            4,
            WriterHooks {
                write: Box::new(|_| {}),
                on_close: Box::new(|| {}),
                on_cleanup: Box::new(|| {}),
            },
        );

        provider.write(1, false, Box::new(|ok| assert!(ok)));
        let finished = Arc::new(AtomicUsize::new(0));
        let finished2 = finished.clone();
        provider.write(
            2,
            true,
            Box::new(move |ok| {
                assert!(ok);
                finished2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        // Two writes outstanding; the last-write callback waits for both.
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        provider.on_write_completion(true);
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        provider.on_write_completion(true);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn writer_failure_fails_further_writes() {
        let provider: Arc<BufferedWriterProvider<u32>> = BufferedWriterProvider::new(
            1,
            WriterHooks {
                write: Box::new(|_| {}),
                on_close: Box::new(|| {}),
                on_cleanup: Box::new(|| {}),
            },
        );

        let first = Arc::new(AtomicUsize::new(usize::MAX));
        let first2 = first.clone();
        provider.write(
            1,
            false,
            Box::new(move |ok| {
                first2.store(ok as usize, Ordering::SeqCst);
            }),
        );
        provider.on_write_completion(false);
        assert_eq!(first.load(Ordering::SeqCst), 0);

        let second = Arc::new(AtomicUsize::new(usize::MAX));
        let second2 = second.clone();
        provider.write(
            2,
            true,
            Box::new(move |ok| {
                second2.store(ok as usize, Ordering::SeqCst);
            }),
        );
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }
}
