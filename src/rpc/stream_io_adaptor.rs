//! Bridges a callback-driven transport into a pair of typed streams.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use log::warn;

use crate::fiber::{self, WorkQueue};

use super::buffered::{BufferedReaderProvider, BufferedWriterProvider, ReaderHooks, WriterHooks};
use super::stream::{AsyncStreamReader, AsyncStreamWriter, StreamError};

/// Transport-side operations an adaptor drives.
pub struct Operations<T> {
    /// Finalizes the protocol-specific parse of an incoming message.
    pub try_parse: Box<dyn Fn(&mut T) -> bool + Send + Sync>,
    /// Schedules one outgoing message on the transport. Returns `false`
    /// if the write could not even be scheduled.
    pub write: Box<dyn Fn(&T) -> bool + Send + Sync>,
    /// Tells the transport to resume reading after back-pressure lifted.
    ///
    /// May be invoked even before the `notify_read` that triggered the
    /// suspension returns; transports must tolerate that ordering.
    pub restart_read: Box<dyn Fn() + Send + Sync>,
    /// Runs when both the reader and the writer have closed, before the
    /// closing callbacks complete.
    pub on_close: Box<dyn FnOnce() + Send>,
    /// Runs once every pending callback has finished; it is safe to tear
    /// the adaptor down from here (indirectly — see the reaper queue in
    /// the call gate).
    pub on_cleanup: Box<dyn FnOnce() + Send>,
}

struct OnceOps {
    on_close: Option<Box<dyn FnOnce() + Send>>,
    on_cleanup: Option<Box<dyn FnOnce() + Send>>,
}

/// Turns "here is a message" / "please write this" callbacks into an
/// [`AsyncStreamReader`] / [`AsyncStreamWriter`] pair with bounded
/// buffering.
///
/// All callouts — both into the transport operations and into user
/// callbacks — are serialized through an internal work queue. Wait for
/// [`flush_pending_calls`](Self::flush_pending_calls) before destroying
/// the adaptor.
pub struct StreamIoAdaptor<T: Send + 'static> {
    buffer_size: usize,
    ops: Arc<SharedOps<T>>,
    work_queue: WorkQueue,
    weak_self: Weak<StreamIoAdaptor<T>>,

    // Messages fed to the reader provider and not yet consumed.
    unacked_msgs: AtomicUsize,
    // Writes issued to the transport and not yet acknowledged.
    unacked_writes: AtomicUsize,
    // Reaches 0 once both reader and writer closed.
    remaining_users: AtomicI32,
    // Reaches 0 once both halves also cleaned up; only ever touched from
    // the work queue.
    alive_streams: AtomicI32,

    reader_provider: Arc<BufferedReaderProvider<T>>,
    writer_provider: Arc<BufferedWriterProvider<T>>,
}

struct SharedOps<T> {
    try_parse: Box<dyn Fn(&mut T) -> bool + Send + Sync>,
    write: Box<dyn Fn(&T) -> bool + Send + Sync>,
    restart_read: Box<dyn Fn() + Send + Sync>,
    once: std::sync::Mutex<OnceOps>,
}

impl<T: Send + 'static> StreamIoAdaptor<T> {
    /// Creates an adaptor buffering at most `buffer_size` unconsumed
    /// messages (a soft limit) and as many unacknowledged writes.
    pub fn new(buffer_size: usize, ops: Operations<T>) -> Arc<StreamIoAdaptor<T>> {
        assert!(buffer_size > 0);
        let shared_ops = Arc::new(SharedOps {
            try_parse: ops.try_parse,
            write: ops.write,
            restart_read: ops.restart_read,
            once: std::sync::Mutex::new(OnceOps {
                on_close: Some(ops.on_close),
                on_cleanup: Some(ops.on_cleanup),
            }),
        });
        Arc::new_cyclic(|weak: &Weak<StreamIoAdaptor<T>>| {
            let reader_provider = BufferedReaderProvider::new(buffer_size, ReaderHooks {
                on_buffer_available: {
                    let weak = weak.clone();
                    Arc::new(move || {
                        if let Some(adaptor) = weak.upgrade() {
                            adaptor.on_input_consumption();
                        }
                    })
                },
                on_close: {
                    let weak = weak.clone();
                    Box::new(move || {
                        if let Some(adaptor) = weak.upgrade() {
                            adaptor.on_input_closed();
                        }
                    })
                },
                on_cleanup: {
                    let weak = weak.clone();
                    Box::new(move || {
                        if let Some(adaptor) = weak.upgrade() {
                            adaptor.on_input_cleanup();
                        }
                    })
                },
            });
            let writer_provider = BufferedWriterProvider::new(buffer_size, WriterHooks {
                write: {
                    let weak = weak.clone();
                    Box::new(move |message| {
                        if let Some(adaptor) = weak.upgrade() {
                            adaptor.on_output_produced(message);
                        }
                    })
                },
                on_close: {
                    let weak = weak.clone();
                    Box::new(move || {
                        if let Some(adaptor) = weak.upgrade() {
                            adaptor.on_output_closed();
                        }
                    })
                },
                on_cleanup: {
                    let weak = weak.clone();
                    Box::new(move || {
                        if let Some(adaptor) = weak.upgrade() {
                            adaptor.on_output_cleanup();
                        }
                    })
                },
            });
            StreamIoAdaptor {
                buffer_size,
                ops: shared_ops,
                work_queue: WorkQueue::new(),
                weak_self: weak.clone(),
                unacked_msgs: AtomicUsize::new(0),
                unacked_writes: AtomicUsize::new(0),
                remaining_users: AtomicI32::new(2),
                alive_streams: AtomicI32::new(2),
                reader_provider,
                writer_provider,
            }
        })
    }

    /// The reader half handed to the consumer.
    pub fn stream_reader(&self) -> AsyncStreamReader<T> {
        AsyncStreamReader::new(self.reader_provider.clone())
    }

    /// The writer half handed to the consumer.
    pub fn stream_writer(&self) -> AsyncStreamWriter<T> {
        AsyncStreamWriter::new(self.writer_provider.clone())
    }

    // All instances live inside an `Arc` (see `new`), so this always
    // succeeds while a `&self` borrow exists.
    fn strong_self(&self) -> Arc<StreamIoAdaptor<T>> {
        self.weak_self.upgrade().expect("adaptor vanished")
    }

    /// Feeds one incoming message. Returns `true` once the internal buffer
    /// has filled up — the transport should suspend reading (the message
    /// is still buffered).
    pub fn notify_read(&self, message: T) -> bool {
        // Tested before the job is queued, to pair suspensions with the
        // message that caused them.
        let suppress =
            self.unacked_msgs.fetch_add(1, Ordering::Relaxed) >= self.buffer_size - 1;

        let adaptor = self.strong_self();
        self.work_queue.push(move || {
            let mut message = message;
            if (adaptor.ops.try_parse)(&mut message) {
                adaptor.reader_provider.on_data_available(Ok(message));
            } else {
                warn!("cannot parse streaming message, treated as an I/O error");
                adaptor
                    .reader_provider
                    .on_data_available(Err(StreamError::IoError));
            }
        });
        suppress
    }

    /// Feeds an error (end-of-stream included) to the reader side.
    pub fn notify_error(&self, error: StreamError) {
        self.unacked_msgs.fetch_add(1, Ordering::Relaxed);
        let adaptor = self.strong_self();
        self.work_queue.push(move || {
            adaptor.reader_provider.on_data_available(Err(error));
        });
    }

    /// Acknowledges one transport write issued by this adaptor.
    pub fn notify_write_completion(&self) {
        self.unacked_writes.fetch_sub(1, Ordering::Relaxed);
        let adaptor = self.strong_self();
        self.work_queue.push(move || {
            adaptor.writer_provider.on_write_completion(true);
        });
    }

    /// Reports that the I/O media under this stream broke.
    pub fn break_stream(&self) {
        self.unacked_msgs.fetch_add(1, Ordering::Relaxed);
        let adaptor = self.strong_self();
        self.work_queue.push(move || {
            adaptor
                .reader_provider
                .on_data_available(Err(StreamError::EndOfStream));
            adaptor.writer_provider.on_write_completion(false);
        });
    }

    /// Blocks until every scheduled callback has returned.
    pub fn flush_pending_calls(&self) {
        self.work_queue.stop();
        self.work_queue.join();
    }

    /// Writes issued to the transport but not yet acknowledged.
    pub fn unacked_writes(&self) -> usize {
        self.unacked_writes.load(Ordering::Relaxed)
    }

    // Reader consumed one message.
    fn on_input_consumption(&self) {
        if self.unacked_msgs.fetch_sub(1, Ordering::Relaxed) == self.buffer_size {
            // Crossed from full back to non-full.
            (self.ops.restart_read)();
        }
    }

    fn on_input_closed(&self) {
        let was = self.remaining_users.fetch_sub(1, Ordering::Relaxed);
        if was == 1 {
            self.on_stream_closed();
        } else {
            debug_assert_eq!(was, 2);
        }
    }

    fn on_input_cleanup(&self) {
        let adaptor = self.strong_self();
        self.work_queue.push(move || {
            if adaptor.unacked_msgs.load(Ordering::Relaxed) >= adaptor.buffer_size {
                // The stream had suspended reading on this connection and
                // its consumer is gone; nobody else will ever lift the
                // suppression, so do it here.
                (adaptor.ops.restart_read)();
            }
            adaptor.on_half_cleaned_up();
        });
    }

    fn on_output_produced(&self, message: T) {
        // `ops.write` below may call `notify_write_completion` before it
        // even returns, which can run the whole close/cleanup cascade and
        // free us under our own feet. Block the work queue from draining
        // until the bookkeeping is done; as long as it has not drained,
        // `flush_pending_calls` keeps us alive.
        let blocking_task = self.post_work_queue_blocking_task();

        self.unacked_writes.fetch_add(1, Ordering::Relaxed);
        if !(self.ops.write)(&message) {
            self.unacked_writes.fetch_sub(1, Ordering::Relaxed);
            let adaptor = self.strong_self();
            self.work_queue.push(move || {
                adaptor.writer_provider.on_write_completion(false);
            });
        }
        blocking_task.store(true, Ordering::Release);
    }

    fn on_output_closed(&self) {
        let was = self.remaining_users.fetch_sub(1, Ordering::Relaxed);
        if was == 1 {
            self.on_stream_closed();
        } else {
            debug_assert_eq!(was, 2);
        }
    }

    fn on_output_cleanup(&self) {
        let adaptor = self.strong_self();
        self.work_queue.push(move || {
            adaptor.on_half_cleaned_up();
        });
    }

    fn on_stream_closed(&self) {
        let on_close = self
            .ops
            .once
            .lock()
            .expect("adaptor ops poisoned")
            .on_close
            .take()
            .expect("stream closed twice");
        on_close();
    }

    // Runs on the work queue.
    fn on_half_cleaned_up(&self) {
        let alive = self.alive_streams.fetch_sub(1, Ordering::Relaxed) - 1;
        if alive == 0 {
            let on_cleanup = self
                .ops
                .once
                .lock()
                .expect("adaptor ops poisoned")
                .on_cleanup
                .take()
                .expect("stream cleaned up twice");
            on_cleanup();
        } else {
            debug_assert_eq!(alive, 1);
        }
    }

    // Posts a job that spins until the returned flag is set, pinning the
    // work queue (and therefore us) in place.
    fn post_work_queue_blocking_task(&self) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        let task_flag = flag.clone();
        self.work_queue.push(move || {
            while !task_flag.load(Ordering::Acquire) {
                // Shouldn't take long, if we spin at all.
                fiber::yield_now();
            }
        });
        flag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Harness {
        written: Arc<Mutex<Vec<u32>>>,
        restarts: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
        cleaned: Arc<AtomicUsize>,
    }

    fn make_adaptor(buffer_size: usize) -> (Arc<StreamIoAdaptor<u32>>, Harness) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let restarts = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let cleaned = Arc::new(AtomicUsize::new(0));
        let adaptor = StreamIoAdaptor::new(buffer_size, Operations {
            try_parse: Box::new(|_| true),
            write: {
                let written = written.clone();
                Box::new(move |m| {
                    written.lock().unwrap().push(*m);
                    true
                })
            },
            restart_read: {
                let restarts = restarts.clone();
                Box::new(move || {
                    restarts.fetch_add(1, Ordering::SeqCst);
                })
            },
            on_close: {
                let closed = closed.clone();
                Box::new(move || {
                    closed.fetch_add(1, Ordering::SeqCst);
                })
            },
            on_cleanup: {
                let cleaned = cleaned.clone();
                Box::new(move || {
                    cleaned.fetch_add(1, Ordering::SeqCst);
                })
            },
        });
        (
            adaptor,
            Harness {
                written,
                restarts,
                closed,
                cleaned,
            },
        )
    }

    #[test]
    fn messages_flow_to_the_reader_in_order() {
        let (adaptor, _harness) = make_adaptor(16);
        let reader = adaptor.stream_reader();
        let writer = adaptor.stream_writer();

        for i in 0..5 {
            adaptor.notify_read(i);
        }
        for i in 0..5 {
            assert_eq!(reader.read().wait().unwrap(), i);
        }

        reader.close().wait();
        writer.close().wait();
        adaptor.flush_pending_calls();
    }

    #[test]
    fn backpressure_reports_and_restarts_once() {
        let (adaptor, harness) = make_adaptor(4);
        let reader = adaptor.stream_reader();
        let writer = adaptor.stream_writer();

        assert!(!adaptor.notify_read(0));
        assert!(!adaptor.notify_read(1));
        assert!(!adaptor.notify_read(2));
        // Fourth message fills the buffer.
        assert!(adaptor.notify_read(3));

        for i in 0..4 {
            assert_eq!(reader.read().wait().unwrap(), i);
        }
        // Wait for queue work (parse jobs) to settle, then check the
        // restart count: exactly one full→non-full transition happened.
        assert_eq!(harness.restarts.load(Ordering::SeqCst), 1);

        reader.close().wait();
        writer.close().wait();
        adaptor.flush_pending_calls();
        assert_eq!(harness.closed.load(Ordering::SeqCst), 1);
        assert_eq!(harness.cleaned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn writes_reach_the_transport_in_order() {
        let (adaptor, harness) = make_adaptor(8);
        let reader = adaptor.stream_reader();
        let writer = adaptor.stream_writer();

        for i in 0..5 {
            assert!(writer.write(i).wait());
            // The write was issued to the transport but not yet
            // acknowledged.
            assert_eq!(adaptor.unacked_writes(), 1);
            adaptor.notify_write_completion();
            assert_eq!(adaptor.unacked_writes(), 0);
        }
        // Writes pass through the work queue; close below drains it.
        writer.close().wait();
        reader.close().wait();
        adaptor.flush_pending_calls();
        assert_eq!(*harness.written.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(harness.closed.load(Ordering::SeqCst), 1);
        assert_eq!(harness.cleaned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn break_fails_both_halves() {
        let (adaptor, _harness) = make_adaptor(8);
        let reader = adaptor.stream_reader();
        let writer = adaptor.stream_writer();

        // One write stays unacknowledged so the writer learns of the break
        // through its completion.
        assert!(writer.write(9).wait());
        adaptor.break_stream();

        assert_eq!(reader.read().wait().unwrap_err(), StreamError::EndOfStream);
        // The buffered writer marked itself broken; further writes fail.
        assert!(!writer.write(10).wait());

        writer.close().wait();
        adaptor.flush_pending_calls();
    }

    #[test]
    fn close_precedes_cleanup() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let adaptor = StreamIoAdaptor::new(4, Operations {
            try_parse: Box::new(|_: &mut u32| true),
            write: Box::new(|_| true),
            restart_read: Box::new(|| {}),
            on_close: {
                let events = events.clone();
                Box::new(move || events.lock().unwrap().push("close"))
            },
            on_cleanup: {
                let events = events.clone();
                Box::new(move || events.lock().unwrap().push("cleanup"))
            },
        });
        let reader = adaptor.stream_reader();
        let writer = adaptor.stream_writer();

        reader.close().wait();
        writer.close().wait();
        adaptor.flush_pending_calls();
        assert_eq!(*events.lock().unwrap(), vec!["close", "cleanup"]);
    }
}
