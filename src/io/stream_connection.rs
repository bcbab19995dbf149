//! A connected byte-stream socket driven by an event loop.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, warn};

use super::stream_io::SystemStreamIo;
use super::writing_buffer_list::WritingBufferList;
use super::{Descriptor, EventLoop, Interest, Ready, Token};

// Bytes read from the socket per `read(2)`, and written per flush round.
const READ_CHUNK: usize = 16 * 1024;
const FLUSH_QUANTUM: usize = 128 * 1024;

/// What the connection should do with bytes it has handed to the handler.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataConsumptionStatus {
    /// Keep reading.
    Consumed,
    /// Stop reading until [`StreamConnection::restart_read`].
    SuppressRead,
    /// The byte stream is beyond recovery; tear the connection down.
    Error,
}

/// Callbacks a [`StreamConnection`] delivers from its owning loop.
pub trait StreamConnectionHandler: Send + Sync {
    /// New bytes are available. Consumed bytes should be split off
    /// `buffer`; whatever remains is presented again next time.
    fn on_data_arrival(&self, buffer: &mut BytesMut, at: Instant) -> DataConsumptionStatus;

    /// A buffer queued via [`StreamConnection::write`] has been fully
    /// written out. `ctx` is the value passed to `write`.
    fn on_data_written(&self, ctx: usize);

    /// The write-buffer list drained completely.
    fn on_write_buffer_empty(&self) {}

    /// The remote side closed the connection. Delivered at most once, and
    /// never after `on_error`.
    fn on_close(&self);

    /// The connection failed. Delivered at most once, and never after
    /// `on_close`.
    fn on_error(&self);
}

/// A non-blocking connected socket attached to an event loop.
///
/// Reads are delivered to the handler from the loop; writes from any
/// thread are staged in a [`WritingBufferList`] and flushed on the loop.
pub struct StreamConnection {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    fd: OwnedFd,
    handler: Weak<dyn StreamConnectionHandler>,
    binding: OnceLock<(Arc<EventLoop>, Token)>,
    // Only the loop thread touches the read buffer.
    read_buffer: Mutex<BytesMut>,
    writing_buffers: WritingBufferList,
    // > 0 while the handler asked us not to read. A restart may race ahead
    // of the suppression that triggered it, hence a counter, not a flag.
    suppressions: AtomicI32,
    broken: AtomicBool,
    weak_self: Weak<ConnInner>,
}

impl StreamConnection {
    /// Wraps a connected non-blocking socket.
    pub fn new(fd: OwnedFd, handler: Weak<dyn StreamConnectionHandler>) -> StreamConnection {
        StreamConnection {
            inner: Arc::new_cyclic(|weak_self| ConnInner {
                fd,
                handler,
                binding: OnceLock::new(),
                read_buffer: Mutex::new(BytesMut::new()),
                writing_buffers: WritingBufferList::new(),
                suppressions: AtomicI32::new(0),
                broken: AtomicBool::new(false),
                weak_self: weak_self.clone(),
            }),
        }
    }

    /// Registers the connection with `event_loop` and starts reading.
    pub fn attach_to(&self, event_loop: Arc<EventLoop>) -> io::Result<()> {
        let token = event_loop.attach_descriptor(self.inner.clone(), false)?;
        self.inner
            .binding
            .set((event_loop.clone(), token))
            .unwrap_or_else(|_| panic!("connection attached twice"));
        event_loop.enable_descriptor(token)
    }

    /// The raw descriptor, for loop selection.
    pub fn fd(&self) -> RawFd {
        self.inner.fd.as_raw_fd()
    }

    /// Queues `buffer` for writing; `ctx` is reported back through
    /// [`StreamConnectionHandler::on_data_written`] once it is fully on
    /// the wire.
    ///
    /// Returns `false` if the connection is already broken.
    pub fn write(&self, buffer: Bytes, ctx: usize) -> bool {
        self.inner.write(buffer, ctx)
    }

    /// Resumes reading after the handler returned
    /// [`DataConsumptionStatus::SuppressRead`].
    ///
    /// Works even if it lands before the suppressing callback returned.
    pub fn restart_read(&self) {
        self.inner.restart_read();
    }

    /// Tears the connection down without an error; the handler sees
    /// `on_close` once pending loop work drains.
    pub fn close(&self) {
        self.inner.shutdown(false);
    }
}

impl ConnInner {
    // All ConnInner instances live inside an `Arc`, so this always
    // succeeds while a `&self` borrow exists.
    fn strong_self(&self) -> Arc<ConnInner> {
        self.weak_self.upgrade().expect("connection inner vanished")
    }

    fn write(&self, buffer: Bytes, ctx: usize) -> bool {
        if self.broken.load(Ordering::Relaxed) {
            return false;
        }
        if self.writing_buffers.append(buffer, ctx) {
            // First writer after the list drained; a flush is on us. All
            // flushing happens on the loop to serialize with the writable
            // callback.
            if let Some((event_loop, _)) = self.binding.get() {
                if event_loop.is_current() {
                    self.flush_writes();
                } else {
                    let inner = self.strong_self();
                    event_loop.add_task(move || inner.flush_writes());
                }
            }
        }
        true
    }

    fn restart_read(&self) {
        self.suppressions.fetch_sub(1, Ordering::AcqRel);
        if let Some((event_loop, _)) = self.binding.get() {
            let inner = self.strong_self();
            event_loop.add_task(move || {
                if inner.suppressions.load(Ordering::Acquire) <= 0 {
                    inner.handle_readable();
                }
            });
        }
    }

    fn handle_readable(&self) {
        if self.broken.load(Ordering::Relaxed) || self.suppressions.load(Ordering::Acquire) > 0 {
            return;
        }
        let mut buffer = self.read_buffer.lock().expect("read buffer poisoned");
        loop {
            // Present buffered bytes before reading more: after a
            // suppression is lifted there may be whole frames waiting that
            // no further traffic would ever flush out.
            if !buffer.is_empty() {
                let status = match self.handler.upgrade() {
                    Some(handler) => handler.on_data_arrival(&mut buffer, Instant::now()),
                    None => return,
                };
                match status {
                    DataConsumptionStatus::Consumed => {}
                    DataConsumptionStatus::SuppressRead => {
                        self.suppressions.fetch_add(1, Ordering::AcqRel);
                        return;
                    }
                    DataConsumptionStatus::Error => {
                        drop(buffer);
                        self.shutdown(true);
                        return;
                    }
                }
            }

            buffer.reserve(READ_CHUNK);
            let chunk = buffer.chunk_mut();
            let capacity = chunk.len();
            let n = match syscall!(read(
                self.fd.as_raw_fd(),
                chunk.as_mut_ptr().cast(),
                capacity
            )) {
                Ok(n) => n as usize,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("read failed on fd #{}: {}", self.fd.as_raw_fd(), e);
                    drop(buffer);
                    self.shutdown(true);
                    return;
                }
            };
            if n == 0 {
                // Remote close.
                drop(buffer);
                self.shutdown(false);
                return;
            }
            // SAFETY: `read(2)` initialized `n` bytes of the spare chunk.
            unsafe { buffer.advance_mut(n) };
        }
    }

    fn flush_writes(&self) {
        if self.broken.load(Ordering::Relaxed) {
            return;
        }
        let io = SystemStreamIo::new(self.fd.as_raw_fd());
        loop {
            let mut ctxs = Vec::new();
            let mut emptied = false;
            let mut short_write = false;
            match self
                .writing_buffers
                .flush_to(&io, FLUSH_QUANTUM, &mut ctxs, &mut emptied, &mut short_write)
            {
                Ok(_) => {
                    if let Some(handler) = self.handler.upgrade() {
                        for ctx in ctxs {
                            handler.on_data_written(ctx);
                        }
                        if emptied {
                            handler.on_write_buffer_empty();
                        }
                    }
                    if emptied {
                        return;
                    }
                    if short_write {
                        // A genuine short write on a ready socket; the peer
                        // has likely gone away.
                        self.shutdown(true);
                        return;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("write failed on fd #{}: {}", self.fd.as_raw_fd(), e);
                    self.shutdown(true);
                    return;
                }
            }
        }
    }

    // Exactly-once teardown; `errored` selects which handler callback runs.
    fn shutdown(&self, errored: bool) {
        if self.broken.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = self.strong_self();
        let unregister_and_notify = move || {
            if let Some((event_loop, token)) = inner.binding.get() {
                if let Err(e) = event_loop.disable_descriptor(*token) {
                    debug!("failed to disable fd #{}: {}", inner.fd.as_raw_fd(), e);
                }
                event_loop.detach_descriptor(*token);
            }
            if let Some(handler) = inner.handler.upgrade() {
                if errored {
                    handler.on_error();
                } else {
                    handler.on_close();
                }
            }
        };
        match self.binding.get() {
            Some((event_loop, _)) if !event_loop.is_current() => {
                event_loop.add_task(unregister_and_notify);
            }
            _ => unregister_and_notify(),
        }
    }
}

impl Descriptor for ConnInner {
    fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn interest(&self) -> Interest {
        Interest::READABLE | Interest::WRITABLE
    }

    fn fire_events(self: Arc<Self>, ready: Ready, _at: Instant) {
        if ready.is_error() {
            self.shutdown(true);
            return;
        }
        if ready.is_readable() {
            self.handle_readable();
        }
        if ready.is_writable() {
            self.flush_writes();
        }
    }

    fn name(&self) -> &str {
        "stream connection"
    }
}
