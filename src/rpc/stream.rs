//! Typed asynchronous streams over pluggable providers.
//!
//! Reading from / writing to the stream types defined here is not
//! thread-safe; each half has a single consumer.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::base::oneshot::{self, Future};

/// Why a stream operation could not produce a value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamError {
    /// Normal termination; the stream must not be touched again except to
    /// destroy it.
    EndOfStream,
    /// Transport failure or framing error.
    IoError,
    /// The deadline set via `set_expiration` elapsed.
    Timeout,
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::EndOfStream => write!(f, "end of stream"),
            StreamError::IoError => write!(f, "I/O error"),
            StreamError::Timeout => write!(f, "timed out"),
        }
    }
}

impl std::error::Error for StreamError {}

/// Callback flavors handed to providers.
pub type ReadCallback<T> = Box<dyn FnOnce(Result<T, StreamError>) + Send>;
/// Peek observes the front object without consuming it.
pub type PeekCallback<T> = Box<dyn FnOnce(&Result<T, StreamError>) + Send>;
/// Write completion: `true` on success.
pub type WriteCallback = Box<dyn FnOnce(bool) + Send>;
/// Close completion.
pub type CloseCallback = Box<dyn FnOnce() + Send>;

/// The read side a stream implementation plugs in.
///
/// At most one `peek` or `read` may be outstanding. On failure the
/// callback receives a failed result; `read` itself never fails. Once an
/// error has been delivered the stream is implicitly closed and no more
/// reads are allowed.
pub trait StreamReaderProvider<T>: Send + Sync {
    /// Arms a deadline after which the stream is considered broken.
    fn set_expiration(&self, expires_at: Instant);

    /// Calls `cb` with a reference to the first object without removing
    /// it.
    fn peek(&self, cb: PeekCallback<T>);

    /// Consumes the next object (or error) in the stream.
    fn read(&self, cb: ReadCallback<T>);

    /// Closes the stream. `cb` runs once the close took effect; a close
    /// callback fires exactly once per stream.
    fn close(&self, cb: CloseCallback);
}

/// The write side a stream implementation plugs in.
///
/// At most one operation may be outstanding. Once a write has failed, all
/// further writes must complete with failure immediately.
pub trait StreamWriterProvider<T>: Send + Sync {
    /// Arms a deadline after which the stream is considered broken.
    fn set_expiration(&self, expires_at: Instant);

    /// Writes `object`. With `last` set, close is implied and `cb` may
    /// only fire after every pending write has flushed.
    fn write(&self, object: T, last: bool, cb: WriteCallback);

    /// Closes the stream, flushing pending writes first.
    fn close(&self, cb: CloseCallback);
}

/// Future-returning reader over a [`StreamReaderProvider`].
pub struct AsyncStreamReader<T> {
    provider: Arc<dyn StreamReaderProvider<T>>,
}

impl<T: Send + 'static> AsyncStreamReader<T> {
    /// Wraps `provider`.
    pub fn new(provider: Arc<dyn StreamReaderProvider<T>>) -> AsyncStreamReader<T> {
        AsyncStreamReader { provider }
    }

    /// May be called at most once, before any other method.
    pub fn set_expiration(&self, expires_at: Instant) {
        self.provider.set_expiration(expires_at);
    }

    /// Reports whether the next read would succeed, without consuming.
    ///
    /// Until the returned future resolves, no other method may be called.
    pub fn peek(&self) -> Future<Result<(), StreamError>> {
        let (promise, future) = oneshot::channel();
        self.provider.peek(Box::new(move |front| {
            promise.set_value(front.as_ref().map(|_| ()).map_err(|e| *e));
        }));
        future
    }

    /// Consumes the next object.
    ///
    /// Until the returned future resolves, no other method may be called.
    /// After an error, the stream may only be destroyed.
    pub fn read(&self) -> Future<Result<T, StreamError>> {
        let (promise, future) = oneshot::channel();
        self.provider.read(Box::new(move |object| {
            promise.set_value(object);
        }));
        future
    }

    /// Closes the stream.
    pub fn close(&self) -> Future<()> {
        let (promise, future) = oneshot::channel();
        self.provider.close(Box::new(move || promise.set_value(())));
        future
    }
}

/// Future-returning writer over a [`StreamWriterProvider`].
pub struct AsyncStreamWriter<T> {
    provider: Arc<dyn StreamWriterProvider<T>>,
}

impl<T: Send + 'static> AsyncStreamWriter<T> {
    /// Wraps `provider`.
    pub fn new(provider: Arc<dyn StreamWriterProvider<T>>) -> AsyncStreamWriter<T> {
        AsyncStreamWriter { provider }
    }

    /// May be called at most once, before any other method.
    pub fn set_expiration(&self, expires_at: Instant) {
        self.provider.set_expiration(expires_at);
    }

    /// Writes `object`. Due to buffering a success may be reported before
    /// the bytes reach the wire (see [`write_last`](Self::write_last) for
    /// the flushed variant).
    ///
    /// After a failure, every further write fails immediately; close the
    /// stream via [`close`](Self::close) or [`write_last`](Self::write_last).
    pub fn write(&self, object: T) -> Future<bool> {
        let (promise, future) = oneshot::channel();
        self.provider
            .write(object, false, Box::new(move |ok| promise.set_value(ok)));
        future
    }

    /// Writes `object` and closes the stream. Success guarantees every
    /// prior write flushed.
    pub fn write_last(&self, object: T) -> Future<bool> {
        let (promise, future) = oneshot::channel();
        self.provider
            .write(object, true, Box::new(move |ok| promise.set_value(ok)));
        future
    }

    /// Closes the stream. Whether pending writes flush or drop is
    /// unspecified; use [`write_last`](Self::write_last) when it matters.
    pub fn close(&self) -> Future<()> {
        let (promise, future) = oneshot::channel();
        self.provider.close(Box::new(move || promise.set_value(())));
        future
    }
}

/// Blocking wrapper over [`AsyncStreamReader`].
pub struct StreamReader<T> {
    inner: AsyncStreamReader<T>,
}

impl<T: Send + 'static> StreamReader<T> {
    /// Wraps `provider`.
    pub fn new(provider: Arc<dyn StreamReaderProvider<T>>) -> StreamReader<T> {
        StreamReader {
            inner: AsyncStreamReader::new(provider),
        }
    }

    /// See [`AsyncStreamReader::set_expiration`].
    pub fn set_expiration(&self, expires_at: Instant) {
        self.inner.set_expiration(expires_at);
    }

    /// Blocking [`AsyncStreamReader::peek`].
    pub fn peek(&self) -> Result<(), StreamError> {
        self.inner.peek().wait()
    }

    /// Blocking [`AsyncStreamReader::read`].
    pub fn read(&self) -> Result<T, StreamError> {
        self.inner.read().wait()
    }

    /// Blocking [`AsyncStreamReader::close`].
    pub fn close(&self) {
        self.inner.close().wait()
    }
}

impl<T> From<AsyncStreamReader<T>> for StreamReader<T> {
    fn from(inner: AsyncStreamReader<T>) -> StreamReader<T> {
        StreamReader { inner }
    }
}

/// Blocking wrapper over [`AsyncStreamWriter`].
pub struct StreamWriter<T> {
    inner: AsyncStreamWriter<T>,
}

impl<T: Send + 'static> StreamWriter<T> {
    /// Wraps `provider`.
    pub fn new(provider: Arc<dyn StreamWriterProvider<T>>) -> StreamWriter<T> {
        StreamWriter {
            inner: AsyncStreamWriter::new(provider),
        }
    }

    /// See [`AsyncStreamWriter::set_expiration`].
    pub fn set_expiration(&self, expires_at: Instant) {
        self.inner.set_expiration(expires_at);
    }

    /// Blocking [`AsyncStreamWriter::write`].
    pub fn write(&self, object: T) -> bool {
        self.inner.write(object).wait()
    }

    /// Blocking [`AsyncStreamWriter::write_last`].
    pub fn write_last(&self, object: T) -> bool {
        self.inner.write_last(object).wait()
    }

    /// Blocking [`AsyncStreamWriter::close`].
    pub fn close(&self) {
        self.inner.close().wait()
    }
}

impl<T> From<AsyncStreamWriter<T>> for StreamWriter<T> {
    fn from(inner: AsyncStreamWriter<T>) -> StreamWriter<T> {
        StreamWriter { inner }
    }
}
