//! Streams that fail every operation with a preset error.
//!
//! Handed out in place of real streams when a call failed before its
//! stream could be wired up.

use std::sync::Mutex;
use std::time::Instant;

use super::stream::{
    CloseCallback, PeekCallback, ReadCallback, StreamError, StreamReaderProvider,
    StreamWriterProvider, WriteCallback,
};

/// Reader whose every operation reports `error`.
pub struct ErrorStreamReaderProvider<T> {
    error: Mutex<Result<T, StreamError>>,
}

impl<T: Send> ErrorStreamReaderProvider<T> {
    /// Creates the provider.
    pub fn new(error: StreamError) -> ErrorStreamReaderProvider<T> {
        ErrorStreamReaderProvider {
            error: Mutex::new(Err(error)),
        }
    }
}

impl<T: Send> StreamReaderProvider<T> for ErrorStreamReaderProvider<T> {
    fn set_expiration(&self, _expires_at: Instant) {}

    fn peek(&self, cb: PeekCallback<T>) {
        cb(&self.error.lock().expect("error stream poisoned"));
    }

    fn read(&self, cb: ReadCallback<T>) {
        let error = *self
            .error
            .lock()
            .expect("error stream poisoned")
            .as_ref()
            .err()
            .expect("error stream holds an error by construction");
        cb(Err(error));
    }

    fn close(&self, cb: CloseCallback) {
        cb();
    }
}

/// Writer whose every operation fails.
pub struct ErrorStreamWriterProvider;

impl<T: Send> StreamWriterProvider<T> for ErrorStreamWriterProvider {
    fn set_expiration(&self, _expires_at: Instant) {}

    fn write(&self, _object: T, _last: bool, cb: WriteCallback) {
        cb(false);
    }

    fn close(&self, cb: CloseCallback) {
        cb();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn reader_reports_the_configured_error() {
        let provider: Arc<ErrorStreamReaderProvider<u32>> =
            Arc::new(ErrorStreamReaderProvider::new(StreamError::IoError));
        let reader = crate::rpc::AsyncStreamReader::new(provider);
        assert_eq!(reader.peek().wait(), Err(StreamError::IoError));
        assert_eq!(reader.read().wait().unwrap_err(), StreamError::IoError);
        reader.close().wait();
    }

    #[test]
    fn writer_fails_everything() {
        let provider = Arc::new(ErrorStreamWriterProvider);
        let writer = crate::rpc::AsyncStreamWriter::<u32>::new(provider);
        assert!(!writer.write(1).wait());
        assert!(!writer.write_last(2).wait());
        writer.close().wait();
    }
}
