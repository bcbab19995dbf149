//! The contract between the call gate and a wire protocol.

use std::any::Any;

use bytes::{Bytes, BytesMut};

/// A parsed protocol message.
///
/// The gate only needs the correlation ID and the end-of-stream marker;
/// everything else is protocol-private and reached by downcasting.
pub trait Message: Send + 'static {
    /// The per-RPC correlation ID this message belongs to.
    fn correlation_id(&self) -> u32;

    /// Whether this message marks the end of the reader direction of a
    /// streaming RPC.
    fn end_of_stream(&self) -> bool {
        false
    }

    /// Downcasting hook for protocol consumers.
    fn as_any(&self) -> &dyn Any;
}

/// Outcome of one parse attempt on the connection's receive buffer.
pub enum ParseStatus {
    /// One complete message was cut from the buffer.
    Parsed(Box<dyn Message>),
    /// The buffer does not contain a complete frame yet.
    NeedMore,
    /// One frame was skipped as malformed; only the RPC it belonged to
    /// fails.
    SkipFrame {
        /// Correlation ID of the RPC whose frame was dropped.
        correlation_id: u32,
    },
    /// The byte stream is desynchronized; the connection is unusable.
    Corrupted,
}

/// Per-connection traits of a protocol, folded into pool keys.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionCharacteristics {
    /// Whether concurrent RPCs may share one connection.
    pub multiplexable: bool,
}

/// A wire protocol plugged into a call gate.
pub trait Protocol: Send + Sync + 'static {
    /// Tries to cut one message from `buffer`, advancing it past consumed
    /// bytes.
    fn try_parse(&self, buffer: &mut BytesMut) -> ParseStatus;

    /// Serializes `message` into a wire frame.
    fn serialize(&self, message: &dyn Message) -> Bytes;

    /// How connections speaking this protocol may be shared.
    fn characteristics(&self) -> ConnectionCharacteristics;

    /// Finalizes a message handed to a streaming RPC's reader. Returning
    /// `false` fails the message as unparsable.
    fn try_complete_parse(&self, _message: &mut Box<dyn Message>) -> bool {
        true
    }
}
