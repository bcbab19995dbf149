//! Client-side RPC orchestration: correlation, streams, call gates and
//! their pools.

pub mod buffered;
pub mod call_gate;
pub mod correlation;
pub mod error_stream;
pub mod gate_pool;
pub mod protocol;
pub mod stream;
pub mod stream_io_adaptor;

pub use call_gate::{CallStatus, FastCallArgs, StreamCallGate, Timestamps};
pub use gate_pool::{GateHandle, PoolOptions, StreamCallGatePool};
pub use protocol::{ConnectionCharacteristics, Message, ParseStatus, Protocol};
pub use stream::{
    AsyncStreamReader, AsyncStreamWriter, StreamError, StreamReader, StreamReaderProvider,
    StreamWriter, StreamWriterProvider,
};
