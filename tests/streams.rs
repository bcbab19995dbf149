//! Streaming RPCs end to end over loopback.

mod util;

use std::time::{Duration, Instant};

use strand::rpc::correlation::new_rpc_correlation_id;
use strand::rpc::{StreamError, StreamReader, StreamWriter};

use util::{TestMessage, TestProtocol};

fn open_gate(addr: std::net::SocketAddr) -> strand::rpc::StreamCallGate {
    strand::rpc::StreamCallGate::open(
        addr,
        strand::rpc::call_gate::GateOptions::new(Box::new(TestProtocol)),
    )
}

fn payload_of(message: &dyn strand::rpc::Message) -> Vec<u8> {
    message
        .as_any()
        .downcast_ref::<TestMessage>()
        .unwrap()
        .payload
        .to_vec()
}

#[test]
fn echoed_stream_round_trips_in_order() {
    util::init_runtime();
    let addr = util::start_echo_server();
    let gate = open_gate(addr);

    let rpc_id = new_rpc_correlation_id();
    let (reader, writer) = gate.stream_call(rpc_id);
    let reader: StreamReader<_> = reader.into();
    let writer: StreamWriter<_> = writer.into();

    for chunk in [&b"alpha"[..], b"beta", b"gamma"] {
        let message = TestMessage {
            correlation_id: rpc_id,
            payload: bytes::Bytes::copy_from_slice(chunk),
            eos: false,
        };
        assert!(writer.write(Box::new(message)));
    }
    for expected in [&b"alpha"[..], b"beta", b"gamma"] {
        let message = reader.read().expect("echoed frame missing");
        assert_eq!(payload_of(&*message), expected);
    }

    reader.close();
    writer.close();
    gate.stop();
    gate.join();
}

#[test]
fn end_of_stream_marker_terminates_the_reader() {
    util::init_runtime();
    let addr = util::start_echo_server();
    let gate = open_gate(addr);

    let rpc_id = new_rpc_correlation_id();
    let (reader, writer) = gate.stream_call(rpc_id);
    let reader: StreamReader<_> = reader.into();
    let writer: StreamWriter<_> = writer.into();

    // The echo server reflects our end-of-stream marker back at us.
    assert!(writer.write_last(Box::new(TestMessage::eos(rpc_id))));

    // The marker frame itself surfaces first, then the stream ends.
    let marker = reader.read().expect("marker frame missing");
    assert!(marker.end_of_stream());
    assert_eq!(reader.read().err(), Some(StreamError::EndOfStream));

    // An erroneous read implies the stream is closed; only the writer is
    // left to shut down, and `write_last` already did that.
    gate.stop();
    gate.join();
}

#[test]
fn reader_expiration_fires_without_traffic() {
    util::init_runtime();
    let addr = util::start_silent_server();
    let gate = open_gate(addr);

    let rpc_id = new_rpc_correlation_id();
    let (reader, writer) = gate.stream_call(rpc_id);
    let reader: StreamReader<_> = reader.into();
    let writer: StreamWriter<_> = writer.into();

    reader.set_expiration(Instant::now() + Duration::from_millis(100));
    let begin = Instant::now();
    assert_eq!(reader.read().err(), Some(StreamError::Timeout));
    let elapsed = begin.elapsed();
    assert!(elapsed >= Duration::from_millis(90), "{:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(400), "{:?}", elapsed);

    writer.close();
    gate.stop();
    gate.join();
}

#[test]
fn broken_connection_breaks_the_stream() {
    util::init_runtime();
    let addr = util::start_echo_server();
    let gate = open_gate(addr);

    let rpc_id = new_rpc_correlation_id();
    let (reader, writer) = gate.stream_call(rpc_id);
    let reader: StreamReader<_> = reader.into();
    let writer: StreamWriter<_> = writer.into();

    gate.stop(); // Simulates the transport going away underneath.

    assert_eq!(reader.read().err(), Some(StreamError::EndOfStream));
    // Writes are failed rather than silently dropped.
    let message = TestMessage::new(rpc_id, b"late");
    assert!(!writer.write_last(Box::new(message)));

    gate.join();
}
