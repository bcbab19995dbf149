// Not all helpers are used by all tests.
#![allow(dead_code)]

use std::any::Any;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Mutex, Once};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use strand::rpc::{ConnectionCharacteristics, Message, ParseStatus, Protocol};
use strand::runtime::{self, RuntimeOptions};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

/// Brings up the shared test runtime (once per test binary).
pub fn init_runtime() {
    init();
    runtime::ensure_started(&RuntimeOptions::default());
}

/// A message of the line protocol used throughout the tests:
/// `[len:u32][correlation:u32][flags:u8][payload]`, lengths in big endian
/// and covering everything after the length field.
#[derive(Debug, Clone)]
pub struct TestMessage {
    pub correlation_id: u32,
    pub payload: Bytes,
    pub eos: bool,
}

impl TestMessage {
    pub fn new(correlation_id: u32, payload: &'static [u8]) -> TestMessage {
        TestMessage {
            correlation_id,
            payload: Bytes::from_static(payload),
            eos: false,
        }
    }

    pub fn eos(correlation_id: u32) -> TestMessage {
        TestMessage {
            correlation_id,
            payload: Bytes::new(),
            eos: true,
        }
    }
}

impl Message for TestMessage {
    fn correlation_id(&self) -> u32 {
        self.correlation_id
    }

    fn end_of_stream(&self) -> bool {
        self.eos
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

const FLAG_EOS: u8 = 0x01;

pub struct TestProtocol;

impl Protocol for TestProtocol {
    fn try_parse(&self, buffer: &mut BytesMut) -> ParseStatus {
        if buffer.len() < 4 {
            return ParseStatus::NeedMore;
        }
        let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        if len < 5 {
            return ParseStatus::Corrupted;
        }
        if buffer.len() < 4 + len {
            return ParseStatus::NeedMore;
        }
        buffer.advance(4);
        let mut frame = buffer.split_to(len);
        let correlation_id = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let flags = frame[4];
        frame.advance(5);
        ParseStatus::Parsed(Box::new(TestMessage {
            correlation_id,
            payload: frame.freeze(),
            eos: flags & FLAG_EOS != 0,
        }))
    }

    fn serialize(&self, message: &dyn Message) -> Bytes {
        let message = message
            .as_any()
            .downcast_ref::<TestMessage>()
            .expect("foreign message handed to the test protocol");
        let mut frame = BytesMut::with_capacity(4 + 5 + message.payload.len());
        frame.put_u32((5 + message.payload.len()) as u32);
        frame.put_u32(message.correlation_id);
        frame.put_u8(if message.eos { FLAG_EOS } else { 0 });
        frame.extend_from_slice(&message.payload);
        frame.freeze()
    }

    fn characteristics(&self) -> ConnectionCharacteristics {
        ConnectionCharacteristics {
            multiplexable: true,
        }
    }
}

/// A server that echoes every byte back, frame-agnostic.
pub fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind echo server");
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            std::thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// A server that accepts connections and never answers anything.
pub fn start_silent_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind silent server");
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        // Keep accepted sockets open so clients see neither data nor EOF.
        let mut parked: Vec<TcpStream> = Vec::new();
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => parked.push(stream),
                Err(_) => break,
            }
        }
        drop(parked);
    });
    addr
}

/// Collects completion artifacts across threads.
pub struct Collector<T> {
    slots: Mutex<Vec<T>>,
    latch: strand::fiber::Latch,
}

impl<T: Send> Collector<T> {
    pub fn new(expected: isize) -> Collector<T> {
        Collector {
            slots: Mutex::new(Vec::new()),
            latch: strand::fiber::Latch::new(expected),
        }
    }

    pub fn push(&self, value: T) {
        self.slots.lock().unwrap().push(value);
        self.latch.count_down(1);
    }

    pub fn wait(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.latch.wait();
        self.slots.lock().unwrap().clone()
    }

    pub fn wait_for(&self, timeout: std::time::Duration) -> bool {
        self.latch.wait_for(timeout)
    }
}
