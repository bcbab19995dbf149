//! The client-side call gate: one connection, many concurrent RPCs.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use log::{debug, warn};

use crate::base::object_pool::{Pool, Poolable, Pooled};
use crate::fiber::{self, timer, Condvar, Mutex, WorkQueue};
use crate::io::stream_connection::{
    DataConsumptionStatus, StreamConnection, StreamConnectionHandler,
};
use crate::io::{event_loop_for, EventLoop};

use super::correlation::{
    merge_correlation_id, new_connection_correlation_id, CorrelationMap,
};
use super::protocol::{Message, ParseStatus, Protocol};
use super::stream::{AsyncStreamReader, AsyncStreamWriter, StreamError};
use super::stream_io_adaptor::{Operations, StreamIoAdaptor};

/// Final status of an RPC.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CallStatus {
    /// The response arrived and parsed.
    Success,
    /// Transport failure, remote close, or framing error.
    IoError,
    /// The response frame was rejected by the protocol.
    ParseError,
    /// The per-call deadline elapsed.
    Timeout,
    /// The RPC was still outstanding when the gate shut down.
    GateClosing,
}

/// Per-call timing, reported to the completion callback.
///
/// Not applicable to streaming RPCs.
#[derive(Clone, Copy, Debug, Default)]
pub struct Timestamps {
    /// When the request was handed to the transport.
    pub sent: Option<Instant>,
    /// When the response bytes arrived on the connection.
    pub received: Option<Instant>,
    /// When the response finished parsing, right before completion.
    pub parsed: Option<Instant>,
}

/// Completion callback of a fast call. `message` is present only on
/// [`CallStatus::Success`].
pub type Completion = Box<dyn FnOnce(CallStatus, Option<Box<dyn Message>>, &Timestamps) + Send>;

/// Arguments for making a fast call.
pub struct FastCallArgs {
    /// Runs exactly once with the call's outcome, on a dedicated fiber.
    pub completion: Completion,
}

/// Options a gate is opened with.
pub struct GateOptions {
    /// The wire protocol spoken on this connection.
    pub protocol: Box<dyn Protocol>,
    /// Upper bound on a single frame; 0 disables the check.
    pub maximum_packet_size: usize,
    /// Buffered messages/writes per streaming RPC before back-pressure.
    pub stream_buffer_size: usize,
}

impl GateOptions {
    /// Options with defaults for everything but the protocol.
    pub fn new(protocol: Box<dyn Protocol>) -> GateOptions {
        GateOptions {
            protocol,
            maximum_packet_size: 64 * 1024 * 1024,
            stream_buffer_size: 64,
        }
    }
}

// Fast-call contexts are allocated once per RPC; recycle them.
struct FastCallContext {
    timeout_timer: timer::TimerId,
    timestamps: Timestamps,
    args: Option<FastCallArgs>,
}

impl Poolable for FastCallContext {
    fn new_pooled() -> FastCallContext {
        FastCallContext {
            timeout_timer: 0,
            timestamps: Timestamps::default(),
            args: None,
        }
    }

    fn on_put(&mut self) {
        assert!(
            self.args.is_none(),
            "call context destroyed without running user's completion"
        );
        self.timeout_timer = 0;
        self.timestamps = Timestamps::default();
    }
}

static FAST_CALL_CONTEXTS: Pool<FastCallContext> = Pool::new();

// One correlation map per scheduling group, shared by every gate in it.
fn correlation_map_for(scheduling_group: usize) -> &'static CorrelationMap<Pooled<FastCallContext>> {
    static MAPS: OnceLock<Vec<CorrelationMap<Pooled<FastCallContext>>>> = OnceLock::new();
    let maps = MAPS.get_or_init(|| {
        let mut maps = Vec::new();
        maps.resize_with(fiber::scheduling_group_count(), CorrelationMap::new);
        maps
    });
    &maps[scheduling_group]
}

struct StreamContext {
    // Double end-of-stream detection; a stream past its close is simply
    // absent from the map.
    eos_seen: bool,
    adaptor: Arc<StreamIoAdaptor<Box<dyn Message>>>,
}

// Completions in flight; `join` waits for them.
#[derive(Default)]
struct PendingOps {
    count: Mutex<usize>,
    cv: Condvar,
}

impl PendingOps {
    fn begin(&self) {
        *self.count.lock() += 1;
    }

    fn finish(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.cv.notify_all();
        }
    }

    fn wait_idle(&self) {
        let guard = self.count.lock();
        let _guard = self.cv.wait_while(guard, |count| *count != 0);
    }
}

enum MessageFlow {
    Continue,
    Suppress,
}

/// A call gate owns one connection to one endpoint: no load balancing,
/// fault tolerance or name resolution happens here — that is what
/// channels layered above are for. Gates are usually obtained through a
/// [`StreamCallGatePool`](super::gate_pool::StreamCallGatePool).
///
/// Cloning is cheap and shares the gate.
#[derive(Clone)]
pub struct StreamCallGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    options: GateOptions,
    endpoint: SocketAddr,
    scheduling_group: usize,
    conn: OnceLock<StreamConnection>,
    event_loop: OnceLock<Arc<EventLoop>>,
    healthy: AtomicBool,
    // Distinguishes our RPC IDs from other connections' in the shared map.
    conn_correlation_id: u32,
    // Streaming RPCs are rare compared to fast calls; a fiber mutex over a
    // plain map is enough. The lock may be held across scheduling points.
    stream_ctxs: Mutex<HashMap<u32, StreamContext>>,
    // Initialized on the first stream call; stream teardown is bounced
    // here so it never blocks the event loop.
    stream_reaper: OnceLock<WorkQueue>,
    pending: PendingOps,
    // Streams between `stream_call` and the end of their reaping.
    live_streams: PendingOps,
    weak_self: Weak<GateInner>,
}

impl StreamCallGate {
    /// Opens a connection to `endpoint`.
    ///
    /// Failures do not surface here — handling them at every call site
    /// would be painful and they are rare (mostly ephemeral-port
    /// exhaustion); instead the gate starts unhealthy and every call on
    /// it fails with [`CallStatus::IoError`]. Check [`healthy`](Self::healthy).
    pub fn open(endpoint: SocketAddr, options: GateOptions) -> StreamCallGate {
        let inner = Arc::new_cyclic(|weak_self| GateInner {
            options,
            endpoint,
            scheduling_group: fiber::current_scheduling_group(),
            conn: OnceLock::new(),
            event_loop: OnceLock::new(),
            healthy: AtomicBool::new(true),
            conn_correlation_id: new_connection_correlation_id(),
            stream_ctxs: Mutex::new(HashMap::new()),
            stream_reaper: OnceLock::new(),
            pending: PendingOps::default(),
            live_streams: PendingOps::default(),
            weak_self: weak_self.clone(),
        });
        if let Err(e) = inner.initialize_connection() {
            warn!("failed to connect to {}: {}", endpoint, e);
            inner.healthy.store(false, Ordering::Relaxed);
        }
        StreamCallGate { inner }
    }

    /// Whether the gate is still connected and serviceable.
    pub fn healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::Relaxed)
    }

    /// Manually marks the gate unhealthy.
    pub fn set_unhealthy(&self) {
        self.inner.healthy.store(false, Ordering::Relaxed);
    }

    /// The endpoint this gate is connected to.
    pub fn endpoint(&self) -> SocketAddr {
        self.inner.endpoint
    }

    /// The protocol spoken on this gate.
    pub fn protocol(&self) -> &dyn Protocol {
        &*self.inner.options.protocol
    }

    /// The event loop this gate's connection lives on.
    pub fn event_loop(&self) -> Option<&Arc<EventLoop>> {
        self.inner.event_loop.get()
    }

    pub(crate) fn user_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether two handles refer to the same underlying gate.
    pub fn is_same(&self, other: &StreamCallGate) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Issues a unary RPC: one request, one response.
    ///
    /// The request's correlation ID (allocate via
    /// [`new_rpc_correlation_id`](super::correlation::new_rpc_correlation_id))
    /// identifies the call. `args.completion` runs exactly once — with the
    /// response, a failure, or [`CallStatus::Timeout`] once `deadline`
    /// passes.
    pub fn fast_call(&self, request: &dyn Message, args: FastCallArgs, deadline: Instant) {
        self.inner.fast_call(request, args, deadline)
    }

    /// Cancels a previous [`fast_call`](Self::fast_call).
    ///
    /// Returns `None` if the call already completed (e.g. its response
    /// arrived); otherwise hands the un-run arguments back.
    pub fn cancel_fast_call(&self, rpc_correlation_id: u32) -> Option<FastCallArgs> {
        self.inner.cancel_fast_call(rpc_correlation_id)
    }

    /// Opens a streaming RPC under `rpc_correlation_id`.
    ///
    /// Timeouts are not supported here — "timeout" has no single meaning
    /// for a stream; arm `set_expiration` on the returned halves instead.
    pub fn stream_call(
        &self,
        rpc_correlation_id: u32,
    ) -> (
        AsyncStreamReader<Box<dyn Message>>,
        AsyncStreamWriter<Box<dyn Message>>,
    ) {
        self.inner.stream_call(rpc_correlation_id)
    }

    /// Fails every outstanding RPC with [`CallStatus::GateClosing`],
    /// breaks open streams and closes the connection.
    pub fn stop(&self) {
        self.inner.healthy.store(false, Ordering::Relaxed);
        self.inner.raise_errors_globally(CallStatus::GateClosing);
        if let Some(conn) = self.inner.conn.get() {
            conn.close();
        }
    }

    /// Waits until every pending completion has run and every stream has
    /// been reaped.
    ///
    /// Streams must have been closed first, or this blocks until they
    /// are.
    pub fn join(&self) {
        self.inner.pending.wait_idle();
        self.inner.live_streams.wait_idle();
        if let Some(reaper) = self.inner.stream_reaper.get() {
            reaper.stop();
            reaper.join();
        }
    }
}

impl GateInner {
    fn initialize_connection(&self) -> std::io::Result<()> {
        let stream = TcpStream::connect(self.endpoint)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        let fd: OwnedFd = stream.into();

        let handler: Weak<dyn StreamConnectionHandler> = self.weak_self.clone();
        let conn = StreamConnection::new(fd, handler);
        let event_loop = event_loop_for(self.scheduling_group, conn.fd());
        conn.attach_to(event_loop.clone())?;
        self.event_loop
            .set(event_loop)
            .unwrap_or_else(|_| panic!("gate connected twice"));
        let _ = self.conn.set(conn);
        Ok(())
    }

    fn correlation_map(&self) -> &'static CorrelationMap<Pooled<FastCallContext>> {
        correlation_map_for(self.scheduling_group)
    }

    fn fast_call(&self, request: &dyn Message, args: FastCallArgs, deadline: Instant) {
        let rpc_id = request.correlation_id();
        let correlation_id = merge_correlation_id(self.conn_correlation_id, rpc_id);

        if !self.healthy.load(Ordering::Relaxed) {
            self.dispatch_detached(args, CallStatus::IoError, None, Timestamps::default());
            return;
        }

        let mut ctx = FAST_CALL_CONTEXTS.get();
        ctx.timestamps.sent = Some(Instant::now());
        ctx.args = Some(args);
        // Arm the timer before publishing the context so the ID stored in
        // it is final by the time anyone can race us for the entry.
        let weak = self.weak_self.clone();
        ctx.timeout_timer = timer::set_timer(deadline, move || {
            if let Some(gate) = weak.upgrade() {
                gate.on_fast_call_timeout(correlation_id);
            }
        });
        self.correlation_map().insert(correlation_id, ctx);

        let frame = self.options.protocol.serialize(request);
        if !self.write_out(frame, 0) {
            // Whoever reaches the context first — us or the global error
            // path — completes the call.
            self.raise_error_if_present(rpc_id, CallStatus::IoError);
        }
    }

    fn cancel_fast_call(&self, rpc_id: u32) -> Option<FastCallArgs> {
        let correlation_id = merge_correlation_id(self.conn_correlation_id, rpc_id);
        self.correlation_map().remove(correlation_id).map(|mut ctx| {
            timer::kill_timer(ctx.timeout_timer);
            ctx.args.take().expect("context published without args")
        })
    }

    fn on_fast_call_timeout(&self, correlation_id: u64) {
        if let Some(ctx) = self.correlation_map().remove(correlation_id) {
            // The timer has fired; no need to kill it.
            self.dispatch_completion(ctx, CallStatus::Timeout, None);
        } // Otherwise the completion path won the race.
    }

    fn raise_error_if_present(&self, rpc_id: u32, status: CallStatus) {
        let correlation_id = merge_correlation_id(self.conn_correlation_id, rpc_id);
        if let Some(mut ctx) = self.correlation_map().remove(correlation_id) {
            timer::kill_timer(ctx.timeout_timer);
            ctx.timeout_timer = 0;
            self.dispatch_completion(ctx, status, None);
        }
    }

    // Fails every outstanding RPC of this gate, fast and streaming.
    fn raise_errors_globally(&self, status: CallStatus) {
        let mut correlation_ids = Vec::new();
        self.correlation_map().for_each(|correlation_id, _| {
            if (correlation_id >> 32) as u32 == self.conn_correlation_id {
                correlation_ids.push(correlation_id);
            }
        });
        for correlation_id in correlation_ids {
            if let Some(mut ctx) = self.correlation_map().remove(correlation_id) {
                timer::kill_timer(ctx.timeout_timer);
                ctx.timeout_timer = 0;
                self.dispatch_completion(ctx, status, None);
            }
        }

        let adaptors: Vec<_> = {
            let ctxs = self.stream_ctxs.lock();
            ctxs.values().map(|ctx| ctx.adaptor.clone()).collect()
        };
        for adaptor in adaptors {
            adaptor.break_stream();
        }
    }

    // Runs the completion on a dedicated fiber; blocking there is fine.
    fn dispatch_completion(
        &self,
        mut ctx: Pooled<FastCallContext>,
        status: CallStatus,
        message: Option<Box<dyn Message>>,
    ) {
        let args = ctx.args.take().expect("context published without args");
        let timestamps = ctx.timestamps;
        drop(ctx); // Back to the pool right away.
        self.dispatch_detached(args, status, message, timestamps);
    }

    fn dispatch_detached(
        &self,
        args: FastCallArgs,
        status: CallStatus,
        message: Option<Box<dyn Message>>,
        mut timestamps: Timestamps,
    ) {
        self.pending.begin();
        let weak = self.weak_self.clone();
        fiber::spawn(move || {
            timestamps.parsed = Some(Instant::now());
            (args.completion)(status, message, &timestamps);
            if let Some(gate) = weak.upgrade() {
                gate.pending.finish();
            }
        });
    }

    fn write_out(&self, frame: Bytes, ctx: usize) -> bool {
        match self.conn.get() {
            Some(conn) => conn.write(frame, ctx),
            None => false,
        }
    }

    fn stream_call(
        &self,
        rpc_id: u32,
    ) -> (
        AsyncStreamReader<Box<dyn Message>>,
        AsyncStreamWriter<Box<dyn Message>>,
    ) {
        self.stream_reaper.get_or_init(WorkQueue::new);
        self.live_streams.begin();

        // `on_cleanup` needs the adaptor itself; it is filled in right
        // after construction.
        let adaptor_cell: Arc<OnceLock<Arc<StreamIoAdaptor<Box<dyn Message>>>>> =
            Arc::new(OnceLock::new());
        let adaptor = StreamIoAdaptor::new(self.options.stream_buffer_size, Operations {
            try_parse: {
                let weak = self.weak_self.clone();
                Box::new(move |message| match weak.upgrade() {
                    Some(gate) => gate.options.protocol.try_complete_parse(message),
                    None => false,
                })
            },
            write: {
                let weak = self.weak_self.clone();
                Box::new(move |message| match weak.upgrade() {
                    Some(gate) => gate.write_stream_frame(rpc_id, message),
                    None => false,
                })
            },
            restart_read: {
                let weak = self.weak_self.clone();
                Box::new(move || {
                    if let Some(gate) = weak.upgrade() {
                        if let Some(conn) = gate.conn.get() {
                            conn.restart_read();
                        }
                    }
                })
            },
            on_close: {
                let weak = self.weak_self.clone();
                Box::new(move || {
                    if let Some(gate) = weak.upgrade() {
                        gate.on_stream_closed(rpc_id);
                    }
                })
            },
            on_cleanup: {
                let weak = self.weak_self.clone();
                let adaptor_cell = adaptor_cell.clone();
                Box::new(move || {
                    let adaptor = adaptor_cell.get().cloned();
                    if let (Some(gate), Some(adaptor)) = (weak.upgrade(), adaptor) {
                        gate.on_stream_cleanup(adaptor);
                    }
                })
            },
        });
        adaptor_cell
            .set(adaptor.clone())
            .unwrap_or_else(|_| panic!("adaptor cell filled twice"));

        {
            let mut ctxs = self.stream_ctxs.lock();
            let previous = ctxs.insert(
                rpc_id,
                StreamContext {
                    eos_seen: false,
                    adaptor: adaptor.clone(),
                },
            );
            assert!(previous.is_none(), "duplicate stream correlation id");
        }

        (adaptor.stream_reader(), adaptor.stream_writer())
    }

    fn write_stream_frame(&self, rpc_id: u32, message: &Box<dyn Message>) -> bool {
        if !self.healthy.load(Ordering::Relaxed) {
            return false;
        }
        let frame = self.options.protocol.serialize(&**message);
        self.write_out(frame, rpc_id as usize)
    }

    // Both halves have closed; forget the stream. Frames arriving from
    // now on find no context and are dropped.
    fn on_stream_closed(&self, rpc_id: u32) {
        let mut ctxs = self.stream_ctxs.lock();
        let _ = ctxs.remove(&rpc_id);
    }

    // All pending stream callbacks have run; tear the adaptor down off
    // the event loop.
    fn on_stream_cleanup(&self, adaptor: Arc<StreamIoAdaptor<Box<dyn Message>>>) {
        let reaper = self
            .stream_reaper
            .get()
            .expect("stream cleanup before any stream call");
        let weak = self.weak_self.clone();
        reaper.push(move || {
            adaptor.flush_pending_calls();
            drop(adaptor);
            if let Some(gate) = weak.upgrade() {
                gate.live_streams.finish();
            }
        });
    }
}

impl StreamConnectionHandler for GateInner {
    fn on_data_arrival(&self, buffer: &mut BytesMut, at: Instant) -> DataConsumptionStatus {
        loop {
            match self.options.protocol.try_parse(buffer) {
                ParseStatus::NeedMore => {
                    let max = self.options.maximum_packet_size;
                    if max != 0 && buffer.len() > max {
                        warn!("frame exceeds maximum packet size, closing connection");
                        return DataConsumptionStatus::Error;
                    }
                    return DataConsumptionStatus::Consumed;
                }
                ParseStatus::SkipFrame { correlation_id } => {
                    // Only the affected RPC fails; the byte stream is
                    // still framed correctly.
                    self.raise_error_if_present(correlation_id, CallStatus::ParseError);
                }
                ParseStatus::Corrupted => {
                    warn!("protocol reports a desynchronized connection");
                    return DataConsumptionStatus::Error;
                }
                ParseStatus::Parsed(message) => match self.dispatch_message(message, at) {
                    MessageFlow::Continue => {}
                    MessageFlow::Suppress => return DataConsumptionStatus::SuppressRead,
                },
            }
        }
    }

    fn on_data_written(&self, ctx: usize) {
        if ctx == 0 {
            return; // Fast-call frame; nothing tracks per-write completion.
        }
        let rpc_id = ctx as u32;
        let adaptor = {
            let ctxs = self.stream_ctxs.lock();
            ctxs.get(&rpc_id).map(|ctx| ctx.adaptor.clone())
        };
        if let Some(adaptor) = adaptor {
            adaptor.notify_write_completion();
        }
    }

    fn on_close(&self) {
        self.healthy.store(false, Ordering::Relaxed);
        self.raise_errors_globally(CallStatus::IoError);
    }

    fn on_error(&self) {
        self.healthy.store(false, Ordering::Relaxed);
        self.raise_errors_globally(CallStatus::IoError);
    }
}

impl GateInner {
    fn dispatch_message(&self, message: Box<dyn Message>, received_at: Instant) -> MessageFlow {
        let rpc_id = message.correlation_id();
        let correlation_id = merge_correlation_id(self.conn_correlation_id, rpc_id);

        // Fast path first: unary responses vastly outnumber stream frames.
        if let Some(mut ctx) = self.correlation_map().remove(correlation_id) {
            timer::kill_timer(ctx.timeout_timer);
            ctx.timeout_timer = 0;
            ctx.timestamps.received = Some(received_at);
            self.dispatch_completion(ctx, CallStatus::Success, Some(message));
            return MessageFlow::Continue;
        }

        let (adaptor, eos) = {
            let mut ctxs = self.stream_ctxs.lock();
            match ctxs.get_mut(&rpc_id) {
                None => {
                    debug!("message with unknown correlation id {}, dropped", rpc_id);
                    return MessageFlow::Continue;
                }
                Some(ctx) => {
                    let eos = message.end_of_stream();
                    if eos {
                        // A second end-of-stream marker is a protocol bug,
                        // not a recoverable condition.
                        assert!(!ctx.eos_seen, "double end-of-stream marker on one stream");
                        ctx.eos_seen = true;
                    }
                    (ctx.adaptor.clone(), eos)
                }
            }
        };

        let suppress = adaptor.notify_read(message);
        if eos {
            adaptor.notify_error(StreamError::EndOfStream);
        }
        if suppress {
            MessageFlow::Suppress
        } else {
            MessageFlow::Continue
        }
    }
}

