//! Fiber-oriented non-blocking I/O and RPC call orchestration.
//!
//! `strand` is the layer that sits between raw sockets and an RPC
//! framework's message dispatch: edge-triggered event loops owning
//! descriptors, fiber synchronization primitives, a lock-free write
//! staging queue, typed streams with bounded back-pressure, and
//! client-side call gates multiplexing concurrent RPCs over pooled
//! connections.
//!
//! # Layers
//!
//! * [`fiber`] — synchronization primitives (mutex, condvar, latch,
//!   semaphore, barrier, rwlock) whose waits suspend only the calling
//!   fiber, plus timers and serialized work queues.
//! * [`io`] — the event loop over an edge-triggered readiness
//!   multiplexer, its watchdog, the MPSC writing buffer list, and
//!   socket-backed stream connections.
//! * [`rpc`] — correlation IDs and maps, buffered typed streams, the
//!   stream I/O adaptor, call gates and gate pools.
//! * [`runtime`] — process bootstrap and ordered teardown.
//!
//! # A unary call, end to end
//!
//! A caller encodes a request through its protocol and issues
//! [`rpc::StreamCallGate::fast_call`]. The gate registers the call in the
//! per-scheduling-group correlation map, arms the deadline timer, and
//! appends the frame to the connection's writing buffer list; the event
//! loop drains that list into `writev`. When response bytes arrive, the
//! loop feeds the protocol parser, the correlation map resolves the ID
//! back to the pending call, the timer is cancelled, and the completion
//! runs on a fresh fiber with its timestamps filled in. Exactly one of
//! the response path and the timeout timer wins; the loser finds the
//! correlation entry already gone.
//!
//! Only Linux (epoll) is supported.

#![warn(missing_docs)]

#[macro_use]
mod macros;

pub mod base;
pub mod clock;
pub mod fiber;
pub mod io;
pub mod rpc;
pub mod runtime;

mod sys;
