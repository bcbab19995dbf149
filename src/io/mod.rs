//! The event loop and everything descriptors plug into it.

mod descriptor;
mod event;
mod event_loop;
mod interest;
pub mod stream_connection;
pub mod stream_io;
mod timed_call;
mod watchdog;
pub mod writing_buffer_list;

pub use descriptor::Descriptor;
pub use event::{Ready, Token};
pub use event_loop::{
    all_event_loops_barrier, event_loop_for, join_all_event_loops, start_all_event_loops,
    stop_all_event_loops, EventLoop,
};
pub(crate) use event_loop::for_each_event_loop;
pub use interest::Interest;
pub use timed_call::timed_call;
pub use watchdog::{Watchdog, WatchdogOptions};
