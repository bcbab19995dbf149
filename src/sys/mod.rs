//! OS-specific plumbing.

#[cfg(unix)]
pub(crate) mod unix;

#[cfg(unix)]
pub(crate) use unix::{Event, Events, Selector, Waker};

#[cfg(all(unix, test))]
pub(crate) use unix::pipe;
