//! Descriptors: what the event loop owns and dispatches to.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Instant;

use super::{Interest, Ready};

/// An object wrapping a file descriptor, owned by one event loop.
///
/// The loop keeps a strong reference from attach until detach, so a
/// descriptor is never dropped while events for it may still be delivered.
/// `enable` / `disable` transitions and detach must happen on the loop's
/// own thread; attach may happen anywhere.
pub trait Descriptor: Send + Sync + 'static {
    /// The file descriptor to poll.
    fn fd(&self) -> RawFd;

    /// The readiness this descriptor wants to see.
    fn interest(&self) -> Interest;

    /// Called by the owning loop for every readiness event.
    ///
    /// `at` is the timestamp taken when the poll returned, shared by all
    /// events of that tick.
    fn fire_events(self: Arc<Self>, ready: Ready, at: Instant);

    /// A short name for diagnostics.
    fn name(&self) -> &str {
        "descriptor"
    }
}
