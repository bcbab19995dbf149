use std::fmt;

use crate::sys;

/// Associates a registered descriptor with the events it produces.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}

/// Readiness reported to a descriptor in one dispatch.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Ready(u8);

const READABLE: u8 = 0b001;
const WRITABLE: u8 = 0b010;
const ERROR: u8 = 0b100;

impl Ready {
    pub(crate) fn from_event(event: &sys::Event) -> Ready {
        let mut bits = 0;
        if sys::unix::event::is_readable(event) || sys::unix::event::is_read_closed(event) {
            bits |= READABLE;
        }
        if sys::unix::event::is_writable(event) {
            bits |= WRITABLE;
        }
        if sys::unix::event::is_error(event) {
            bits |= ERROR;
        }
        Ready(bits)
    }

    /// The descriptor is ready for reading (or the peer shut down).
    pub fn is_readable(self) -> bool {
        self.0 & READABLE != 0
    }

    /// The descriptor is ready for writing.
    pub fn is_writable(self) -> bool {
        self.0 & WRITABLE != 0
    }

    /// The descriptor is in an error state.
    pub fn is_error(self) -> bool {
        self.0 & ERROR != 0
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ready")
            .field("readable", &self.is_readable())
            .field("writable", &self.is_writable())
            .field("error", &self.is_error())
            .finish()
    }
}
