pub(crate) mod selector;
pub(crate) mod waker;

pub(crate) use selector::{event, Event, Events, Selector};
pub(crate) use waker::Waker;

/// Creates a non-blocking, close-on-exec pipe. Returns `(read, write)`.
#[cfg(test)]
pub(crate) fn pipe() -> std::io::Result<(std::os::fd::OwnedFd, std::os::fd::OwnedFd)> {
    use std::os::fd::{FromRawFd, OwnedFd};

    let mut fds: [libc::c_int; 2] = [-1, -1];
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;
    // SAFETY: `pipe2(2)` returned two valid descriptors we now own.
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}
