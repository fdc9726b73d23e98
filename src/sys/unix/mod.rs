use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

mod selector;

pub use selector::{event_fd, event_readiness, Event, Selector};

/// Sets `O_NONBLOCK` on `fd`. Every socket this crate hands to a `Channel`
/// goes through here first - the reactor never blocks on a read or write.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Sets `FD_CLOEXEC` on `fd`, matching `handy`'s `addFdFlag` used on every
/// socket and pipe end it creates.
pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Creates a non-blocking, close-on-exec pipe: `(read_end, write_end)`.
pub fn wake_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    set_cloexec(fds[0])?;
    set_cloexec(fds[1])?;
    set_nonblocking(fds[0])?;
    set_nonblocking(fds[1])?;
    // SAFETY: `pipe(2)` just handed us two freshly-opened, uniquely-owned fds.
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}
