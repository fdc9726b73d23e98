use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use libc::{EPOLLIN, EPOLLOUT, EPOLLRDHUP};

use crate::interest::{Interest, Readiness};

/// Thin wrapper around a single `epoll` instance.
///
/// Registrations are keyed by raw fd, stashed in the kernel event's `u64`
/// data field, mirroring the original's use of a raw `Channel*` there -
/// we can't stash a Rust reference across an `unsafe` FFI boundary that
/// cheaply, so the fd itself is the token and the caller (`Poller`) maps
/// it back to a channel.
#[derive(Debug)]
pub struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            OwnedFd::from_raw_fd(fd)
        };
        Ok(Selector { ep })
    }

    pub fn select(&self, events: &mut Vec<libc::epoll_event>, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout
            .map(|to| {
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        events.clear();
        let cap = events.capacity();
        let n = unsafe { libc::epoll_wait(self.ep.as_raw_fd(), events.as_mut_ptr(), cap as i32, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        unsafe { events.set_len(n as usize) };
        Ok(())
    }

    pub fn register(&self, fd: RawFd, interests: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: fd as u64,
        };
        epoll_ctl_checked(self.ep.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)
    }

    pub fn reregister(&self, fd: RawFd, interests: Interest, _previous: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: fd as u64,
        };
        epoll_ctl_checked(self.ep.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut event)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        // `epoll_ctl(2)` ignores the event pointer for `EPOLL_CTL_DEL`, but
        // pre-2.6.9 kernels require a non-null pointer.
        let mut dummy = libc::epoll_event { events: 0, u64: 0 };
        epoll_ctl_checked(self.ep.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, &mut dummy)
    }
}

fn epoll_ctl_checked(ep: RawFd, op: libc::c_int, fd: RawFd, event: *mut libc::epoll_event) -> io::Result<()> {
    let ret = unsafe { libc::epoll_ctl(ep, op, fd, event) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn interests_to_epoll(interests: Interest) -> u32 {
    // Level-triggered: a fd with bytes still sitting in its socket buffer
    // keeps reporting ready every `wait()` until the caller actually drains
    // it, rather than requiring an edge-triggered drain-to-EAGAIN loop.
    let mut kind = 0;
    if interests.is_readable() {
        kind |= EPOLLIN | EPOLLRDHUP;
    }
    if interests.is_writable() {
        kind |= EPOLLOUT;
    }
    kind as u32
}

pub fn event_fd(event: &libc::epoll_event) -> RawFd {
    event.u64 as RawFd
}

pub fn event_readiness(event: &libc::epoll_event) -> Readiness {
    let bits = event.events as libc::c_int;
    let hup = bits & libc::EPOLLHUP != 0;
    let err = bits & libc::EPOLLERR != 0;
    let readable = bits & (libc::EPOLLIN | libc::EPOLLRDHUP) != 0 || hup || err;
    let writable = bits & libc::EPOLLOUT != 0 || hup || err;
    Readiness { readable, writable }
}
