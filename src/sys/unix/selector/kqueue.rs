use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use crate::interest::{Interest, Readiness};

#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
type Count = libc::c_int;
#[cfg(not(any(target_os = "freebsd", target_os = "dragonfly")))]
type Count = libc::size_t;

/// Thin wrapper around a single `kqueue` instance.
///
/// Read and write readiness are independent filters under kqueue, unlike
/// epoll's single combined event mask, so registering/updating interest
/// submits one changelist entry per filter that needs enabling or disabling.
#[derive(Debug)]
pub struct Selector {
    kq: OwnedFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let kq = unsafe {
            let fd = libc::kqueue();
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            OwnedFd::from_raw_fd(fd)
        };
        Ok(Selector { kq })
    }

    pub fn select(&self, events: &mut Vec<libc::kevent>, timeout: Option<Duration>) -> io::Result<()> {
        let ts = timeout.map(|to| libc::timespec {
            tv_sec: to.as_secs() as libc::time_t,
            tv_nsec: to.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts.as_ref().map(|ts| ts as *const _).unwrap_or(ptr::null());

        events.clear();
        let cap = events.capacity();
        let n = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                ptr::null(),
                0,
                events.as_mut_ptr(),
                cap as Count as libc::c_int,
                ts_ptr,
            )
        };
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
        self.submit(fd, interests, None)
    }

    pub fn reregister(&self, fd: RawFd, interests: Interest, previous: Interest) -> io::Result<()> {
        self.submit(fd, interests, Some(previous))
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let mut changes = Vec::with_capacity(2);
        push_change(&mut changes, fd, libc::EVFILT_READ, libc::EV_DELETE);
        push_change(&mut changes, fd, libc::EVFILT_WRITE, libc::EV_DELETE);
        // Deletion of a filter that was never added is harmless (ENOENT),
        // so errors here are not surfaced.
        let _ = self.apply(&mut changes);
        Ok(())
    }

    /// `previous` is `None` on first registration (nothing to tear down
    /// yet), `Some` on a later interest change (may need to delete a filter
    /// that's no longer wanted).
    fn submit(&self, fd: RawFd, interests: Interest, previous: Option<Interest>) -> io::Result<()> {
        let mut changes = Vec::with_capacity(2);
        let was_readable = previous.map_or(false, |p| p.is_readable());
        let was_writable = previous.map_or(false, |p| p.is_writable());
        if interests.is_readable() {
            push_change(&mut changes, fd, libc::EVFILT_READ, libc::EV_ADD | libc::EV_ENABLE);
        } else if was_readable {
            push_change(&mut changes, fd, libc::EVFILT_READ, libc::EV_DELETE);
        }
        if interests.is_writable() {
            push_change(&mut changes, fd, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_ENABLE);
        } else if was_writable {
            push_change(&mut changes, fd, libc::EVFILT_WRITE, libc::EV_DELETE);
        }
        self.apply(&mut changes)
    }

    fn apply(&self, changes: &mut [libc::kevent]) -> io::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let ret = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                changes.as_ptr(),
                changes.len() as libc::c_int,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

fn push_change(changes: &mut Vec<libc::kevent>, fd: RawFd, filter: i16, flags: u16) {
    changes.push(libc::kevent {
        ident: fd as libc::uintptr_t,
        filter: filter as _,
        flags: flags as _,
        fflags: 0,
        data: 0,
        udata: ptr::null_mut(),
    });
}

pub fn event_fd(event: &libc::kevent) -> RawFd {
    event.ident as RawFd
}

pub fn event_readiness(event: &libc::kevent) -> Readiness {
    let err = event.flags & (libc::EV_ERROR as u16) != 0;
    let eof = event.flags & (libc::EV_EOF as u16) != 0;
    let is_read = event.filter == libc::EVFILT_READ as _;
    let is_write = event.filter == libc::EVFILT_WRITE as _;
    Readiness {
        readable: is_read || err || (eof && is_read),
        writable: is_write || err,
    }
}
