//! The fd-registration handle. Grounded on `handy::event_base.h`'s
//! `Channel`: owns a fd, an interest mask, and read/write callbacks,
//! registered with exactly one poller for its whole lifetime.

use std::cell::RefCell;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use log::trace;

use crate::interest::Interest;
use crate::poller::Poller;

pub type ChannelCallback = Box<dyn FnMut()>;

/// A registration handle for one fd.
///
/// Not `Clone`: the enclosing `TcpConn`/`TcpServer` owns it outright. The
/// reactor never owns channels directly, only the `Poller` they're
/// registered with.
pub struct Channel {
    poller: Rc<RefCell<Poller>>,
    fd: RawFd,
    interests: Interest,
    id: u64,
    read_cb: Option<ChannelCallback>,
    write_cb: Option<ChannelCallback>,
}

static NEXT_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

impl Channel {
    /// Registers `fd` (which must already be non-blocking) with `poller`
    /// under `interests`, and binds the returned handle into the poller's
    /// fd-to-channel dispatch map so `EventBase::loop_once` can route
    /// readiness back to it.
    pub fn new(poller: Rc<RefCell<Poller>>, fd: RawFd, interests: Interest) -> io::Result<Rc<RefCell<Channel>>> {
        poller.borrow_mut().add(fd, interests)?;
        let id = NEXT_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        trace!("channel {id} registered fd {fd} with {interests:?}");
        let channel = Rc::new(RefCell::new(Channel {
            poller: poller.clone(),
            fd,
            interests,
            id,
            read_cb: None,
            write_cb: None,
        }));
        poller.borrow_mut().bind_channel(fd, Rc::downgrade(&channel));
        Ok(channel)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn on_read(&mut self, cb: ChannelCallback) {
        self.read_cb = Some(cb);
    }

    pub fn on_write(&mut self, cb: ChannelCallback) {
        self.write_cb = Some(cb);
    }

    pub fn read_enabled(&self) -> bool {
        self.interests.is_readable()
    }

    pub fn write_enabled(&self) -> bool {
        self.interests.is_writable()
    }

    pub fn enable_read(&mut self, enable: bool) {
        self.enable_read_write(enable, self.write_enabled());
    }

    pub fn enable_write(&mut self, enable: bool) {
        self.enable_read_write(self.read_enabled(), enable);
    }

    pub fn enable_read_write(&mut self, readable: bool, writable: bool) {
        let wanted = match (readable, writable) {
            (true, true) => Interest::READABLE.add(Interest::WRITABLE),
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => return, // a channel always watches something; handled by close() instead
        };
        if wanted == self.interests {
            return;
        }
        self.interests = wanted;
        if let Err(e) = self.poller.borrow_mut().update(self.fd, wanted) {
            log::warn!("channel {} failed to update interest: {e}", self.id);
        }
    }

    /// Drops both callbacks without touching registration. Used by
    /// `TcpConn::cleanup` before dropping the channel so a stale
    /// callback-closure holding the last strong reference to the
    /// connection can't re-enter cleanup when the channel is finally
    /// dropped.
    pub fn clear_callbacks(&mut self) {
        self.read_cb = None;
        self.write_cb = None;
    }

    /// Takes the read callback out so the caller can invoke it after
    /// releasing this channel's borrow - calling it while still borrowed
    /// would deadlock/panic the moment it re-touches this same channel
    /// (checking `as_raw_fd`, closing, toggling write interest).
    pub fn take_read_cb(&mut self) -> Option<ChannelCallback> {
        self.read_cb.take()
    }

    pub fn put_read_cb(&mut self, cb: ChannelCallback) {
        self.read_cb = Some(cb);
    }

    pub fn take_write_cb(&mut self) -> Option<ChannelCallback> {
        self.write_cb.take()
    }

    pub fn put_write_cb(&mut self, cb: ChannelCallback) {
        self.write_cb = Some(cb);
    }

    /// Unregisters from the poller and closes the fd, returning the read
    /// callback (if any) for the caller to fire once it has released this
    /// channel's borrow - this is how a connection's `handle_read` observes
    /// EOF and runs its cleanup path. Idempotent; returns `None` on a
    /// channel already closed.
    #[must_use]
    pub fn close(&mut self) -> Option<ChannelCallback> {
        if self.fd < 0 {
            return None;
        }
        if let Err(e) = self.poller.borrow_mut().remove(self.fd) {
            log::warn!("channel {} failed to deregister: {e}", self.id);
        }
        unsafe { libc::close(self.fd) };
        self.fd = -1;
        self.write_cb = None;
        self.read_cb.take()
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // No one is left to hand the read callback to; dropping it just
        // releases whatever it captured.
        let _ = self.close();
    }
}

/// Closes `channel` and fires its stored read callback exactly once,
/// observing the reactor's close-reports-EOF-via-the-read-path convention.
/// Takes the callback out and invokes it only after releasing the
/// channel's own borrow, so a callback that re-touches this same channel
/// (checking `as_raw_fd`, scheduling another close) doesn't reenter it.
pub fn close_and_notify(channel: &Rc<RefCell<Channel>>) {
    let cb = channel.borrow_mut().close();
    if let Some(mut cb) = cb {
        cb();
    }
}
