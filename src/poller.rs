//! Portable wrapper over the platform readiness backend.
//!
//! Grounded on `handy`'s `PollerBase`/`createPoller` split (one poller per
//! reactor, `addChannel`/`removeChannel`/`updateChannel`/`loop_once`) and on
//! mio's modern `sys::unix::selector` backends for the actual epoll/kqueue
//! plumbing. Unlike mio, registrations are keyed by raw fd rather than an
//! opaque `Token` - `EventBase` is the only caller and it already indexes
//! its channels by fd.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use log::trace;

use crate::channel::Channel;
use crate::interest::{Interest, Readiness};
use crate::sys;

/// Maximum events drained from a single `wait` call, matching `handy`'s
/// `kMaxEvents`.
const MAX_EVENTS: usize = 2000;

pub struct Poller {
    selector: sys::Selector,
    events: Vec<sys::Event>,
    interests: HashMap<RawFd, Interest>,
    /// Back-reference from a registered fd to the `Channel` that owns it,
    /// so `wait`'s readiness pairs can be routed without `EventBase` having
    /// to track fd ownership itself. Populated by `Channel::new`, pruned by
    /// `remove`; a `Weak` rather than `Rc` since the poller never extends a
    /// channel's lifetime.
    channels: HashMap<RawFd, Weak<RefCell<Channel>>>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Poller::with_capacity(MAX_EVENTS)
    }

    pub fn with_capacity(capacity: usize) -> io::Result<Poller> {
        Ok(Poller {
            selector: sys::Selector::new()?,
            events: Vec::with_capacity(capacity),
            interests: HashMap::new(),
            channels: HashMap::new(),
        })
    }

    pub fn add(&mut self, fd: RawFd, interests: Interest) -> io::Result<()> {
        self.selector.register(fd, interests)?;
        self.interests.insert(fd, interests);
        Ok(())
    }

    /// Called once by `Channel::new` right after `add`, so `wait`'s readiness
    /// pairs can be dispatched back to the owning channel.
    pub fn bind_channel(&mut self, fd: RawFd, channel: Weak<RefCell<Channel>>) {
        self.channels.insert(fd, channel);
    }

    pub fn dispatch_target(&self, fd: RawFd) -> Option<Rc<RefCell<Channel>>> {
        self.channels.get(&fd).and_then(Weak::upgrade)
    }

    pub fn update(&mut self, fd: RawFd, interests: Interest) -> io::Result<()> {
        let previous = self.interests.get(&fd).copied().unwrap_or(Interest::READABLE);
        self.selector.reregister(fd, interests, previous)?;
        self.interests.insert(fd, interests);
        Ok(())
    }

    pub fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        self.interests.remove(&fd);
        self.channels.remove(&fd);
        self.selector.deregister(fd)
    }

    /// Waits up to `timeout` (`None` = block indefinitely) and returns the
    /// fds that became ready this tick, alongside their readiness. Any fd
    /// removed via `remove` during the same tick is filtered out of a batch
    /// already collected by `select`, since kernel event buffers are
    /// transient per-call state, not something removal needs to reach into.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(RawFd, Readiness)>> {
        self.selector.select(&mut self.events, timeout)?;
        trace!("poller woke with {} events", self.events.len());
        let interests = &self.interests;
        Ok(self
            .events
            .iter()
            .map(|e| (sys::event_fd(e), sys::event_readiness(e)))
            .filter(|(fd, _)| interests.contains_key(fd))
            .collect())
    }
}
