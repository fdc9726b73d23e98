//! Platform-specific readiness notification backends.
//!
//! Exactly one of these is compiled in: `epoll` on Linux/Android, `kqueue`
//! on the BSDs and macOS. There is no portable fallback - see the crate's
//! Non-goals for why Windows is out of scope.
#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::{event_fd, event_readiness, set_cloexec, set_nonblocking, wake_pipe, Event, Selector};
