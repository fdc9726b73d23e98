//! A compact event-driven TCP networking reactor: an `epoll`/`kqueue` event
//! loop (`EventBase`), fd registration (`Channel`), client and accepted
//! connections (`TcpConn`), a listening socket that fans accepts across a
//! reactor pool (`TcpServer`), pluggable message framing (`Codec`), timers,
//! idle-connection sweeping, and a half-sync/half-async adapter (`Hsha`)
//! for offloading message handling to a worker pool.
//!
//! Grounded on `handy::event_base.h`/`conn.h`'s design: one reactor per
//! thread, `Rc<RefCell<_>>` state owned entirely by that thread, and a
//! `safe_call` escape hatch for the rare cross-thread hop (a worker
//! finishing a task, an accept landing on a different reactor).

mod buffer;
mod channel;
mod codec;
mod error;
mod event_base;
mod hsha;
mod idle;
mod interest;
mod poller;
mod reactor_handle;
mod safe_queue;
mod sys;
mod tcp_conn;
mod tcp_server;
mod thread_pool;
mod timer;

pub use buffer::{Buffer, Slice};
pub use codec::{Codec, DecodeOutcome, LengthCodec, LineCodec};
pub use error::{CodecError, Error, Result};
pub use event_base::{EventBase, EventBaseBuilder, EventBaseHandle, MultiBase};
pub use hsha::{Hsha, ReplyCallback};
pub use interest::{Interest, Readiness};
pub use tcp_conn::{ConnCallback, ConnState, MsgCallback, TcpConnHandle};
pub use tcp_server::{ServerConnCallback, ServerMsgCallback, TcpServer};
pub use thread_pool::ThreadPool;
pub use timer::TimerId;
