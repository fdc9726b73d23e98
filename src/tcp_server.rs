//! Listening socket plus an accept loop that round-robins freshly accepted
//! connections across a `MultiBase`. Grounded on `handy::conn.h`/`conn.cc`'s
//! `TcpServer`.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{IntoRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;

use log::{info, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::channel::Channel;
use crate::codec::Codec;
use crate::event_base::{EventBase, EventBaseHandle, MultiBase};
use crate::interest::Interest;
use crate::tcp_conn::TcpConnHandle;

/// A callback shared by every connection this server hands out. Unlike
/// `TcpConn`'s own per-connection `ConnCallback` (a `FnMut` owned outright
/// by that one connection), this one is invoked from as many connections as
/// the server accepts, on as many reactor threads as the pool has, so it is
/// `Fn` rather than `FnMut` and `Send + Sync` so an `Arc` clone of it can
/// ride along through `safe_call` to whichever reactor an accept lands on.
pub type ServerConnCallback = Arc<dyn Fn(&TcpConnHandle) + Send + Sync>;
pub type ServerMsgCallback = Arc<dyn Fn(&TcpConnHandle, &[u8]) + Send + Sync>;

struct ServerState {
    listen_channel: Option<Rc<RefCell<Channel>>>,
    state_cb: Option<ServerConnCallback>,
    read_cb: Option<ServerConnCallback>,
    msg: Option<(Box<dyn Codec>, ServerMsgCallback)>,
}

/// Everything `add_connection` needs to build and wire one accepted
/// connection, snapshotted on the server's own thread so it can ride a
/// `safe_call` closure to a different reactor's thread intact - every field
/// here is `Send` (`TcpConnHandle` via `ReactorHandle`'s `unsafe impl Send`,
/// `Codec: Send` by its own trait bound, the callbacks by their `Send +
/// Sync` bounds above).
struct ConnConfig {
    state_cb: Option<ServerConnCallback>,
    read_cb: Option<ServerConnCallback>,
    msg: Option<(Box<dyn Codec>, ServerMsgCallback)>,
}

struct AcceptedConn {
    fd: RawFd,
    local: SocketAddr,
    peer: SocketAddr,
}

/// A bound, listening TCP socket that round-robins accepted connections
/// across the reactors of a `MultiBase`. One `TcpServer` owns the listen
/// socket and lives on a single reactor (the one it was built on); accepted
/// connections themselves may end up on any reactor in the pool.
pub struct TcpServer {
    base: Rc<EventBase>,
    bases: Rc<MultiBase>,
    addr: SocketAddr,
    state: Rc<RefCell<ServerState>>,
}

impl TcpServer {
    /// Binds and listens on `addr`. `base` is the reactor the listen socket
    /// and accept loop itself run on; `bases` is the pool accepted
    /// connections are dealt across, matching `TcpServer::TcpServer`'s
    /// `base_ = bases->allocBase()`.
    pub fn bind(addr: SocketAddr, base: Rc<EventBase>, bases: Rc<MultiBase>) -> io::Result<TcpServer> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.set_cloexec(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;
        let bound_addr = socket.local_addr().ok().and_then(|a| a.as_socket()).unwrap_or(addr);
        let fd = socket.into_raw_fd();

        let state = Rc::new(RefCell::new(ServerState {
            listen_channel: None,
            state_cb: None,
            read_cb: None,
            msg: None,
        }));

        let channel = Channel::new(base.poller_handle(), fd, Interest::READABLE)?;
        {
            let state = state.clone();
            let base = base.clone();
            let bases = bases.clone();
            channel.borrow_mut().on_read(Box::new(move || {
                TcpServer::handle_accept(fd, &base, &bases, &state);
            }));
        }
        state.borrow_mut().listen_channel = Some(channel);

        info!("server listening on {bound_addr}");
        Ok(TcpServer {
            base,
            bases,
            addr: bound_addr,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base(&self) -> &Rc<EventBase> {
        &self.base
    }

    pub fn base_handle(&self) -> EventBaseHandle {
        self.base.handle()
    }

    /// Fires once per accepted connection, on whichever reactor it landed
    /// on, right after the connection is wired up - mirrors `TcpConn`'s own
    /// `onState`, applied to every connection this server hands out.
    pub fn on_state(&self, cb: ServerConnCallback) {
        self.state.borrow_mut().state_cb = Some(cb);
    }

    pub fn on_read(&self, cb: ServerConnCallback) {
        self.state.borrow_mut().read_cb = Some(cb);
    }

    /// Installs a codec and message callback applied to every accepted
    /// connection - mirrors `TcpServer::onMsg`, which stashes `codec_` and
    /// wraps it per-connection via `codec_->clone()`.
    pub fn on_msg(&self, codec: Box<dyn Codec>, cb: ServerMsgCallback) {
        self.state.borrow_mut().msg = Some((codec, cb));
    }

    pub fn close(&self) {
        if let Some(ch) = self.state.borrow_mut().listen_channel.take() {
            crate::channel::close_and_notify(&ch);
        }
    }

    fn handle_accept(listen_fd: RawFd, base: &Rc<EventBase>, bases: &Rc<MultiBase>, state: &Rc<RefCell<ServerState>>) {
        loop {
            let fd = unsafe { libc::accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
            if fd < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock && err.kind() != io::ErrorKind::Interrupted {
                    warn!("accept on fd {listen_fd} failed: {err}");
                }
                break;
            }
            let accepted = match crate::tcp_conn::accepted_addresses(fd) {
                Ok((local, peer)) => AcceptedConn { fd, local, peer },
                Err(e) => {
                    warn!("accepted fd {fd} has no usable address: {e}");
                    unsafe { libc::close(fd) };
                    continue;
                }
            };

            let own_handle = base.handle();
            let target_handle = bases.alloc_base();
            if target_handle.ptr_eq(&own_handle) {
                let config = TcpServer::snapshot_config(state);
                TcpServer::add_connection(base.clone(), accepted, config);
            } else {
                // The target reactor's full `Rc<EventBase>` only lives on
                // its own thread; `EventBase::current()` recovers it from
                // inside this closure once `safe_call` delivers it there.
                let config = TcpServer::snapshot_config(state);
                target_handle.safe_call(move || match EventBase::current() {
                    Some(target_base) => TcpServer::add_connection(target_base, accepted, config),
                    None => {
                        warn!("reactor has no current EventBase while dispatching accepted fd {}; dropping", accepted.fd);
                        unsafe { libc::close(accepted.fd) };
                    }
                });
            }
        }
    }

    /// Clones out everything a new connection needs from the server's
    /// config, each field via its own cheap `Arc`/`box_clone` - taken on the
    /// server's own thread, before a config ever has to cross into a
    /// `safe_call` closure bound for a different reactor.
    fn snapshot_config(state: &Rc<RefCell<ServerState>>) -> ConnConfig {
        let state = state.borrow();
        ConnConfig {
            state_cb: state.state_cb.clone(),
            read_cb: state.read_cb.clone(),
            msg: state.msg.as_ref().map(|(codec, cb)| (codec.box_clone(), cb.clone())),
        }
    }

    fn add_connection(base: Rc<EventBase>, accepted: AcceptedConn, config: ConnConfig) {
        let con = match TcpConnHandle::attach(base, accepted.fd, accepted.local, accepted.peer) {
            Ok(con) => con,
            Err(e) => {
                warn!("failed to attach accepted connection {}: {e}", accepted.peer);
                unsafe { libc::close(accepted.fd) };
                return;
            }
        };
        if let Some(cb) = config.state_cb {
            con.on_state(Box::new(move |c| cb(c)));
        }
        // `on_read` and `on_msg` both claim the single read-callback slot;
        // a server configured with `on_msg` takes precedence, matching
        // `TcpConn::onMsg`'s own assertion that the two are exclusive.
        match config.msg {
            Some((codec, cb)) => con.on_msg(codec, Box::new(move |c, msg| cb(c, msg))),
            None => {
                if let Some(cb) = config.read_cb {
                    con.on_read(Box::new(move |c| cb(c)));
                }
            }
        }
        info!("accepted connection from {}", accepted.peer);
    }
}
