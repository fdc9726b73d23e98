//! The per-connection state machine. Grounded on `handy::conn.h`/`conn.cc`'s
//! `TcpConn`, restructured around `TcpConnHandle` (a `ReactorHandle` in place
//! of `shared_from_this`/`TcpConnPtr`) and `flux-network`'s `stream.rs` for
//! the socket2-based connect/bind idiom.

use std::cell::RefCell;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::rc::Rc;

use log::{info, trace, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::buffer::Buffer;
use crate::channel::{close_and_notify, Channel};
use crate::codec::{Codec, DecodeOutcome};
use crate::event_base::EventBase;
use crate::idle::IdleId;
use crate::interest::Interest;
use crate::reactor_handle::ReactorHandle;
use crate::timer::{time_millis, TimerId};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnState {
    Invalid,
    Handshaking,
    Connected,
    Closed,
    Failed,
}

pub type ConnCallback = Box<dyn FnMut(&TcpConnHandle)>;
pub type MsgCallback = Box<dyn FnMut(&TcpConnHandle, &[u8])>;

/// Minimum chunk requested from `Buffer::make_room` per read, matching the
/// common default read-buffer size used throughout the corpus.
const READ_CHUNK: usize = 4096;

pub struct TcpConnInner {
    base: Rc<EventBase>,
    channel: Option<Rc<RefCell<Channel>>>,
    input: Buffer,
    output: Buffer,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    state: ConnState,
    read_cb: Option<ConnCallback>,
    writable_cb: Option<ConnCallback>,
    state_cb: Option<ConnCallback>,
    idle_ids: Vec<IdleId>,
    timeout_id: Option<TimerId>,
    dest_host: String,
    dest_port: u16,
    connect_timeout_ms: i64,
    local_ip: Option<IpAddr>,
    /// `-1` (the default) disables reconnection, matching the source
    /// design's sentinel rather than an `Option` - `0` means reconnect
    /// immediately, any other positive value a delay in milliseconds.
    reconnect_interval_ms: i64,
    connected_time_ms: i64,
    codec: Option<Box<dyn Codec>>,
    msg_cb: Option<MsgCallback>,
}

impl TcpConnInner {
    fn new(base: Rc<EventBase>) -> TcpConnInner {
        TcpConnInner {
            base,
            channel: None,
            input: Buffer::new(),
            output: Buffer::new(),
            local: None,
            peer: None,
            state: ConnState::Invalid,
            read_cb: None,
            writable_cb: None,
            state_cb: None,
            idle_ids: Vec::new(),
            timeout_id: None,
            dest_host: String::new(),
            dest_port: 0,
            connect_timeout_ms: 0,
            local_ip: None,
            reconnect_interval_ms: -1,
            connected_time_ms: time_millis(),
            codec: None,
            msg_cb: None,
        }
    }
}

pub type TcpConnHandle = ReactorHandle<TcpConnInner>;

impl TcpConnHandle {
    /// Registers an already-connected (or about-to-handshake) fd onto `con`.
    /// The caller owns `fd` until this call; from here on the channel does.
    fn attach_fd(con: &TcpConnHandle, base: &Rc<EventBase>, fd: RawFd, local: SocketAddr, peer: SocketAddr) -> io::Result<()> {
        crate::sys::set_nonblocking(fd)?;
        crate::sys::set_cloexec(fd)?;
        let channel = Channel::new(base.poller_handle(), fd, Interest::READABLE.add(Interest::WRITABLE))?;
        {
            let c = con.clone();
            channel.borrow_mut().on_read(Box::new(move || TcpConnHandle::handle_read(&c)));
            let c = con.clone();
            channel.borrow_mut().on_write(Box::new(move || TcpConnHandle::handle_write(&c)));
        }
        {
            let mut inner = con.borrow_mut();
            inner.channel = Some(channel);
            inner.state = ConnState::Handshaking;
            inner.local = Some(local);
            inner.peer = Some(peer);
        }
        trace!("tcp constructed {local} - {peer} fd {fd}");
        Ok(())
    }

    /// Registers an already-connected (or about-to-handshake) fd as a brand
    /// new connection, e.g. a freshly accepted socket.
    pub fn attach(base: Rc<EventBase>, fd: RawFd, local: SocketAddr, peer: SocketAddr) -> io::Result<TcpConnHandle> {
        let con = TcpConnHandle::new(TcpConnInner::new(base.clone()));
        TcpConnHandle::attach_fd(&con, &base, fd, local, peer)?;
        Ok(con)
    }

    /// Starts a non-blocking connect against `con`'s destination fields and
    /// wires the connect-timeout timer, reusing whatever handle the caller
    /// passed in - `connect()` hands this a fresh one, `reconnect` the same
    /// handle the caller has been holding onto all along.
    fn start_connect(con: &TcpConnHandle, base: &Rc<EventBase>, host: &str, port: u16, timeout_ms: i64, local_ip: Option<IpAddr>) -> io::Result<()> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved"))?;
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_cloexec(true)?;
        if let Some(ip) = local_ip {
            socket.bind(&SocketAddr::new(ip, 0).into())?;
        }
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => warn!("connect to {host}:{port} failed: {e}"),
        }
        let local = socket.local_addr().ok().and_then(|a| a.as_socket()).unwrap_or(addr);
        let fd = socket.into_raw_fd();

        TcpConnHandle::attach_fd(con, base, fd, local, addr)?;
        {
            let mut inner = con.borrow_mut();
            inner.dest_host = host.to_string();
            inner.dest_port = port;
            inner.connect_timeout_ms = timeout_ms;
            inner.local_ip = local_ip;
            inner.connected_time_ms = time_millis();
        }
        if timeout_ms > 0 {
            let c = con.clone();
            let id = base.run_after(
                timeout_ms,
                Box::new(move || {
                    if c.borrow().state == ConnState::Handshaking {
                        if let Some(ch) = c.borrow().channel.clone() {
                            close_and_notify(&ch);
                        }
                    }
                }),
                0,
            );
            con.borrow_mut().timeout_id = Some(id);
        }
        Ok(())
    }

    /// Starts a non-blocking connect and returns immediately; completion
    /// (or failure) is observed through the handshake's write-readiness,
    /// same as the source design.
    pub fn connect(base: Rc<EventBase>, host: &str, port: u16, timeout_ms: i64, local_ip: Option<IpAddr>) -> io::Result<TcpConnHandle> {
        let con = TcpConnHandle::new(TcpConnInner::new(base.clone()));
        TcpConnHandle::start_connect(&con, &base, host, port, timeout_ms, local_ip)?;
        Ok(con)
    }

    pub fn state(&self) -> ConnState {
        self.borrow().state
    }

    pub fn is_client(&self) -> bool {
        self.borrow().dest_port > 0
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.borrow().local
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.borrow().peer
    }

    /// A `Send`-safe handle back to this connection's own reactor, for
    /// scheduling a `safe_call` from a worker thread that has processed a
    /// message off-reactor and needs to hand the reply back to it.
    pub fn base_handle(&self) -> crate::event_base::EventBaseHandle {
        self.borrow().base.handle()
    }

    pub fn writable(&self) -> bool {
        self.borrow().channel.as_ref().map(|c| c.borrow().write_enabled()).unwrap_or(false)
    }

    pub fn on_read(&self, cb: ConnCallback) {
        assert!(self.borrow().read_cb.is_none(), "onRead already set");
        self.borrow_mut().read_cb = Some(cb);
    }

    pub fn on_writable(&self, cb: ConnCallback) {
        self.borrow_mut().writable_cb = Some(cb);
    }

    pub fn on_state(&self, cb: ConnCallback) {
        self.borrow_mut().state_cb = Some(cb);
    }

    pub fn set_reconnect_interval_ms(&self, millis: i64) {
        self.borrow_mut().reconnect_interval_ms = millis;
    }

    pub fn add_idle_cb(&self, seconds: i64, cb: Box<dyn FnMut(&TcpConnHandle)>) {
        if self.borrow().channel.is_none() {
            return;
        }
        let base = self.borrow().base.clone();
        let id = base.register_idle(seconds, self.clone(), cb);
        self.borrow_mut().idle_ids.push(id);
    }

    /// Installs a message codec; conflicts with `on_read` (only one framing
    /// strategy can own the read callback).
    pub fn on_msg(&self, codec: Box<dyn Codec>, cb: MsgCallback) {
        assert!(self.borrow().read_cb.is_none(), "onMsg conflicts with onRead");
        self.borrow_mut().codec = Some(codec);
        self.borrow_mut().msg_cb = Some(cb);
        let h = self.clone();
        self.borrow_mut().read_cb = Some(Box::new(move |_| TcpConnHandle::dispatch_messages(&h)));
    }

    pub fn send_msg(&self, msg: &[u8]) {
        let mut out = Buffer::new();
        {
            let mut inner = self.borrow_mut();
            let Some(codec) = inner.codec.as_ref() else {
                warn!("send_msg called with no codec installed");
                return;
            };
            codec.encode(msg, &mut out);
        }
        self.send(out.as_slice());
    }

    /// Queues the close for the next reactor tick (mirrors the source
    /// design's `safeCall`-deferred close, so it's safe to call from
    /// inside a read/write callback without reentering cleanup).
    pub fn close(&self) {
        let base = self.borrow().base.clone();
        let c = self.clone();
        base.safe_call(move || {
            if let Some(ch) = c.borrow().channel.clone() {
                close_and_notify(&ch);
            }
        });
    }

    /// Closes immediately. Rarely needed; may drop the last strong
    /// reference to this connection if the caller isn't holding one.
    pub fn close_now(&self) {
        if let Some(ch) = self.borrow().channel.clone() {
            close_and_notify(&ch);
        }
    }

    pub fn send(&self, buf: &[u8]) {
        let has_channel = self.borrow().channel.is_some();
        if !has_channel {
            warn!("connection closed, dropping {} bytes", buf.len());
            return;
        }
        let output_empty = self.borrow().output.is_empty();
        let mut remaining = buf;
        if output_empty {
            let sent = self.isend(remaining);
            remaining = &remaining[sent..];
        }
        if !remaining.is_empty() {
            self.borrow_mut().output.append(remaining);
            let needs_write_interest = !self.borrow().channel.as_ref().map(|c| c.borrow().write_enabled()).unwrap_or(true);
            if needs_write_interest {
                if let Some(ch) = self.borrow().channel.clone() {
                    ch.borrow_mut().enable_write(true);
                }
            }
        }
    }

    /// Writes as much of `buf` as the socket accepts right now, enabling
    /// write-readiness watching if it can't all go out immediately.
    fn isend(&self, buf: &[u8]) -> usize {
        let fd = match self.borrow().channel.as_ref().map(|c| c.borrow().as_raw_fd()) {
            Some(fd) if fd >= 0 => fd,
            _ => return 0,
        };
        let mut sent = 0;
        while sent < buf.len() {
            let n = unsafe { libc::write(fd, buf[sent..].as_ptr() as *const libc::c_void, buf.len() - sent) };
            if n > 0 {
                sent += n as usize;
                continue;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => {
                    if let Some(ch) = self.borrow().channel.clone() {
                        if !ch.borrow().write_enabled() {
                            ch.borrow_mut().enable_write(true);
                        }
                    }
                    break;
                }
                _ => {
                    warn!("write error on fd {fd}: {err}");
                    break;
                }
            }
        }
        sent
    }

    fn handle_read(con: &TcpConnHandle) {
        if con.borrow().state == ConnState::Handshaking {
            TcpConnHandle::handle_handshake(con);
            return;
        }
        loop {
            if con.borrow().state != ConnState::Connected {
                break;
            }
            let fd = con.borrow().channel.as_ref().map(|c| c.borrow().as_raw_fd()).unwrap_or(-1);
            if fd < 0 {
                TcpConnHandle::cleanup(con);
                break;
            }
            let rd = {
                let mut inner = con.borrow_mut();
                let space = inner.input.make_room(READ_CHUNK);
                unsafe { libc::read(fd, space.as_mut_ptr() as *mut libc::c_void, space.len()) }
            };
            if rd > 0 {
                con.borrow_mut().input.add_size(rd as usize);
                continue;
            }
            let err = io::Error::last_os_error();
            if rd < 0 && err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            if rd < 0 && err.kind() == io::ErrorKind::WouldBlock {
                let now_s = time_millis() / 1000;
                let ids: Vec<IdleId> = con.borrow().idle_ids.clone();
                let base = con.borrow().base.clone();
                for id in ids {
                    base.update_idle(id, now_s);
                }
                let has_data = con.borrow().input.size() > 0;
                if has_data {
                    let taken = con.borrow_mut().read_cb.take();
                    if let Some(mut cb) = taken {
                        cb(con);
                        con.borrow_mut().read_cb = Some(cb);
                    }
                }
                break;
            }
            // rd == 0 (peer closed) or a real read error
            TcpConnHandle::cleanup(con);
            break;
        }
    }

    fn handle_handshake(con: &TcpConnHandle) {
        let fd = match con.borrow().channel.as_ref().map(|c| c.borrow().as_raw_fd()) {
            Some(fd) if fd >= 0 => fd,
            _ => return,
        };
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLOUT | libc::POLLERR,
            revents: 0,
        };
        let r = unsafe { libc::poll(&mut pfd, 1, 0) };
        if r == 1 && pfd.revents & libc::POLLOUT != 0 && pfd.revents & libc::POLLERR == 0 {
            if let Some(ch) = con.borrow().channel.clone() {
                ch.borrow_mut().enable_read_write(true, false);
            }
            con.borrow_mut().state = ConnState::Connected;
            con.borrow_mut().connected_time_ms = time_millis();
            let (local, peer) = (con.borrow().local, con.borrow().peer);
            trace!("tcp connected {:?} - {:?} fd {fd}", local, peer);
            let taken = con.borrow_mut().state_cb.take();
            if let Some(mut cb) = taken {
                cb(con);
                con.borrow_mut().state_cb = Some(cb);
            }
        } else {
            trace!("handshake poll fd {fd} returned {r} revents {}", pfd.revents);
            TcpConnHandle::cleanup(con);
        }
    }

    fn handle_write(con: &TcpConnHandle) {
        match con.borrow().state {
            ConnState::Handshaking => TcpConnHandle::handle_handshake(con),
            ConnState::Connected => {
                let pending = {
                    let inner = con.borrow();
                    inner.output.as_slice().to_vec()
                };
                let sent = con.isend(&pending);
                con.borrow_mut().output.consume(sent);
                let empty = con.borrow().output.is_empty();
                if empty {
                    let taken = con.borrow_mut().writable_cb.take();
                    if let Some(mut cb) = taken {
                        cb(con);
                        con.borrow_mut().writable_cb = Some(cb);
                    }
                }
                let still_empty = con.borrow().output.is_empty();
                if still_empty {
                    if let Some(ch) = con.borrow().channel.clone() {
                        if ch.borrow().write_enabled() {
                            ch.borrow_mut().enable_write(false);
                        }
                    }
                }
            }
            _ => warn!("handle_write called in unexpected state"),
        }
    }

    fn dispatch_messages(con: &TcpConnHandle) {
        enum Step {
            More,
            Close,
            Frame(Vec<u8>),
        }
        loop {
            let step = {
                let mut inner = con.borrow_mut();
                let TcpConnInner { codec, input, .. } = &mut *inner;
                let codec = codec.as_mut().expect("codec set by on_msg");
                match codec.try_decode(input) {
                    Ok(DecodeOutcome::NeedMore) => Step::More,
                    Ok(DecodeOutcome::Frame { consumed, msg }) => {
                        let owned = msg.as_bytes().to_vec();
                        input.consume(consumed);
                        Step::Frame(owned)
                    }
                    Err(e) => {
                        warn!("codec error, closing connection: {e}");
                        Step::Close
                    }
                }
            };
            match step {
                Step::More => break,
                Step::Close => {
                    if let Some(ch) = con.borrow().channel.clone() {
                        close_and_notify(&ch);
                    }
                    break;
                }
                Step::Frame(bytes) => {
                    let taken = con.borrow_mut().msg_cb.take();
                    if let Some(mut cb) = taken {
                        cb(con, &bytes);
                        con.borrow_mut().msg_cb = Some(cb);
                    }
                }
            }
        }
    }

    fn cleanup(con: &TcpConnHandle) {
        let has_data = {
            let inner = con.borrow();
            inner.read_cb.is_some() && inner.input.size() > 0
        };
        if has_data {
            let taken = con.borrow_mut().read_cb.take();
            if let Some(mut cb) = taken {
                cb(con);
                con.borrow_mut().read_cb = Some(cb);
            }
        }
        let was_handshaking = con.borrow().state == ConnState::Handshaking;
        con.borrow_mut().state = if was_handshaking { ConnState::Failed } else { ConnState::Closed };
        let (local, peer) = (con.borrow().local, con.borrow().peer);
        trace!("tcp closing {local:?} - {peer:?}");

        let base = con.borrow().base.clone();
        if let Some(id) = con.borrow_mut().timeout_id.take() {
            base.cancel(id);
        }
        let taken = con.borrow_mut().state_cb.take();
        if let Some(mut cb) = taken {
            cb(con);
            con.borrow_mut().state_cb = Some(cb);
        }

        let reconnect_ms = con.borrow().reconnect_interval_ms;
        if reconnect_ms >= 0 && !base.exited() {
            TcpConnHandle::reconnect(con);
            return;
        }

        let ids: Vec<IdleId> = con.borrow_mut().idle_ids.drain(..).collect();
        for id in ids {
            base.unregister_idle(id);
        }
        con.borrow_mut().read_cb = None;
        con.borrow_mut().writable_cb = None;
        con.borrow_mut().state_cb = None;
        // Drop this connection's captured closures from the channel before
        // dropping the channel itself - otherwise, if this is the last
        // strong reference, the channel's own `Drop` would fire a read
        // callback that reenters this connection's already-half-torn-down
        // state.
        if let Some(ch) = con.borrow().channel.clone() {
            ch.borrow_mut().clear_callbacks();
        }
        con.borrow_mut().channel = None;
    }

    fn reconnect(con: &TcpConnHandle) {
        let base = con.borrow().base.clone();
        base.add_reconnecting(con.clone());
        let (interval, connected_at) = {
            let inner = con.borrow();
            (inner.reconnect_interval_ms, inner.connected_time_ms)
        };
        let wait = (interval - (time_millis() - connected_at)).max(0);
        info!("will reconnect after {wait} ms");
        let c = con.clone();
        base.run_after(
            wait,
            Box::new(move || {
                let base = c.borrow().base.clone();
                base.remove_reconnecting(&c);
                let (host, port, timeout, local_ip) = {
                    let inner = c.borrow();
                    (inner.dest_host.clone(), inner.dest_port, inner.connect_timeout_ms, inner.local_ip)
                };
                if let Err(e) = TcpConnHandle::reconnect_in_place(&c, &base, &host, port, timeout, local_ip) {
                    warn!("reconnect to {host}:{port} failed: {e}");
                }
            }),
            0,
        );
        if let Some(ch) = con.borrow().channel.clone() {
            ch.borrow_mut().clear_callbacks();
        }
        con.borrow_mut().channel = None;
    }

    /// Re-runs the connect sequence against the existing handle rather than
    /// allocating a new `TcpConnHandle`, so callers that stashed this handle
    /// elsewhere keep watching the same connection across a reconnect.
    fn reconnect_in_place(con: &TcpConnHandle, base: &Rc<EventBase>, host: &str, port: u16, timeout_ms: i64, local_ip: Option<IpAddr>) -> io::Result<()> {
        TcpConnHandle::start_connect(con, base, host, port, timeout_ms, local_ip)
    }

    /// Called once by `EventBase::run` as it unwinds, for connections still
    /// waiting on a reconnect timer when the reactor is told to stop.
    pub fn cleanup_for_shutdown(&self) {
        self.borrow_mut().reconnect_interval_ms = -1;
        self.borrow_mut().state = ConnState::Closed;
        if let Some(ch) = self.borrow().channel.clone() {
            ch.borrow_mut().clear_callbacks();
        }
        self.borrow_mut().channel = None;
    }
}

/// Pulls the three pieces of address info a freshly `accept`ed fd needs.
pub(crate) fn accepted_addresses(fd: RawFd) -> io::Result<(SocketAddr, SocketAddr)> {
    let stream = unsafe { TcpStream::from_raw_fd(fd) };
    let local = stream.local_addr();
    let peer = stream.peer_addr();
    let _ = stream.into_raw_fd(); // give the fd back to the caller, who still owns it
    Ok((local?, peer?))
}
