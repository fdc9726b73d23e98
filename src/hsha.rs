//! Half-sync/half-async adapter: frames are decoded on the reactor thread
//! that owns the connection, then handed to a worker pool to process, with
//! the reply marshalled back onto that same reactor before being sent.
//! Grounded on `handy::conn.h`/`conn.cc`'s `HSHA`.

use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use crate::codec::Codec;
use crate::event_base::{EventBase, MultiBase};
use crate::tcp_conn::TcpConnHandle;
use crate::tcp_server::TcpServer;
use crate::thread_pool::ThreadPool;

/// Computes a reply off the reactor thread. `None` (or an empty reply)
/// suppresses the send, matching `HSHA::onMsg`'s `if (output.size())`.
pub type ReplyCallback = Arc<dyn Fn(&TcpConnHandle, &[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// A `TcpServer` paired with a fixed-size worker pool, wired so decoded
/// messages are processed off the reactor and replies find their way back
/// to the right connection's own reactor before being written out.
pub struct Hsha {
    server: TcpServer,
    pool: Arc<ThreadPool>,
}

impl Hsha {
    pub fn start_server(addr: SocketAddr, base: Rc<EventBase>, bases: Rc<MultiBase>, threads: usize) -> io::Result<Hsha> {
        let server = TcpServer::bind(addr, base, bases)?;
        Ok(Hsha {
            server,
            pool: Arc::new(ThreadPool::new(threads)),
        })
    }

    pub fn server(&self) -> &TcpServer {
        &self.server
    }

    /// Installs `codec` on the server and routes every decoded message to a
    /// worker running `cb`. Each message is copied off the connection
    /// before crossing to the worker thread; the reply, if any, is sent via
    /// a `safe_call` back onto the connection's own reactor.
    pub fn on_msg(&self, codec: Box<dyn Codec>, cb: ReplyCallback) {
        let pool = self.pool.clone();
        self.server.on_msg(
            codec,
            Arc::new(move |con: &TcpConnHandle, msg: &[u8]| {
                let con = con.clone();
                let input = msg.to_vec();
                let cb = cb.clone();
                pool.add_task(move || {
                    let output = cb(&con, &input);
                    if let Some(output) = output.filter(|o| !o.is_empty()) {
                        let handle = con.base_handle();
                        handle.safe_call(move || con.send_msg(&output));
                    }
                });
            }),
        );
    }

    /// Signals the worker pool to stop once its queue drains; does not
    /// touch the reactor side (the server keeps accepting until the
    /// reactor it lives on exits).
    pub fn exit(&self) {
        self.pool.exit();
    }
}
