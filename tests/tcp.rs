use std::cell::{Cell, RefCell};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

mod util;
use util::init;

use compactreactor::{ConnState, EventBase, Hsha, LineCodec, MultiBase, TcpConnHandle, TcpServer};

const STEP: Duration = Duration::from_millis(5);

fn spin_until(deadline: Instant, mut done: impl FnMut() -> bool) -> bool {
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(STEP);
    }
    done()
}

/// A `TcpServer` built on its own reactor, echoing every `LineCodec` frame
/// back to the sender, with accepted connections dealt across a separate
/// single-reactor `MultiBase` pool - exercising the cross-reactor
/// `safe_call`/`EventBase::current()` accept-dispatch path. The listener's
/// own `EventBase` is an `Rc` and so can never leave this thread (it holds
/// `RefCell`/`Cell` state and isn't `Send`); it's driven by hand via
/// `loop_once` here while the client runs on a background thread, and only
/// the (`Send + Sync`) `MultiBase` pool gets its own thread.
#[test]
fn echoes_line_messages_over_loopback() {
    init();

    let base = EventBase::new_shared().unwrap();
    let bases = Rc::new(MultiBase::new(1).unwrap());

    let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), base.clone(), bases.clone()).unwrap();
    let addr = server.addr();
    server.on_msg(
        Box::new(LineCodec),
        Arc::new(|con: &TcpConnHandle, msg: &[u8]| {
            con.send_msg(msg);
        }),
    );

    let bases_runner = bases.clone();
    let pool_thread = thread::spawn(move || bases_runner.run());

    let (tx, rx) = mpsc::channel();
    let client_thread = thread::spawn(move || {
        let mut client = TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(b"hello\r\n").unwrap();
        let mut reader = BufReader::new(client.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let _ = tx.send(line);
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    let line = loop {
        base.loop_once(5).unwrap();
        if let Ok(line) = rx.try_recv() {
            break line;
        }
        assert!(Instant::now() < deadline, "timed out waiting for the echoed line");
    };
    assert_eq!(line, "hello\r\n");

    client_thread.join().unwrap();
    server.close();
    base.exit();
    bases.exit();
    pool_thread.join().unwrap();
}

/// A lone `EventBase` driven by hand via `loop_once`, connecting out to a
/// plain blocking `TcpListener` on another thread - no second reactor, no
/// background driver, just the handshake/read/write state machine.
#[test]
fn client_connect_handshakes_and_receives_reply() {
    init();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peer_thread = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        stream.write_all(format!("echo: {line}").as_bytes()).unwrap();
    });

    let base = EventBase::new_shared().unwrap();
    let con = TcpConnHandle::connect(base.clone(), "127.0.0.1", addr.port(), 1000, None).unwrap();

    let connected = Rc::new(RefCell::new(false));
    {
        let connected = connected.clone();
        con.on_state(Box::new(move |c| {
            if c.state() == ConnState::Connected {
                *connected.borrow_mut() = true;
            }
        }));
    }
    let received = Rc::new(RefCell::new(Vec::new()));
    {
        let received = received.clone();
        con.on_msg(
            Box::new(LineCodec),
            Box::new(move |_, msg| received.borrow_mut().extend_from_slice(msg)),
        );
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    assert!(
        spin_until(deadline, || {
            base.loop_once(5).unwrap();
            *connected.borrow()
        }),
        "connection never reached the Connected state"
    );

    con.send_msg(b"ping");

    assert!(
        spin_until(deadline, || {
            base.loop_once(5).unwrap();
            !received.borrow().is_empty()
        }),
        "never received a reply from the peer"
    );
    assert_eq!(&*received.borrow(), b"echo: ping");

    peer_thread.join().unwrap();
    base.exit();
}

/// `Hsha` offloads the decoded message to a worker thread; the worker's
/// reply has to cross back over `safe_call` onto the connection's own
/// reactor before the bytes hit the wire.
#[test]
fn hsha_processes_off_reactor_and_replies_in_line() {
    init();

    let base = EventBase::new_shared().unwrap();
    let bases = Rc::new(MultiBase::new(1).unwrap());
    let hsha = Hsha::start_server("127.0.0.1:0".parse().unwrap(), base.clone(), bases.clone(), 2).unwrap();
    let addr = hsha.server().addr();

    hsha.on_msg(
        Box::new(LineCodec),
        Arc::new(|_con: &TcpConnHandle, msg: &[u8]| {
            let mut upper = msg.to_vec();
            upper.make_ascii_uppercase();
            Some(upper)
        }),
    );

    let bases_runner = bases.clone();
    let pool_thread = thread::spawn(move || bases_runner.run());

    let (tx, rx) = mpsc::channel();
    let client_thread = thread::spawn(move || {
        let mut client = TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(b"shout\r\n").unwrap();
        let mut reader = BufReader::new(client.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let _ = tx.send(line);
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    let line = loop {
        base.loop_once(5).unwrap();
        if let Ok(line) = rx.try_recv() {
            break line;
        }
        assert!(Instant::now() < deadline, "timed out waiting for the uppercased reply");
    };
    assert_eq!(line, "SHOUT\r\n");

    client_thread.join().unwrap();
    hsha.exit();
    hsha.server().close();
    base.exit();
    bases.exit();
    pool_thread.join().unwrap();
}

/// `register_idle`'s 1-second sweep should fire once a connection has sat
/// quiet past its configured idle threshold.
#[test]
fn idle_callback_fires_after_quiet_period() {
    init();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peer_thread = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        // Hold the connection open without sending anything.
        thread::sleep(Duration::from_secs(3));
        drop(stream);
    });

    let base = EventBase::new_shared().unwrap();
    let con = TcpConnHandle::connect(base.clone(), "127.0.0.1", addr.port(), 1000, None).unwrap();

    let idled = Arc::new(Mutex::new(false));
    {
        let idled = idled.clone();
        con.add_idle_cb(
            1,
            Box::new(move |_| {
                *idled.lock().unwrap() = true;
            }),
        );
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    assert!(
        spin_until(deadline, || {
            base.loop_once(50).unwrap();
            *idled.lock().unwrap()
        }),
        "idle callback never fired"
    );

    base.exit();
    peer_thread.join().unwrap();
}

/// A dropped connection with `reconnect_interval_ms` set re-attaches and
/// reaches `Connected` again on its own, against the same host/port it was
/// originally given.
#[test]
fn reconnect_after_connection_loss() {
    init();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peer_thread = thread::spawn(move || {
        for _ in 0..2 {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(50));
            drop(stream);
        }
    });

    let base = EventBase::new_shared().unwrap();
    let con = TcpConnHandle::connect(base.clone(), "127.0.0.1", addr.port(), 1000, None).unwrap();
    con.set_reconnect_interval_ms(50);

    let connected_count = Rc::new(Cell::new(0u32));
    {
        let connected_count = connected_count.clone();
        con.on_state(Box::new(move |c| {
            if c.state() == ConnState::Connected {
                connected_count.set(connected_count.get() + 1);
            }
        }));
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    assert!(
        spin_until(deadline, || {
            base.loop_once(10).unwrap();
            connected_count.get() >= 2
        }),
        "connection never reconnected after being dropped"
    );

    peer_thread.join().unwrap();
    base.exit();
}
