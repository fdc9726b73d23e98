//! The reactor: one `Poller`, a cross-thread task queue fed through a wake
//! pipe, a timer map, and idle-connection tracking. Grounded on
//! `handy::event_base.h`/`.cc`'s `EventBase`/`EventsImp`, with `MultiBase`
//! covering the same file's `EventBases`/round-robin dispatch.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{error, trace};

use crate::channel::Channel;
use crate::idle::{IdleBuckets, IdleId};
use crate::interest::Interest;
use crate::poller::Poller;
use crate::safe_queue::SafeQueue;
use crate::tcp_conn::TcpConnHandle;
use crate::timer::{time_millis, TimerId, TimerKey};

/// A task that runs on its reactor's own thread - never required to be
/// `Send`, since it's always either constructed there directly or arrives
/// already wrapped as a `SafeTask` through `safe_call`.
pub type Task = Box<dyn FnMut() + 'static>;

/// A task handed to `safe_call`/`EventBaseHandle::safe_call` from a
/// different thread, to run on the reactor's own thread once drained from
/// the wake-pipe queue.
pub type SafeTask = Box<dyn FnMut() + Send + 'static>;

enum TimerTarget {
    Once(Task),
    Repeat(u64),
}

struct Repeatable {
    interval_ms: i64,
    current_key: TimerKey,
    task: Task,
}

fn wake(fd: RawFd) {
    loop {
        let r = unsafe { libc::write(fd, [1u8].as_ptr() as *const libc::c_void, 1) };
        if r >= 0 {
            return;
        }
        match io::Error::last_os_error().kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => return, // a wake byte is already pending
            kind => panic!("wake pipe write failed: {kind:?}"),
        }
    }
}

/// The thread-safe sliver of an `EventBase`: enough to queue a task and
/// request a wakeup from any thread, without any of the reactor's own
/// `Rc`/`RefCell` state coming along for the ride. This is what
/// `MultiBase::alloc_base` hands out and what a `TcpConn` keeps for the
/// rare cross-thread call (an `HSHA` worker posting a reply back to its
/// connection's owning reactor).
#[derive(Clone)]
pub struct EventBaseHandle {
    tasks: Arc<SafeQueue<SafeTask>>,
    wake_write: Arc<OwnedFd>,
    exit: Arc<AtomicBool>,
}

impl EventBaseHandle {
    pub fn safe_call<F: FnMut() + Send + 'static>(&self, task: F) -> bool {
        if self.exit.load(Ordering::Relaxed) {
            return false;
        }
        if !self.tasks.push(Box::new(task)) {
            return false;
        }
        wake(self.wake_write.as_raw_fd());
        true
    }

    pub fn exit(&self) {
        self.exit.store(true, Ordering::Relaxed);
        wake(self.wake_write.as_raw_fd());
    }

    pub fn exited(&self) -> bool {
        self.exit.load(Ordering::Relaxed)
    }

    /// True if `self` and `other` refer to the same reactor - its task queue
    /// is unique per `EventBase` and never rebuilt, so comparing its `Arc`
    /// identity is equivalent to comparing the reactors themselves.
    pub fn ptr_eq(&self, other: &EventBaseHandle) -> bool {
        Arc::ptr_eq(&self.tasks, &other.tasks)
    }
}

#[derive(Default)]
pub struct EventBaseBuilder {
    task_capacity: usize,
}

impl EventBaseBuilder {
    pub fn new() -> EventBaseBuilder {
        EventBaseBuilder::default()
    }

    /// 0 (the default) means unbounded, matching `SafeQueue`'s convention.
    pub fn task_capacity(mut self, capacity: usize) -> EventBaseBuilder {
        self.task_capacity = capacity;
        self
    }

    pub fn build(self) -> io::Result<EventBase> {
        EventBase::with_builder(self)
    }
}

pub struct EventBase {
    poller: Rc<RefCell<Poller>>,
    wake_write: Arc<OwnedFd>,
    // Kept alive for the reactor's lifetime; never read after construction.
    _wake_channel: Rc<RefCell<Channel>>,
    tasks: Arc<SafeQueue<SafeTask>>,
    timers: RefCell<BTreeMap<TimerKey, TimerTarget>>,
    repeatables: RefCell<HashMap<u64, Repeatable>>,
    timer_seq: Cell<u64>,
    idle: RefCell<IdleBuckets>,
    idle_sweep_armed: Cell<bool>,
    next_idle_sweep_ms: Cell<i64>,
    reconnecting: RefCell<Vec<TcpConnHandle>>,
    exit: Arc<AtomicBool>,
}

const MAX_WAIT_MS: i64 = 10_000;

thread_local! {
    /// The reactor currently running `run()` on this thread, if any. Lets a
    /// `safe_call`-queued closure - which always executes back on its
    /// target reactor's own thread - recover that reactor's `Rc<EventBase>`
    /// without having to thread it through manually, the way `TcpServer`'s
    /// cross-reactor accept dispatch needs to.
    static CURRENT: RefCell<Option<Rc<EventBase>>> = const { RefCell::new(None) };
}

impl EventBase {
    pub fn new() -> io::Result<EventBase> {
        EventBaseBuilder::new().build()
    }

    pub fn new_shared() -> io::Result<Rc<EventBase>> {
        Ok(Rc::new(EventBase::new()?))
    }

    fn with_builder(builder: EventBaseBuilder) -> io::Result<EventBase> {
        let poller = Rc::new(RefCell::new(Poller::new()?));
        let (wake_read, wake_write) = crate::sys::wake_pipe()?;
        let wake_write = Arc::new(wake_write);
        let tasks: Arc<SafeQueue<SafeTask>> = Arc::new(SafeQueue::new(builder.task_capacity));

        let wake_read_fd = wake_read.into_raw_fd();
        let wake_channel = Channel::new(poller.clone(), wake_read_fd, Interest::READABLE)?;
        let drain_tasks = tasks.clone();
        wake_channel.borrow_mut().on_read(Box::new(move || {
            let mut scratch = [0u8; 64];
            loop {
                let n = unsafe { libc::read(wake_read_fd, scratch.as_mut_ptr() as *mut libc::c_void, scratch.len()) };
                if n <= 0 {
                    break;
                }
            }
            while let Some(mut task) = drain_tasks.pop_wait(Some(Duration::ZERO)) {
                task();
            }
        }));

        Ok(EventBase {
            poller,
            wake_write,
            _wake_channel: wake_channel,
            tasks,
            timers: RefCell::new(BTreeMap::new()),
            repeatables: RefCell::new(HashMap::new()),
            timer_seq: Cell::new(0),
            idle: RefCell::new(IdleBuckets::new()),
            idle_sweep_armed: Cell::new(false),
            next_idle_sweep_ms: Cell::new(i64::MAX),
            reconnecting: RefCell::new(Vec::new()),
            exit: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn handle(&self) -> EventBaseHandle {
        EventBaseHandle {
            tasks: self.tasks.clone(),
            wake_write: self.wake_write.clone(),
            exit: self.exit.clone(),
        }
    }

    pub fn poller_handle(&self) -> Rc<RefCell<Poller>> {
        self.poller.clone()
    }

    pub fn exited(&self) -> bool {
        self.exit.load(Ordering::Relaxed)
    }

    pub fn exit(&self) {
        self.exit.store(true, Ordering::Relaxed);
        self.wakeup();
    }

    pub fn wakeup(&self) {
        wake(self.wake_write.as_raw_fd());
    }

    /// Queues `task` to run on this reactor's own thread; safe to call from
    /// any thread. Returns `false` if the reactor has exited or the task
    /// queue is at capacity.
    pub fn safe_call<F: FnMut() + Send + 'static>(&self, task: F) -> bool {
        if self.exited() {
            return false;
        }
        if !self.tasks.push(Box::new(task)) {
            return false;
        }
        self.wakeup();
        true
    }

    fn next_seq(&self) -> u64 {
        let seq = self.timer_seq.get();
        self.timer_seq.set(seq + 1);
        seq
    }

    /// `interval_ms > 0` makes this a repeating timer; the returned
    /// `TimerId` carries a negated deadline as the repeating-timer marker
    /// (see `TimerId::is_repeating`).
    pub fn run_at(&self, deadline_ms: i64, task: Task, interval_ms: i64) -> TimerId {
        if interval_ms > 0 {
            let rep_seq = self.next_seq();
            let seq = self.next_seq();
            let key = TimerKey { deadline_ms, seq };
            self.timers.borrow_mut().insert(key, TimerTarget::Repeat(rep_seq));
            self.repeatables.borrow_mut().insert(
                rep_seq,
                Repeatable {
                    interval_ms,
                    current_key: key,
                    task,
                },
            );
            TimerId(TimerKey {
                deadline_ms: -deadline_ms.max(1),
                seq: rep_seq,
            })
        } else {
            let seq = self.next_seq();
            let key = TimerKey { deadline_ms, seq };
            self.timers.borrow_mut().insert(key, TimerTarget::Once(task));
            TimerId(key)
        }
    }

    pub fn run_after(&self, delay_ms: i64, task: Task, interval_ms: i64) -> TimerId {
        self.run_at(time_millis() + delay_ms, task, interval_ms)
    }

    /// Cancelling a repeating timer from inside its own firing callback is
    /// not supported - its `Repeatable` record is absent for the duration
    /// of that callback (see `handle_timeouts`), so the cancel is a no-op.
    /// Cancelling from any other context works normally.
    pub fn cancel(&self, id: TimerId) -> bool {
        if id.is_repeating() {
            match self.repeatables.borrow_mut().remove(&id.0.seq) {
                Some(rep) => {
                    self.timers.borrow_mut().remove(&rep.current_key);
                    true
                }
                None => false,
            }
        } else {
            self.timers.borrow_mut().remove(&id.0).is_some()
        }
    }

    fn handle_timeouts(&self) {
        let now = time_millis();
        loop {
            let due = {
                let timers = self.timers.borrow();
                timers.keys().next().copied().filter(|k| k.deadline_ms <= now)
            };
            let Some(key) = due else { break };
            let target = self.timers.borrow_mut().remove(&key).expect("key just observed present");
            match target {
                TimerTarget::Once(mut task) => task(),
                TimerTarget::Repeat(rep_seq) => {
                    if let Some(mut rep) = self.repeatables.borrow_mut().remove(&rep_seq) {
                        let next_at = key.deadline_ms + rep.interval_ms;
                        let next_key = TimerKey {
                            deadline_ms: next_at,
                            seq: self.next_seq(),
                        };
                        self.timers.borrow_mut().insert(next_key, TimerTarget::Repeat(rep_seq));
                        rep.current_key = next_key;
                        (rep.task)();
                        self.repeatables.borrow_mut().insert(rep_seq, rep);
                    }
                }
            }
        }
    }

    pub fn register_idle(&self, seconds: i64, conn: TcpConnHandle, cb: Box<dyn FnMut(&TcpConnHandle)>) -> IdleId {
        if !self.idle_sweep_armed.replace(true) {
            self.next_idle_sweep_ms.set(time_millis() + 1000);
        }
        let now_s = time_millis() / 1000;
        self.idle.borrow_mut().register(seconds, conn, now_s, cb)
    }

    pub fn unregister_idle(&self, id: IdleId) {
        self.idle.borrow_mut().unregister(id);
    }

    pub fn update_idle(&self, id: IdleId, now_seconds: i64) {
        self.idle.borrow_mut().update(id, now_seconds);
    }

    fn maybe_sweep_idle(&self) {
        if !self.idle_sweep_armed.get() {
            return;
        }
        let now = time_millis();
        if now < self.next_idle_sweep_ms.get() {
            return;
        }
        self.idle.borrow_mut().sweep(now / 1000);
        self.next_idle_sweep_ms.set(now + 1000);
    }

    pub fn add_reconnecting(&self, conn: TcpConnHandle) {
        self.reconnecting.borrow_mut().push(conn);
    }

    pub fn remove_reconnecting(&self, conn: &TcpConnHandle) {
        self.reconnecting.borrow_mut().retain(|c| !c.ptr_eq(conn));
    }

    fn next_wait_ms(&self) -> i64 {
        let now = time_millis();
        let mut wait = MAX_WAIT_MS;
        if let Some(key) = self.timers.borrow().keys().next() {
            wait = wait.min((key.deadline_ms - now).max(0));
        }
        if self.idle_sweep_armed.get() {
            wait = wait.min((self.next_idle_sweep_ms.get() - now).max(0));
        }
        wait
    }

    /// Dispatches fds the poller reported ready back to their owning
    /// channels, then runs due timers and idle sweeps. Exposed directly so
    /// tests can single-step the reactor without calling `run`.
    pub fn loop_once(&self, wait_ms: i64) -> io::Result<()> {
        let timeout = if wait_ms < 0 {
            None
        } else {
            Some(Duration::from_millis(wait_ms as u64))
        };
        let events = self.poller.borrow_mut().wait(timeout)?;
        for (fd, readiness) in events {
            let target = self.poller.borrow().dispatch_target(fd);
            let Some(channel) = target else { continue };
            // Each callback is taken out and invoked with no borrow of
            // `channel` outstanding, since the callback itself (indirectly,
            // through the connection it belongs to) is free to re-touch
            // this same channel - closing it, toggling write interest, or
            // checking whether it's still open.
            if readiness.readable {
                if let Some(mut cb) = channel.borrow_mut().take_read_cb() {
                    cb();
                    if channel.borrow().as_raw_fd() >= 0 {
                        channel.borrow_mut().put_read_cb(cb);
                    }
                }
            }
            if channel.borrow().as_raw_fd() >= 0 && readiness.writable {
                if let Some(mut cb) = channel.borrow_mut().take_write_cb() {
                    cb();
                    if channel.borrow().as_raw_fd() >= 0 {
                        channel.borrow_mut().put_write_cb(cb);
                    }
                }
            }
        }
        self.handle_timeouts();
        self.maybe_sweep_idle();
        Ok(())
    }

    /// Returns the reactor running on the calling thread, if `run` is
    /// currently on the stack there. A `safe_call` closure dispatched to a
    /// given reactor always executes from inside that reactor's own `run`,
    /// so this is how it recovers a full `Rc<EventBase>` for its own thread
    /// rather than just the `Send`-safe `EventBaseHandle` sliver it was
    /// handed.
    pub fn current() -> Option<Rc<EventBase>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    pub fn run(self: Rc<Self>) {
        trace!("reactor loop starting");
        CURRENT.with(|c| *c.borrow_mut() = Some(self.clone()));
        while !self.exited() {
            let wait_ms = self.next_wait_ms();
            if let Err(e) = self.loop_once(wait_ms) {
                error!("reactor loop_once failed: {e}");
            }
        }
        self.timers.borrow_mut().clear();
        self.repeatables.borrow_mut().clear();
        self.idle.borrow_mut().clear();
        for conn in self.reconnecting.borrow_mut().drain(..) {
            conn.borrow_mut().cleanup_for_shutdown();
        }
        // one last pass to drain any safe_call tasks queued during shutdown
        let _ = self.loop_once(0);
        CURRENT.with(|c| *c.borrow_mut() = None);
        trace!("reactor loop exited");
    }
}

/// Moves an otherwise-`!Send` value to the single new thread that will own
/// it from here on. Safe because `MultiBase::new` constructs each
/// `EventBase` with no outstanding references (no `Channel`/`TcpConn` has
/// been built against it yet) and hands it to exactly one thread, which
/// never gives it back.
struct MoveToThread<T>(T);
unsafe impl<T> Send for MoveToThread<T> {}

/// Round-robins accepted connections across a fixed set of reactors, one
/// per worker thread plus the calling thread. Grounded on
/// `handy::event_base.h`'s `EventBases`.
pub struct MultiBase {
    handles: Vec<EventBaseHandle>,
    pending: Mutex<Vec<Option<MoveToThread<EventBase>>>>,
    next: AtomicUsize,
}

impl MultiBase {
    pub fn new(count: usize) -> io::Result<MultiBase> {
        let n = count.max(1);
        let mut handles = Vec::with_capacity(n);
        let mut pending = Vec::with_capacity(n);
        for _ in 0..n {
            let base = EventBase::new()?;
            handles.push(base.handle());
            pending.push(Some(MoveToThread(base)));
        }
        Ok(MultiBase {
            handles,
            pending: Mutex::new(pending),
            next: AtomicUsize::new(0),
        })
    }

    pub fn base_count(&self) -> usize {
        self.handles.len()
    }

    pub fn alloc_base(&self) -> EventBaseHandle {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        self.handles[i].clone()
    }

    /// Runs reactors `0..n-1` each on its own thread and reactor `n-1`
    /// inline on the calling thread, blocking until every reactor exits.
    /// Call once; a second call is a no-op (`pending` is drained by the
    /// first).
    pub fn run(&self) {
        let n = self.handles.len();
        let mut pending = self.pending.lock().expect("multi-base pending lock poisoned");
        let mut workers = Vec::with_capacity(n.saturating_sub(1));
        for slot in pending.iter_mut().take(n.saturating_sub(1)) {
            let Some(MoveToThread(base)) = slot.take() else { continue };
            workers.push(thread::spawn(move || Rc::new(base).run()));
        }
        let last = pending[n - 1].take();
        drop(pending);
        if let Some(MoveToThread(base)) = last {
            Rc::new(base).run();
        }
        for w in workers {
            let _ = w.join();
        }
    }

    pub fn exit(&self) {
        for handle in &self.handles {
            handle.exit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as TestCounter;

    #[test]
    fn one_shot_timer_fires_once() {
        let base = EventBase::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        let f = fired.clone();
        base.run_at(time_millis() - 1, Box::new(move || f.set(f.get() + 1)), 0);
        base.loop_once(0).unwrap();
        assert_eq!(fired.get(), 1);
        base.loop_once(0).unwrap();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn repeating_timer_reschedules_itself() {
        let base = EventBase::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        let f = fired.clone();
        let id = base.run_at(time_millis() - 1, Box::new(move || f.set(f.get() + 1)), 1);
        for _ in 0..3 {
            thread::sleep(Duration::from_millis(2));
            base.loop_once(0).unwrap();
        }
        assert_eq!(fired.get(), 3);
        assert!(base.cancel(id));
        assert!(!base.cancel(id));
    }

    #[test]
    fn timers_fire_in_deadline_then_insertion_order() {
        let base = EventBase::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        let now = time_millis();

        let o = order.clone();
        base.run_at(now + 10, Box::new(move || o.borrow_mut().push("t+10")), 0);
        let o = order.clone();
        base.run_at(now + 5, Box::new(move || o.borrow_mut().push("t+5 first")), 0);
        let o = order.clone();
        base.run_at(now + 5, Box::new(move || o.borrow_mut().push("t+5 second")), 0);

        thread::sleep(Duration::from_millis(15));
        base.loop_once(0).unwrap();

        assert_eq!(&*order.borrow(), &["t+5 first", "t+5 second", "t+10"]);
    }

    #[test]
    fn safe_call_runs_on_reactor_thread() {
        let base = Rc::new(EventBase::new().unwrap());
        let handle = base.handle();
        let counter = Arc::new(TestCounter::new(0));
        let c = counter.clone();
        assert!(handle.safe_call(move || {
            c.fetch_add(1, Ordering::Relaxed);
        }));
        base.loop_once(50).unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn exit_flag_stops_run() {
        let base = EventBase::new().unwrap();
        let handle = base.handle();
        // `Rc<EventBase>` is not `Send` (it holds `RefCell`/`Cell` fields),
        // so the bare `EventBase` has to cross the thread boundary wrapped
        // in `MoveToThread` and only become an `Rc` on the thread that will
        // actually run it - the same trick `MultiBase::run` uses.
        let wrapped = MoveToThread(base);
        let runner = thread::spawn(move || {
            let MoveToThread(base) = wrapped;
            Rc::new(base).run()
        });
        thread::sleep(Duration::from_millis(20));
        handle.exit();
        runner.join().unwrap();
        assert!(handle.exited());
    }
}
