//! Bounded thread-safe FIFO, grounded on `handy::threads.h`'s `SafeQueue`.
//!
//! The C++ original privately inherits `std::mutex` and pairs it with a
//! `std::condition_variable` and an `atomic<bool>` exit flag; here that's a
//! `Mutex<VecDeque<T>>` plus a `Condvar` and an `AtomicBool`, since Rust has
//! no equivalent to private inheritance from a lock type and there's no
//! reason to reach for one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub struct SafeQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Condvar,
    capacity: usize,
    exit: AtomicBool,
}

impl<T> SafeQueue<T> {
    /// `capacity == 0` means unbounded, matching the original's convention.
    pub fn new(capacity: usize) -> SafeQueue<T> {
        SafeQueue {
            items: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            capacity,
            exit: AtomicBool::new(false),
        }
    }

    /// Pushes `item` unless the queue has exited or is at capacity. Returns
    /// whether the push succeeded.
    pub fn push(&self, item: T) -> bool {
        let mut items = self.items.lock().unwrap();
        if self.exit.load(Ordering::Acquire) || (self.capacity != 0 && items.len() >= self.capacity) {
            return false;
        }
        items.push_back(item);
        self.ready.notify_one();
        true
    }

    /// Pops the head item, waiting up to `timeout` (`None` = wait forever)
    /// for one to appear. Returns `None` if the queue exited while waiting
    /// or the timeout elapsed with nothing available.
    pub fn pop_wait(&self, timeout: Option<Duration>) -> Option<T> {
        let mut items = self.items.lock().unwrap();
        match timeout {
            None => {
                while items.is_empty() && !self.exit.load(Ordering::Acquire) {
                    items = self.ready.wait(items).unwrap();
                }
                items.pop_front()
            }
            Some(Duration::ZERO) => items.pop_front(),
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    if let Some(item) = items.pop_front() {
                        return Some(item);
                    }
                    if self.exit.load(Ordering::Acquire) {
                        return None;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, result) = self.ready.wait_timeout(items, deadline - now).unwrap();
                    items = guard;
                    if result.timed_out() && items.is_empty() {
                        return None;
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks the queue as exited and wakes every waiter; already-queued
    /// items remain poppable until drained (`pop_wait` only returns `None`
    /// on exit once the queue is empty).
    pub fn exit(&self) {
        self.exit.store(true, Ordering::Release);
        self.ready.notify_all();
    }

    pub fn exited(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_pop_fifo_order() {
        let q = SafeQueue::new(0);
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop_wait(Some(Duration::ZERO)), Some(1));
        assert_eq!(q.pop_wait(Some(Duration::ZERO)), Some(2));
        assert_eq!(q.pop_wait(Some(Duration::ZERO)), Some(3));
    }

    #[test]
    fn bounded_push_rejected_when_full() {
        let q: SafeQueue<i32> = SafeQueue::new(1);
        assert!(q.push(1));
        assert!(!q.push(2));
    }

    #[test]
    fn exit_wakes_blocked_waiter() {
        let q: Arc<SafeQueue<i32>> = Arc::new(SafeQueue::new(0));
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.pop_wait(None));
        thread::sleep(Duration::from_millis(20));
        q.exit();
        assert_eq!(handle.join().unwrap(), None);
    }
}
