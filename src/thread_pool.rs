//! Fixed-size worker pool draining a `SafeQueue<Task>`, grounded on
//! `handy::threads.h`'s `ThreadPool`. No dynamic resizing - workers are
//! spawned once at construction and run until `exit()` drains the queue.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::safe_queue::SafeQueue;

type Task = Box<dyn FnOnce() + Send>;

pub struct ThreadPool {
    tasks: Arc<SafeQueue<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(threads: usize) -> ThreadPool {
        let tasks = Arc::new(SafeQueue::new(0));
        let workers = (0..threads)
            .map(|i| {
                let tasks = tasks.clone();
                thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || {
                        while let Some(task) = tasks.pop_wait(None) {
                            task();
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        ThreadPool { tasks, workers }
    }

    /// Queues `task` for execution on some worker. Returns `false` if the
    /// pool has already been told to exit.
    pub fn add_task<F: FnOnce() + Send + 'static>(&self, task: F) -> bool {
        self.tasks.push(Box::new(task))
    }

    pub fn task_size(&self) -> usize {
        self.tasks.len()
    }

    /// Signals workers to stop once the queue drains; does not block.
    pub fn exit(&self) {
        self.tasks.exit();
    }

    /// Joins every worker thread. Call `exit()` first or this blocks
    /// forever waiting on idle workers.
    pub fn join(&mut self) {
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.exit();
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_queued_tasks() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            pool.add_task(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }
}
