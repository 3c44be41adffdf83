//! Fixed set of worker threads pulling tasks off one shared FIFO.
//!
//! The dispatch thread is the usual producer; nothing stops other threads from
//! enqueuing as well. Tasks run with the queue lock released.

use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

const FALLBACK_WORKERS: usize = 8;
const MIN_WORKERS: usize = 2;

/// Worker count used when none is configured.
pub fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(FALLBACK_WORKERS)
        .max(MIN_WORKERS)
}

struct Queue {
    tasks: VecDeque<Task>,
    stopping: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    ready: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one). Fails only if the OS refuses a thread.
    pub fn new(size: usize) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                stopping: false,
            }),
            ready: Condvar::new(),
        });

        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || run_worker(&shared))?;
            workers.push(handle);
        }
        debug!(workers = size, "worker pool started");
        Ok(Self { shared, workers })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn pending(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    /// Queue a task. Never blocks on the work itself; returns false and drops the task
    /// once the pool is stopping.
    pub fn execute<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.shared.lock();
        if queue.stopping {
            return false;
        }
        queue.tasks.push_back(Box::new(task));
        drop(queue);
        self.shared.ready.notify_one();
        true
    }

    /// Stop accepting work, let the workers drain what is queued, and join them.
    pub fn shutdown(&mut self) {
        self.shared.lock().stopping = true;
        self.shared.ready.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("worker thread exited abnormally");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: &Shared) {
    loop {
        let task = {
            let mut queue = shared.lock();
            loop {
                if let Some(task) = queue.tasks.pop_front() {
                    break task;
                }
                if queue.stopping {
                    return;
                }
                queue = shared
                    .ready
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            let msg = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("<non-string panic>");
            let current = thread::current();
            error!(thread = current.name(), "task panicked: {msg}");
        }
    }
}
