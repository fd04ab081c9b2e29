//! Shared callback executor.
//!
//! Tables dispatch user callbacks (insert acknowledgements, sample batches)
//! through a bounded pool so slow callbacks cannot stall a table worker. A
//! [`SerialQueue`] on top of the pool keeps one table's callbacks in
//! submission order even when the pool runs many threads.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct ExecutorShared {
    state: Mutex<ExecutorState>,
    work: Condvar,
}

struct ExecutorState {
    queue: VecDeque<Task>,
    shutdown: bool,
}

/// Fixed pool of named worker threads draining a FIFO task queue.
///
/// Dropping the executor drains already-queued tasks, then joins every
/// worker. Tasks submitted after shutdown are discarded.
pub struct TaskExecutor {
    shared: Arc<ExecutorShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskExecutor {
    /// Spawn `num_threads` workers (at least one) named `{name}-{index}`.
    pub fn new(num_threads: usize, name: &str) -> Self {
        let shared = Arc::new(ExecutorShared {
            state: Mutex::new(ExecutorState {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            work: Condvar::new(),
        });

        let workers = (0..num_threads.max(1))
            .map(|index| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("{name}-{index}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("executor worker thread to spawn")
            })
            .collect();

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Queue `task` for execution on some pool thread.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.queue.push_back(Box::new(task));
        }
        self.shared.work.notify_one();
    }
}

fn worker_loop(shared: &ExecutorShared) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if let Some(task) = state.queue.pop_front() {
                    break task;
                }
                if state.shutdown {
                    return;
                }
                shared.work.wait(&mut state);
            }
        };
        task();
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.work.notify_all();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

struct SerialInner {
    state: Mutex<SerialState>,
}

struct SerialState {
    queue: VecDeque<Task>,
    running: bool,
}

/// Runs submitted tasks strictly one at a time, in submission order, on the
/// underlying pool. Only one pool thread drains the queue at any moment.
pub struct SerialQueue {
    executor: Arc<TaskExecutor>,
    inner: Arc<SerialInner>,
}

impl SerialQueue {
    #[must_use]
    pub fn new(executor: Arc<TaskExecutor>) -> Self {
        Self {
            executor,
            inner: Arc::new(SerialInner {
                state: Mutex::new(SerialState {
                    queue: VecDeque::new(),
                    running: false,
                }),
            }),
        }
    }

    /// Queue `task` behind everything previously dispatched on this queue.
    pub fn dispatch(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.inner.state.lock();
            state.queue.push_back(Box::new(task));
            if state.running {
                return;
            }
            state.running = true;
        }
        let inner = Arc::clone(&self.inner);
        self.executor.execute(move || drain(&inner));
    }
}

fn drain(inner: &SerialInner) {
    loop {
        let task = {
            let mut state = inner.state.lock();
            match state.queue.pop_front() {
                Some(task) => task,
                None => {
                    state.running = false;
                    return;
                }
            }
        };
        task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn wait_for(predicate: impl Fn() -> bool) {
        for _ in 0..1000 {
            if predicate() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("condition not reached within a second");
    }

    #[test]
    fn runs_submitted_tasks() {
        let executor = TaskExecutor::new(4, "test-exec");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..64 {
            let counter = Arc::clone(&counter);
            executor.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        wait_for(|| counter.load(Ordering::SeqCst) == 64);
    }

    #[test]
    fn drop_drains_queued_tasks() {
        let executor = TaskExecutor::new(2, "drain-exec");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            executor.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(executor);
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn serial_queue_preserves_dispatch_order() {
        let executor = Arc::new(TaskExecutor::new(8, "serial-exec"));
        let queue = SerialQueue::new(Arc::clone(&executor));
        let seen = Arc::new(Mutex::new(Vec::new()));
        for index in 0..256usize {
            let seen = Arc::clone(&seen);
            queue.dispatch(move || {
                seen.lock().push(index);
            });
        }
        wait_for(|| seen.lock().len() == 256);
        let seen = seen.lock();
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
    }
}
