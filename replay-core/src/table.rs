//! Priority tables: item storage, weighted sampling and saturation signalling.
//!
//! Each table runs one worker thread. Inserts are queued and committed in
//! FIFO order; sample requests wait behind the rate-limiter gate (a minimum
//! resident size) and may expire on a deadline. Completion callbacks are
//! dispatched through the shared [`TaskExecutor`](crate::TaskExecutor) via a
//! per-table serial queue, so callers observe commits in commit order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use tracing::debug;

use replay_proto::{datetime_to_timestamp, PrioritizedItem, TableInfo};

use crate::chunk_store::Chunk;
use crate::error::TableError;
use crate::executor::{SerialQueue, TaskExecutor};

/// Callback invoked once per committed item key.
pub type InsertCallback = dyn Fn(u64) + Send + Sync;

/// Callback invoked with the outcome of one queued sample request.
pub type SampleCallback = dyn Fn(Result<Vec<SampledItem>, TableError>) + Send + Sync;

/// An item owned by a table, holding a strong reference to every chunk its
/// trajectory spans. The chunks stay alive at least as long as the item does.
#[derive(Debug)]
pub struct TableItem {
    pub item: PrioritizedItem,
    pub chunks: Vec<Arc<Chunk>>,
}

/// One sampled item plus the sampling metadata captured at draw time.
#[derive(Clone, Debug)]
pub struct SampledItem {
    pub item: Arc<TableItem>,
    pub priority: f64,
    pub times_sampled: i32,
    pub probability: f64,
    pub table_size: i64,
    pub rate_limited: bool,
}

/// Tuning knobs for a table.
#[derive(Debug, Clone)]
pub struct TableOptions {
    /// Resident item cap; the oldest items are evicted beyond it.
    pub max_size: usize,
    /// Remove an item after it has been sampled this many times (0 = never).
    pub max_times_sampled: i32,
    /// Sample requests wait until the table holds at least this many items.
    pub min_size_to_sample: usize,
    /// Batch size used when a sampler asks for auto selection.
    pub default_flexible_batch_size: i32,
    /// Pending-insert queue length at which `insert_or_assign_async` starts
    /// reporting `can_insert = false`.
    pub max_enqueued_inserts: usize,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            max_size: 100_000,
            max_times_sampled: 0,
            min_size_to_sample: 1,
            default_flexible_batch_size: 64,
            max_enqueued_inserts: 1_000,
        }
    }
}

struct Slot {
    item: Arc<TableItem>,
    priority: f64,
    times_sampled: i32,
}

struct PendingInsert {
    item: TableItem,
    callback: Arc<InsertCallback>,
}

struct PendingSample {
    batch_size: usize,
    callback: Arc<SampleCallback>,
    deadline: Option<Instant>,
    queued_at: Instant,
    was_rate_limited: bool,
}

struct TableState {
    slots: HashMap<u64, Slot>,
    insert_order: VecDeque<u64>,
    pending_inserts: VecDeque<PendingInsert>,
    pending_samples: VecDeque<PendingSample>,
    num_inserted: i64,
    num_sampled: i64,
    closed: bool,
}

struct Shared {
    name: String,
    options: TableOptions,
    state: Mutex<TableState>,
    work: Condvar,
    callbacks: Mutex<Option<SerialQueue>>,
}

impl Shared {
    /// Run `task` on the installed serial queue, or inline when no executor
    /// has been installed (only the case in unit tests).
    fn dispatch(&self, task: impl FnOnce() + Send + 'static) {
        let callbacks = self.callbacks.lock();
        match callbacks.as_ref() {
            Some(queue) => queue.dispatch(task),
            None => {
                drop(callbacks);
                task();
            }
        }
    }
}

/// A named, priority-weighted sample table with one worker thread.
pub struct Table {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Table {
    pub fn new(name: impl Into<String>, options: TableOptions) -> Arc<Self> {
        let name = name.into();
        let shared = Arc::new(Shared {
            name: name.clone(),
            options,
            state: Mutex::new(TableState {
                slots: HashMap::new(),
                insert_order: VecDeque::new(),
                pending_inserts: VecDeque::new(),
                pending_samples: VecDeque::new(),
                num_inserted: 0,
                num_sampled: 0,
                closed: false,
            }),
            work: Condvar::new(),
            callbacks: Mutex::new(None),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("table-{name}"))
            .spawn(move || worker_loop(&worker_shared))
            .expect("table worker thread to spawn");

        Arc::new(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Install the shared executor all completion callbacks run on.
    pub fn set_callback_executor(&self, executor: Arc<TaskExecutor>) {
        *self.shared.callbacks.lock() = Some(SerialQueue::new(executor));
    }

    #[must_use]
    pub fn default_flexible_batch_size(&self) -> i32 {
        self.shared.options.default_flexible_batch_size
    }

    /// Queue `item` for commit. `callback` fires with the item key once the
    /// commit lands. Returns `can_insert = false` when the pending queue is
    /// saturated; the caller must stop feeding until a callback runs.
    pub fn insert_or_assign_async(
        &self,
        item: TableItem,
        callback: Arc<InsertCallback>,
    ) -> Result<bool, TableError> {
        let can_insert = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(TableError::Closed {
                    name: self.shared.name.clone(),
                });
            }
            state.pending_inserts.push_back(PendingInsert { item, callback });
            state.pending_inserts.len() < self.shared.options.max_enqueued_inserts
        };
        self.shared.work.notify_one();
        Ok(can_insert)
    }

    /// Queue a request for a batch of `batch_size` samples. The callback is
    /// always invoked exactly once, asynchronously, with the batch or an
    /// error (rate-limiter expiry, table closed).
    pub fn enqueue_sample_request(
        &self,
        batch_size: usize,
        callback: Arc<SampleCallback>,
        timeout: Option<Duration>,
    ) {
        let closed = {
            let mut state = self.shared.state.lock();
            if !state.closed {
                let now = Instant::now();
                state.pending_samples.push_back(PendingSample {
                    batch_size,
                    callback: Arc::clone(&callback),
                    deadline: timeout.map(|timeout| now + timeout),
                    queued_at: now,
                    was_rate_limited: false,
                });
            }
            state.closed
        };
        if closed {
            let name = self.shared.name.clone();
            self.shared
                .dispatch(move || callback(Err(TableError::Closed { name })));
        } else {
            self.shared.work.notify_one();
        }
    }

    /// Apply priority updates and deletions. Unknown keys are ignored.
    pub fn mutate_items(
        &self,
        updates: &[(u64, f64)],
        delete_keys: &[u64],
    ) -> Result<(), TableError> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(TableError::Closed {
                name: self.shared.name.clone(),
            });
        }
        for (key, priority) in updates {
            if let Some(slot) = state.slots.get_mut(key) {
                slot.priority = *priority;
            }
        }
        for key in delete_keys {
            remove_slot(&mut state, *key);
        }
        drop(state);
        // Deletions may free capacity; re-check waiting samplers.
        self.shared.work.notify_one();
        Ok(())
    }

    /// Drop every resident item and zero the counters.
    pub fn reset(&self) -> Result<(), TableError> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(TableError::Closed {
                name: self.shared.name.clone(),
            });
        }
        state.slots.clear();
        state.insert_order.clear();
        state.num_inserted = 0;
        state.num_sampled = 0;
        Ok(())
    }

    #[must_use]
    pub fn info(&self) -> TableInfo {
        let state = self.shared.state.lock();
        TableInfo {
            name: self.shared.name.clone(),
            current_size: state.slots.len() as i64,
            max_size: self.shared.options.max_size as i64,
            num_inserted: state.num_inserted,
            num_sampled: state.num_sampled,
        }
    }

    #[must_use]
    pub fn current_size(&self) -> usize {
        self.shared.state.lock().slots.len()
    }

    /// Snapshot every resident item with its live priority and sample count,
    /// oldest first. Used by the checkpointer.
    #[must_use]
    pub fn checkpoint(&self) -> Vec<(PrioritizedItem, Vec<Arc<Chunk>>)> {
        let state = self.shared.state.lock();
        state
            .insert_order
            .iter()
            .filter_map(|key| state.slots.get(key))
            .map(|slot| {
                let mut item = slot.item.item.clone();
                item.priority = slot.priority;
                item.times_sampled = slot.times_sampled;
                (item, slot.item.chunks.clone())
            })
            .collect()
    }

    /// Restore a checkpointed item directly, bypassing the async insert
    /// queue. Keeps the item's recorded priority, sample count and insertion
    /// time.
    pub fn restore_item(
        &self,
        item: PrioritizedItem,
        chunks: Vec<Arc<Chunk>>,
    ) -> Result<(), TableError> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(TableError::Closed {
                name: self.shared.name.clone(),
            });
        }
        let key = item.key;
        let priority = item.priority;
        let times_sampled = item.times_sampled;
        let slot = Slot {
            item: Arc::new(TableItem { item, chunks }),
            priority,
            times_sampled,
        };
        if state.slots.insert(key, slot).is_none() {
            state.insert_order.push_back(key);
        }
        state.num_inserted += 1;
        evict_over_capacity(&self.shared.options, &mut state);
        Ok(())
    }

    /// Shut the table down: fail queued sample requests, drop queued inserts
    /// and join the worker. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.shared.work.notify_all();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
        debug!(table = %self.shared.name, "table closed");
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        // Commit queued inserts in FIFO order before anything else.
        if !state.pending_inserts.is_empty() {
            let mut acks = Vec::with_capacity(state.pending_inserts.len());
            while let Some(pending) = state.pending_inserts.pop_front() {
                let key = commit_item(&shared.options, &mut state, pending.item);
                acks.push((pending.callback, key));
            }
            drop(state);
            for (callback, key) in acks {
                shared.dispatch(move || callback(key));
            }
            state = shared.state.lock();
            continue;
        }

        if state.closed {
            let pending = std::mem::take(&mut state.pending_samples);
            drop(state);
            for request in pending {
                let error = TableError::Closed {
                    name: shared.name.clone(),
                };
                let callback = request.callback;
                shared.dispatch(move || callback(Err(error)));
            }
            return;
        }

        if state.pending_samples.is_empty() {
            shared.work.wait(&mut state);
            continue;
        }

        if can_sample(&shared.options, &state) {
            let request = state
                .pending_samples
                .pop_front()
                .expect("pending sample queue is non-empty");
            let samples = draw_batch(
                &shared.options,
                &mut state,
                request.batch_size,
                request.was_rate_limited,
            );
            drop(state);
            let callback = request.callback;
            shared.dispatch(move || callback(Ok(samples)));
            state = shared.state.lock();
            continue;
        }

        // Rate limited: expire the head request or wait for capacity.
        let deadline = {
            let front = state
                .pending_samples
                .front_mut()
                .expect("pending sample queue is non-empty");
            front.was_rate_limited = true;
            front.deadline
        };
        match deadline {
            Some(deadline) if Instant::now() >= deadline => {
                let request = state
                    .pending_samples
                    .pop_front()
                    .expect("pending sample queue is non-empty");
                let error = TableError::RateLimiterTimeout {
                    name: shared.name.clone(),
                    timeout: deadline.saturating_duration_since(request.queued_at),
                };
                drop(state);
                let callback = request.callback;
                shared.dispatch(move || callback(Err(error)));
                state = shared.state.lock();
            }
            Some(deadline) => {
                shared.work.wait_until(&mut state, deadline);
            }
            None => {
                shared.work.wait(&mut state);
            }
        }
    }
}

fn can_sample(options: &TableOptions, state: &TableState) -> bool {
    !state.slots.is_empty() && state.slots.len() >= options.min_size_to_sample
}

fn commit_item(options: &TableOptions, state: &mut TableState, mut item: TableItem) -> u64 {
    let key = item.item.key;
    item.item.inserted_at = Some(datetime_to_timestamp(Utc::now()));
    let priority = item.item.priority;
    let slot = Slot {
        item: Arc::new(item),
        priority,
        times_sampled: 0,
    };
    if state.slots.insert(key, slot).is_none() {
        state.insert_order.push_back(key);
    }
    state.num_inserted += 1;
    evict_over_capacity(options, state);
    key
}

fn evict_over_capacity(options: &TableOptions, state: &mut TableState) {
    while state.slots.len() > options.max_size {
        let Some(oldest) = state.insert_order.pop_front() else {
            break;
        };
        state.slots.remove(&oldest);
    }
}

fn remove_slot(state: &mut TableState, key: u64) {
    if state.slots.remove(&key).is_some() {
        if let Some(position) = state.insert_order.iter().position(|k| *k == key) {
            state.insert_order.remove(position);
        }
    }
}

fn draw_batch(
    options: &TableOptions,
    state: &mut TableState,
    batch_size: usize,
    rate_limited: bool,
) -> Vec<SampledItem> {
    let mut rng = rand::thread_rng();
    let mut samples = Vec::with_capacity(batch_size);
    for _ in 0..batch_size {
        if state.slots.is_empty() {
            break;
        }
        let total: f64 = state.slots.values().map(|slot| slot.priority).sum();
        let key = if total <= 0.0 {
            // All-zero priorities degrade to a uniform draw.
            let index = rng.gen_range(0..state.slots.len());
            *state
                .slots
                .keys()
                .nth(index)
                .expect("index is within bounds")
        } else {
            let mut target = rng.gen::<f64>() * total;
            let mut chosen = None;
            for (key, slot) in &state.slots {
                target -= slot.priority;
                if target <= 0.0 {
                    chosen = Some(*key);
                    break;
                }
            }
            chosen.unwrap_or_else(|| {
                *state
                    .slots
                    .keys()
                    .last()
                    .expect("slots are non-empty")
            })
        };

        let table_size = state.slots.len() as i64;
        let slot = state.slots.get_mut(&key).expect("sampled key is resident");
        slot.times_sampled += 1;
        let probability = if total > 0.0 {
            slot.priority / total
        } else {
            1.0 / table_size as f64
        };
        samples.push(SampledItem {
            item: Arc::clone(&slot.item),
            priority: slot.priority,
            times_sampled: slot.times_sampled,
            probability,
            table_size,
            rate_limited,
        });
        state.num_sampled += 1;

        if options.max_times_sampled > 0 && slot.times_sampled >= options.max_times_sampled {
            remove_slot(state, key);
        }
    }
    samples
}
