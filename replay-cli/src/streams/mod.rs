//! Shared plumbing for the bidirectional stream handlers.
//!
//! Every stream runs two tasks: a read loop owning the inbound
//! `tonic::Streaming` and a writer pump draining an ordered response queue.
//! One mutex guards the queue, the terminal status and the handler-specific
//! extension state; reads and writes are each serialized by construction.

pub mod connection;
pub mod insert;
pub mod sample;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tonic::Status;

use replay_core::TableError;

/// Response-batch byte budget for one sample-stream message. A batch may
/// overshoot by at most the final chunk appended to it.
pub(crate) const MAX_SAMPLE_RESPONSE_SIZE_BYTES: usize = 1024 * 1024;

/// Cap on queued-but-unwritten sample responses per stream; sampling stalls
/// at the cap until a write completes.
pub(crate) const MAX_QUEUED_RESPONSES: usize = 3;

/// Cap on keys coalesced into a single insert acknowledgement message.
pub(crate) const MAX_KEYS_PER_RESPONSE: usize = 1024;

/// Poll interval while waiting for table-held callback clones to drop.
pub(crate) const CALLBACK_WAIT: Duration = Duration::from_millis(1);

pub(crate) fn table_not_found(name: &str) -> Status {
    Status::not_found(format!("priority table '{name}' was not found"))
}

pub(crate) fn table_status(error: &TableError) -> Status {
    match error {
        TableError::Closed { .. } => Status::cancelled(error.to_string()),
        TableError::RateLimiterTimeout { .. } => Status::deadline_exceeded(error.to_string()),
    }
}

/// State shared between a stream's read loop, its writer pump and the
/// callbacks the handler installs on a table.
pub(crate) struct StreamState<E, B> {
    /// Ordered outbound batches. The batch currently being written has been
    /// popped, so the back of the queue is always safe to mutate.
    pub responses: VecDeque<B>,
    pub write_in_flight: bool,
    /// Terminal status. `Some(Ok(()))` lets the writer drain the queue before
    /// closing; an error discards queued batches.
    pub finished: Option<Result<(), Status>>,
    pub ext: E,
}

pub(crate) struct StreamHandle<E, B> {
    state: Mutex<StreamState<E, B>>,
    writer_wake: Notify,
    read_wake: Notify,
}

enum Step<B> {
    Send(B),
    Fail(Status),
    End,
    Wait,
}

impl<E, B> StreamHandle<E, B> {
    pub fn new(ext: E) -> Self {
        Self {
            state: Mutex::new(StreamState {
                responses: VecDeque::new(),
                write_in_flight: false,
                finished: None,
                ext,
            }),
            writer_wake: Notify::new(),
            read_wake: Notify::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, StreamState<E, B>> {
        self.state.lock()
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished.is_some()
    }

    /// Idempotent terminal transition; wakes both the writer and the reader.
    pub fn finish(&self, result: Result<(), Status>) {
        {
            let mut state = self.state.lock();
            if state.finished.is_some() {
                return;
            }
            if result.is_err() {
                state.responses.clear();
            }
            state.finished = Some(result);
        }
        self.writer_wake.notify_one();
        self.read_wake.notify_one();
    }

    pub fn wake_writer(&self) {
        self.writer_wake.notify_one();
    }

    pub fn wake_reader(&self) {
        self.read_wake.notify_one();
    }

    /// Park the read loop until `ready` reports the gate open or the stream
    /// reaches a terminal state.
    pub async fn wait_read(&self, mut ready: impl FnMut(&mut StreamState<E, B>) -> bool) {
        loop {
            {
                let mut state = self.state.lock();
                if state.finished.is_some() || ready(&mut state) {
                    return;
                }
            }
            self.read_wake.notified().await;
        }
    }

    /// Writer pump: sends queued batches strictly one at a time.
    ///
    /// `into_message` splits a batch into the wire message and whatever the
    /// batch must keep alive until the send completes; `after_write` runs
    /// under the lock after every completed send.
    pub async fn drive_writes<M, G>(
        &self,
        tx: &mpsc::Sender<Result<M, Status>>,
        mut into_message: impl FnMut(B) -> (M, G),
        mut after_write: impl FnMut(&mut StreamState<E, B>),
    ) {
        loop {
            let step = {
                let mut state = self.state.lock();
                if let Some(batch) = state.responses.pop_front() {
                    state.write_in_flight = true;
                    Step::Send(batch)
                } else {
                    match &state.finished {
                        Some(Ok(())) => Step::End,
                        Some(Err(status)) => Step::Fail(status.clone()),
                        None => Step::Wait,
                    }
                }
            };
            match step {
                Step::Send(batch) => {
                    let (message, keep_alive) = into_message(batch);
                    let delivered = tx.send(Ok(message)).await.is_ok();
                    drop(keep_alive);
                    {
                        let mut state = self.state.lock();
                        state.write_in_flight = false;
                        if delivered {
                            after_write(&mut state);
                        }
                    }
                    if !delivered {
                        // The client went away; nothing further can be sent.
                        self.finish(Ok(()));
                    }
                }
                Step::Fail(status) => {
                    let _ = tx.send(Err(status)).await;
                    return;
                }
                Step::End => return,
                Step::Wait => self.writer_wake.notified().await,
            }
        }
    }
}

/// Keeps a stream's table callback alive and, at teardown, waits until every
/// table-held clone has dropped, so no callback can run against a stream that
/// is gone.
pub(crate) struct CallbackGuard<C: ?Sized> {
    callback: Arc<C>,
}

impl<C: ?Sized> CallbackGuard<C> {
    pub fn new(callback: Arc<C>) -> Self {
        Self { callback }
    }

    pub fn handle(&self) -> Arc<C> {
        Arc::clone(&self.callback)
    }

    /// Drop the guard's strong reference and poll until the callback is gone
    /// everywhere. Tables always drain their queues, so this terminates.
    pub async fn drain(self) {
        let weak = Arc::downgrade(&self.callback);
        drop(self.callback);
        while weak.strong_count() > 0 {
            tokio::time::sleep(CALLBACK_WAIT).await;
        }
    }
}
