//! Sample stream: task intake, pipelined table sampling and byte-budgeted
//! response batching.
//!
//! One inbound request defines a sample task. The stream keeps at most one
//! sample request outstanding on the table and at most
//! [`MAX_QUEUED_RESPONSES`] responses queued; within those limits it
//! pipelines the next batch while earlier ones are still being written.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tonic::{Status, Streaming};

use replay_core::{SampleCallback, SampledItem, Table, TableError, TableItem};
use replay_proto::{
    SampleEntry, SampleInfo, SampleStreamRequest, SampleStreamResponse, AUTO_SELECT_BATCH_SIZE,
};

use super::{
    table_not_found, table_status, CallbackGuard, StreamHandle, StreamState,
    MAX_QUEUED_RESPONSES, MAX_SAMPLE_RESPONSE_SIZE_BYTES,
};
use crate::grpc::ServiceState;

/// Context of the task currently being served.
pub(crate) struct TaskInfo {
    table: Arc<Table>,
    timeout: Option<Duration>,
    flexible_batch_size: i64,
    requested_samples: i64,
    fetched_samples: i64,
}

impl TaskInfo {
    fn next_sample_size(&self) -> i64 {
        (self.requested_samples - self.fetched_samples).min(self.flexible_batch_size)
    }
}

/// One outbound response plus the items it must keep alive until the message
/// has been handed to the transport.
#[derive(Default)]
pub(crate) struct SampleBatch {
    payload: SampleStreamResponse,
    items: Vec<Arc<TableItem>>,
}

pub(crate) struct SampleExt {
    task: Option<TaskInfo>,
    /// Byte size accumulated into the tail batch so far.
    current_response_size: usize,
    /// At most one sample request is outstanding on the table.
    waiting_for_enqueued_sample: bool,
    /// Handle to this stream's completion callback, needed to enqueue the
    /// next batch. Cleared before the callback guard drains.
    callback: Option<Arc<SampleCallback>>,
}

type Handle = StreamHandle<SampleExt, SampleBatch>;

pub(crate) async fn run(
    service: Arc<ServiceState>,
    mut requests: Streaming<SampleStreamRequest>,
    tx: mpsc::Sender<Result<SampleStreamResponse, Status>>,
) {
    let handle = Arc::new(Handle::new(SampleExt {
        task: None,
        current_response_size: 0,
        waiting_for_enqueued_sample: false,
        callback: None,
    }));
    let guard = CallbackGuard::new(sampling_done_callback(Arc::downgrade(&handle)));
    handle.lock().ext.callback = Some(guard.handle());

    let writer = {
        let handle = Arc::clone(&handle);
        let tx = tx.clone();
        tokio::spawn(async move {
            handle
                .drive_writes(
                    &tx,
                    |batch| (batch.payload, batch.items),
                    // A completed write may unblock the sampling loop.
                    maybe_start_sampling,
                )
                .await;
        })
    };

    while !handle.is_finished() {
        let request = match requests.message().await {
            Ok(Some(request)) => request,
            Ok(None) | Err(_) => break,
        };
        if let Err(status) = process_task_request(&service, &handle, request) {
            handle.finish(Err(status));
            break;
        }
        // Responses for this task drain fully before the next task starts.
        handle.wait_read(|state| state.ext.task.is_none()).await;
    }

    handle.finish(Ok(()));
    let _ = writer.await;
    handle.lock().ext.callback = None;
    guard.drain().await;
}

fn process_task_request(
    service: &ServiceState,
    handle: &Handle,
    request: SampleStreamRequest,
) -> Result<(), Status> {
    if request.num_samples <= 0 {
        return Err(Status::invalid_argument(format!(
            "num_samples must be > 0 (got {})",
            request.num_samples
        )));
    }
    if request.flexible_batch_size <= 0 && request.flexible_batch_size != AUTO_SELECT_BATCH_SIZE {
        return Err(Status::invalid_argument(format!(
            "flexible_batch_size must be > 0 or {AUTO_SELECT_BATCH_SIZE} for auto selection (got {})",
            request.flexible_batch_size
        )));
    }
    let timeout = request
        .rate_limiter_timeout
        .as_ref()
        .filter(|timeout| timeout.milliseconds > 0)
        .map(|timeout| Duration::from_millis(timeout.milliseconds as u64));
    let table = service
        .table_by_name(&request.table)
        .ok_or_else(|| table_not_found(&request.table))?;
    let flexible_batch_size = if request.flexible_batch_size == AUTO_SELECT_BATCH_SIZE {
        i64::from(table.default_flexible_batch_size())
    } else {
        i64::from(request.flexible_batch_size)
    };

    let mut state = handle.lock();
    state.ext.task = Some(TaskInfo {
        table,
        timeout,
        flexible_batch_size,
        requested_samples: request.num_samples,
        fetched_samples: 0,
    });
    maybe_start_sampling(&mut state);
    Ok(())
}

/// Invariant-driven sampling loop entry: enqueue the next batch unless the
/// task is done, a request is already outstanding, or the response queue is
/// at its cap.
fn maybe_start_sampling(state: &mut StreamState<SampleExt, SampleBatch>) {
    if state.finished.is_some() {
        return;
    }
    let (table, timeout, next_batch_size) = match state.ext.task.as_ref() {
        Some(task) => (
            Arc::clone(&task.table),
            task.timeout,
            task.next_sample_size(),
        ),
        None => return,
    };
    if next_batch_size <= 0 {
        return;
    }
    if state.ext.waiting_for_enqueued_sample {
        return;
    }
    if state.responses.len() + usize::from(state.write_in_flight) >= MAX_QUEUED_RESPONSES {
        return;
    }
    let Some(callback) = state.ext.callback.clone() else {
        return;
    };
    state.ext.waiting_for_enqueued_sample = true;
    table.enqueue_sample_request(next_batch_size as usize, callback, timeout);
}

/// Invoked by a table worker with the outcome of one queued batch.
fn sampling_done_callback(handle: Weak<Handle>) -> Arc<SampleCallback> {
    Arc::new(
        move |result: Result<Vec<SampledItem>, TableError>| {
            let Some(handle) = handle.upgrade() else {
                return;
            };
            let mut task_done = false;
            match result {
                Err(error) => {
                    handle.lock().ext.waiting_for_enqueued_sample = false;
                    handle.finish(Err(table_status(&error)));
                    return;
                }
                Ok(samples) => {
                    let mut state = handle.lock();
                    state.ext.waiting_for_enqueued_sample = false;
                    if state.finished.is_some() {
                        return;
                    }
                    if let Some(task) = state.ext.task.as_mut() {
                        task.fetched_samples += samples.len() as i64;
                    }
                    for sample in &samples {
                        process_sample(&mut state, sample);
                    }
                    let next_batch_size =
                        state.ext.task.as_ref().map_or(0, TaskInfo::next_sample_size);
                    if next_batch_size > 0 {
                        // Pipeline the next batch while this one is written.
                        maybe_start_sampling(&mut state);
                    } else {
                        state.ext.task = None;
                        task_done = true;
                    }
                }
            }
            handle.wake_writer();
            if task_done {
                // The task is finalized; the read loop may accept another.
                handle.wake_reader();
            }
        },
    )
}

/// Append one sampled item to the outbound queue, splitting across batches
/// whenever the byte budget is exceeded mid-item.
fn process_sample(state: &mut StreamState<SampleExt, SampleBatch>, sample: &SampledItem) {
    if state.responses.is_empty()
        || state.ext.current_response_size > MAX_SAMPLE_RESPONSE_SIZE_BYTES
    {
        state.responses.push_back(SampleBatch::default());
        state.ext.current_response_size = 0;
    }

    let chunk_count = sample.item.chunks.len();
    state
        .responses
        .back_mut()
        .expect("a tail batch was just ensured")
        .payload
        .entries
        .push(SampleEntry {
            info: Some(sample_info(sample)),
            data: Vec::new(),
            end_of_sequence: chunk_count == 0,
        });

    for (index, chunk) in sample.item.chunks.iter().enumerate() {
        let last = index + 1 == chunk_count;
        {
            let batch = state.responses.back_mut().expect("tail batch exists");
            let entry = batch
                .payload
                .entries
                .last_mut()
                .expect("tail entry exists");
            entry.end_of_sequence = last;
            entry.data.push(chunk.data().clone());
        }
        state.ext.current_response_size += chunk.byte_size();
        if !last && state.ext.current_response_size > MAX_SAMPLE_RESPONSE_SIZE_BYTES {
            // The item continues in a fresh batch.
            state.responses.push_back(SampleBatch::default());
            state.ext.current_response_size = 0;
            state
                .responses
                .back_mut()
                .expect("a tail batch was just pushed")
                .payload
                .entries
                .push(SampleEntry::default());
        }
    }

    // Only the batch finishing the item keeps it alive, so the item is
    // released exactly when its last bytes have been handed to the wire.
    state
        .responses
        .back_mut()
        .expect("tail batch exists")
        .items
        .push(Arc::clone(&sample.item));
}

fn sample_info(sample: &SampledItem) -> SampleInfo {
    let mut item = sample.item.item.clone();
    item.priority = sample.priority;
    item.times_sampled = sample.times_sampled;
    SampleInfo {
        item: Some(item),
        probability: sample.probability,
        table_size: sample.table_size,
        rate_limited: sample.rate_limited,
    }
}
