//! Insert stream: chunk ingestion, table hand-off and acknowledgement
//! batching.
//!
//! The read loop owns the per-stream chunk cache and handles one request at a
//! time. Acks are appended by the table's completion callback in commit order
//! and coalesced into batches; when a table reports saturation the read loop
//! parks until a callback releases it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tonic::{Status, Streaming};

use replay_core::{Chunk, ChunkKey, InsertCallback, TableItem};
use replay_proto::{InsertStreamRequest, InsertStreamResponse};

use super::{table_not_found, table_status, CallbackGuard, StreamHandle, MAX_KEYS_PER_RESPONSE};
use crate::grpc::ServiceState;

pub(crate) struct InsertExt {
    /// Set by the completion callback; consumed by a read loop parked on a
    /// saturated table.
    read_credit: bool,
}

type Handle = StreamHandle<InsertExt, InsertStreamResponse>;

pub(crate) async fn run(
    service: Arc<ServiceState>,
    mut requests: Streaming<InsertStreamRequest>,
    tx: mpsc::Sender<Result<InsertStreamResponse, Status>>,
) {
    let handle = Arc::new(Handle::new(InsertExt { read_credit: false }));
    let guard = CallbackGuard::new(insert_completed_callback(Arc::downgrade(&handle)));

    let writer = {
        let handle = Arc::clone(&handle);
        let tx = tx.clone();
        tokio::spawn(async move {
            handle.drive_writes(&tx, |batch| (batch, ()), |_| {}).await;
        })
    };

    // Chunks that may be referenced by items not yet received. The chunk
    // store only keeps weak entries, so until an item referencing a chunk is
    // created these handles are what keeps the chunk alive.
    let mut chunks: HashMap<ChunkKey, Arc<Chunk>> = HashMap::new();

    while !handle.is_finished() {
        let request = match requests.message().await {
            Ok(Some(request)) => request,
            Ok(None) | Err(_) => break,
        };
        match process_request(&service, &guard, &mut chunks, request) {
            Ok(true) => {}
            Ok(false) => {
                // Saturated: resume reading once an insert completes.
                handle
                    .wait_read(|state| {
                        if state.ext.read_credit {
                            state.ext.read_credit = false;
                            true
                        } else {
                            false
                        }
                    })
                    .await;
            }
            Err(status) => {
                handle.finish(Err(status));
                break;
            }
        }
    }

    handle.finish(Ok(()));
    let _ = writer.await;
    guard.drain().await;
}

/// Handle one request. Returns the table's `can_insert` verdict; any error
/// terminates the stream.
fn process_request(
    service: &ServiceState,
    guard: &CallbackGuard<InsertCallback>,
    chunks: &mut HashMap<ChunkKey, Arc<Chunk>>,
    request: InsertStreamRequest,
) -> Result<bool, Status> {
    if request.chunks.is_empty() && request.items.is_empty() {
        return Err(Status::invalid_argument(
            "insert request carries neither chunks nor items",
        ));
    }

    for chunk in request.chunks {
        let key = chunk.chunk_key;
        chunks
            .entry(key)
            .or_insert_with(|| service.chunk_store().insert(chunk));
    }

    if request.items.is_empty() {
        return Ok(true);
    }

    let mut can_insert = true;
    for item in request.items {
        let mut item_chunks = Vec::with_capacity(item.chunk_keys().len());
        for key in item.chunk_keys() {
            let chunk = chunks.get(key).ok_or_else(|| {
                Status::internal(format!(
                    "item {} references chunk {key} this stream never sent",
                    item.key
                ))
            })?;
            item_chunks.push(Arc::clone(chunk));
        }
        let table = service
            .table_by_name(&item.table)
            .ok_or_else(|| table_not_found(&item.table))?;
        let accepted = table
            .insert_or_assign_async(
                TableItem {
                    item,
                    chunks: item_chunks,
                },
                guard.handle(),
            )
            .map_err(|error| table_status(&error))?;
        can_insert &= accepted;
    }

    release_out_of_range_chunks(chunks, &request.keep_chunk_keys)?;
    Ok(can_insert)
}

/// Drop every cached chunk the client no longer claims. A keep-set that does
/// not match what the server holds means the stream has desynced.
fn release_out_of_range_chunks(
    chunks: &mut HashMap<ChunkKey, Arc<Chunk>>,
    keep_chunk_keys: &[u64],
) -> Result<(), Status> {
    let keep: HashSet<u64> = keep_chunk_keys.iter().copied().collect();
    chunks.retain(|key, _| keep.contains(key));
    if chunks.len() != keep.len() {
        return Err(Status::failed_precondition(format!(
            "kept {} chunks but the request listed {} keep keys; the stream's chunk cache is out of sync",
            chunks.len(),
            keep.len()
        )));
    }
    Ok(())
}

/// Invoked by a table worker once per committed item key.
fn insert_completed_callback(handle: Weak<Handle>) -> Arc<InsertCallback> {
    Arc::new(move |key: u64| {
        let Some(handle) = handle.upgrade() else {
            return;
        };
        {
            let mut state = handle.lock();
            // A read stalled on table saturation may resume.
            state.ext.read_credit = true;
            if state.finished.is_none() {
                let tail_full = state
                    .responses
                    .back()
                    .is_none_or(|batch| batch.keys.len() >= MAX_KEYS_PER_RESPONSE);
                if tail_full {
                    state.responses.push_back(InsertStreamResponse::default());
                }
                state
                    .responses
                    .back_mut()
                    .expect("a tail batch was just ensured")
                    .keys
                    .push(key);
            }
        }
        handle.wake_writer();
        handle.wake_reader();
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with_keys(keys: &[u64]) -> HashMap<ChunkKey, Arc<Chunk>> {
        let store = replay_core::ChunkStore::new();
        keys.iter()
            .map(|key| {
                (
                    *key,
                    store.insert(replay_proto::ChunkData::new(*key, vec![0u8; 4])),
                )
            })
            .collect()
    }

    #[test]
    fn pruning_keeps_exactly_the_requested_keys() {
        let mut chunks = cache_with_keys(&[1, 2, 3]);
        release_out_of_range_chunks(&mut chunks, &[1, 3]).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.contains_key(&1) && chunks.contains_key(&3));
    }

    #[test]
    fn keep_set_exceeding_cache_is_a_desync() {
        let mut chunks = cache_with_keys(&[1]);
        let status = release_out_of_range_chunks(&mut chunks, &[1, 99]).unwrap_err();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    }

    #[test]
    fn acknowledgements_coalesce_into_the_tail_batch() {
        let handle = Arc::new(Handle::new(InsertExt { read_credit: false }));
        let callback = insert_completed_callback(Arc::downgrade(&handle));
        for key in 0..10 {
            callback(key);
        }
        let state = handle.lock();
        assert_eq!(state.responses.len(), 1);
        assert_eq!(state.responses[0].keys, (0..10).collect::<Vec<_>>());
        assert!(state.ext.read_credit);
    }

    #[test]
    fn a_full_tail_batch_rolls_over() {
        let handle = Arc::new(Handle::new(InsertExt { read_credit: false }));
        let callback = insert_completed_callback(Arc::downgrade(&handle));
        for key in 0..(MAX_KEYS_PER_RESPONSE as u64 + 3) {
            callback(key);
        }
        let state = handle.lock();
        assert_eq!(state.responses.len(), 2);
        assert_eq!(state.responses[0].keys.len(), MAX_KEYS_PER_RESPONSE);
        assert_eq!(state.responses[1].keys.len(), 3);
    }

    #[test]
    fn callbacks_after_finish_are_dropped() {
        let handle = Arc::new(Handle::new(InsertExt { read_credit: false }));
        let callback = insert_completed_callback(Arc::downgrade(&handle));
        handle.finish(Err(Status::internal("gone")));
        callback(42);
        assert!(handle.lock().responses.is_empty());
    }
}
