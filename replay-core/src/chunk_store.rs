//! Content-addressed chunk registry with weak bookkeeping.
//!
//! The store never owns a chunk: strong handles live in the insert streams
//! that received the data and in the table items referencing it. A chunk is
//! reclaimed the moment its last strong holder drops it; the registry entry
//! merely lets later writers of the same key share the surviving allocation.

use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use prost::Message;
use replay_proto::ChunkData;

/// 64-bit content address of a chunk.
pub type ChunkKey = u64;

/// An immutable chunk payload plus its cached encoded size.
#[derive(Debug)]
pub struct Chunk {
    data: ChunkData,
    byte_size: usize,
}

impl Chunk {
    fn new(data: ChunkData) -> Self {
        let byte_size = data.encoded_len();
        Self { data, byte_size }
    }

    #[must_use]
    pub fn key(&self) -> ChunkKey {
        self.data.chunk_key
    }

    #[must_use]
    pub fn data(&self) -> &ChunkData {
        &self.data
    }

    /// Encoded wire size; the unit sample responses budget against.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }
}

/// Concurrent registry of every chunk currently alive in the process.
#[derive(Debug, Default)]
pub struct ChunkStore {
    chunks: DashMap<ChunkKey, Weak<Chunk>>,
}

impl ChunkStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `data` under its key and return a strong handle.
    ///
    /// The first write for a key wins: when a live chunk already carries the
    /// key, the incoming payload is dropped and the resident handle returned.
    pub fn insert(&self, data: ChunkData) -> Arc<Chunk> {
        match self.chunks.entry(data.chunk_key) {
            Entry::Occupied(mut entry) => {
                if let Some(live) = entry.get().upgrade() {
                    live
                } else {
                    let chunk = Arc::new(Chunk::new(data));
                    entry.insert(Arc::downgrade(&chunk));
                    chunk
                }
            }
            Entry::Vacant(entry) => {
                let chunk = Arc::new(Chunk::new(data));
                entry.insert(Arc::downgrade(&chunk));
                chunk
            }
        }
    }

    /// Strong handle for `key`, if some holder still keeps the chunk alive.
    #[must_use]
    pub fn get(&self, key: ChunkKey) -> Option<Arc<Chunk>> {
        self.chunks.get(&key).and_then(|weak| weak.upgrade())
    }

    /// Drop bookkeeping entries whose chunks have been reclaimed.
    pub fn cleanup(&self) {
        self.chunks.retain(|_, weak| weak.strong_count() > 0);
    }

    /// Number of chunks still reachable through the registry.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.chunks
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }
}
