//! Core runtime for the replay buffer service: the content-addressed chunk
//! registry, priority-weighted sample tables with their worker threads, the
//! shared callback executor, and the in-process table handoff broker.

pub mod chunk_store;
pub mod error;
pub mod executor;
pub mod handoff;
pub mod table;

pub use chunk_store::{Chunk, ChunkKey, ChunkStore};
pub use error::TableError;
pub use executor::{SerialQueue, TaskExecutor};
pub use table::{
    InsertCallback, SampleCallback, SampledItem, Table, TableItem, TableOptions,
};
