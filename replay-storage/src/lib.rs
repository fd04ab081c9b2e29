//! Checkpoint persistence for replay tables.
//!
//! A checkpoint is one prost-encoded [`CheckpointData`] file holding every
//! resident chunk once plus each table's items with their live priorities and
//! sample counts. Loading registers the chunks in the [`ChunkStore`] and
//! restores items into the tables matching by name.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use prost::Message;
use thiserror::Error;
use tracing::{info, warn};

use replay_core::{Chunk, ChunkStore, Table};
use replay_proto::{CheckpointData, TableCheckpoint};

/// Errors surfaced by checkpoint load and save operations.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("no checkpoint found under {path}")]
    NotFound { path: PathBuf },

    #[error("checkpoint at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("checkpoint item {item_key} references chunk {chunk_key} missing from the snapshot")]
    MissingChunk { item_key: u64, chunk_key: u64 },

    #[error("checkpoint io failed at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    /// A missing checkpoint is a recoverable startup condition; everything
    /// else is not.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type for checkpoint operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Snapshot load/save surface the service drives at startup and on demand.
pub trait Checkpointer: Send + Sync {
    /// Load the newest checkpoint from the root location.
    fn load_latest(&self, chunks: &ChunkStore, tables: &[Arc<Table>]) -> Result<()>;

    /// Load the configured fallback checkpoint, if any.
    fn load_fallback(&self, chunks: &ChunkStore, tables: &[Arc<Table>]) -> Result<()>;

    /// Write a new checkpoint, pruning older ones down to `keep_latest`.
    /// Returns the path of the checkpoint just written.
    fn save(&self, tables: &[Arc<Table>], keep_latest: usize) -> Result<PathBuf>;

    /// Human-readable summary for logs.
    fn debug_string(&self) -> String;
}

/// Checkpointer writing prost-encoded snapshots under a root directory.
///
/// File names are zero-padded nanosecond timestamps so lexicographic order is
/// chronological order.
pub struct FileCheckpointer {
    root: PathBuf,
    fallback: Option<PathBuf>,
}

impl FileCheckpointer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            fallback: None,
        }
    }

    /// Configure a fallback checkpoint file, consulted when the root holds
    /// nothing. Useful to seed a fresh deployment from another run's state.
    #[must_use]
    pub fn with_fallback(mut self, fallback: impl Into<PathBuf>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }

    fn sorted_checkpoints(&self) -> Result<Vec<PathBuf>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.root).map_err(|e| StorageError::io(&self.root, e))?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "ckpt"))
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn load_file(&self, path: &Path, chunks: &ChunkStore, tables: &[Arc<Table>]) -> Result<()> {
        let bytes = fs::read(path).map_err(|e| StorageError::io(path, e))?;
        let data = CheckpointData::decode(bytes.as_slice()).map_err(|e| StorageError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        // Hold strong chunk handles until every item referencing them has
        // been restored; afterwards the items themselves keep them alive.
        let mut resident: std::collections::HashMap<u64, Arc<Chunk>> =
            std::collections::HashMap::with_capacity(data.chunks.len());
        for chunk in data.chunks {
            let handle = chunks.insert(chunk);
            resident.insert(handle.key(), handle);
        }

        for table_checkpoint in data.tables {
            let Some(table) = tables
                .iter()
                .find(|table| table.name() == table_checkpoint.table_name)
            else {
                warn!(
                    table = %table_checkpoint.table_name,
                    "checkpoint contains a table this server does not serve; skipping"
                );
                continue;
            };
            for item in table_checkpoint.items {
                let mut item_chunks = Vec::with_capacity(item.chunk_keys().len());
                for key in item.chunk_keys() {
                    let chunk = resident.get(key).ok_or(StorageError::MissingChunk {
                        item_key: item.key,
                        chunk_key: *key,
                    })?;
                    item_chunks.push(Arc::clone(chunk));
                }
                table
                    .restore_item(item, item_chunks)
                    .map_err(|e| StorageError::Corrupt {
                        path: path.to_path_buf(),
                        reason: e.to_string(),
                    })?;
            }
        }
        info!(path = %path.display(), "restored checkpoint");
        Ok(())
    }

    fn prune(&self, keep_latest: usize) -> Result<()> {
        let mut paths = self.sorted_checkpoints()?;
        while paths.len() > keep_latest.max(1) {
            let oldest = paths.remove(0);
            fs::remove_file(&oldest).map_err(|e| StorageError::io(&oldest, e))?;
        }
        Ok(())
    }
}

impl Checkpointer for FileCheckpointer {
    fn load_latest(&self, chunks: &ChunkStore, tables: &[Arc<Table>]) -> Result<()> {
        match self.sorted_checkpoints()?.pop() {
            Some(path) => self.load_file(&path, chunks, tables),
            None => Err(StorageError::NotFound {
                path: self.root.clone(),
            }),
        }
    }

    fn load_fallback(&self, chunks: &ChunkStore, tables: &[Arc<Table>]) -> Result<()> {
        let Some(fallback) = &self.fallback else {
            return Err(StorageError::NotFound {
                path: self.root.clone(),
            });
        };
        if !fallback.exists() {
            return Err(StorageError::NotFound {
                path: fallback.clone(),
            });
        }
        self.load_file(fallback, chunks, tables)
    }

    fn save(&self, tables: &[Arc<Table>], keep_latest: usize) -> Result<PathBuf> {
        fs::create_dir_all(&self.root).map_err(|e| StorageError::io(&self.root, e))?;

        let mut data = CheckpointData::default();
        let mut seen_chunks = HashSet::new();
        for table in tables {
            let mut checkpoint = TableCheckpoint {
                table_name: table.name().to_string(),
                items: Vec::new(),
            };
            for (item, item_chunks) in table.checkpoint() {
                for chunk in &item_chunks {
                    if seen_chunks.insert(chunk.key()) {
                        data.chunks.push(chunk.data().clone());
                    }
                }
                checkpoint.items.push(item);
            }
            data.tables.push(checkpoint);
        }

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let path = self.root.join(format!("{nanos:024}.ckpt"));
        fs::write(&path, data.encode_to_vec()).map_err(|e| StorageError::io(&path, e))?;
        self.prune(keep_latest)?;
        info!(
            path = %path.display(),
            tables = data.tables.len(),
            chunks = data.chunks.len(),
            "wrote checkpoint"
        );
        Ok(path)
    }

    fn debug_string(&self) -> String {
        match &self.fallback {
            Some(fallback) => format!(
                "FileCheckpointer(root={}, fallback={})",
                self.root.display(),
                fallback.display()
            ),
            None => format!("FileCheckpointer(root={})", self.root.display()),
        }
    }
}
