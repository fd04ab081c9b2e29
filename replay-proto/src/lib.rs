//! Protocol buffer definitions for the replay buffer service.
//!
//! Wraps the generated types with small constructors and timestamp helpers so
//! the rest of the workspace never has to assemble raw messages by hand.

// Include the generated protobuf code
tonic::include_proto!("replay.v1");

use bytes::Bytes;
use chrono::{DateTime, Utc};
use prost::Message;
use prost_types::Timestamp;

/// Sentinel accepted by `SampleStreamRequest.flexible_batch_size` to defer to
/// the table's own default batch size.
pub const AUTO_SELECT_BATCH_SIZE: i32 = -1;

/// Convert chrono DateTime to protobuf Timestamp
#[must_use]
pub fn datetime_to_timestamp(dt: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos() as i32,
    }
}

/// Convert protobuf Timestamp to chrono DateTime
#[must_use]
pub fn timestamp_to_datetime(ts: &Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.seconds, ts.nanos as u32).unwrap_or_else(Utc::now)
}

impl ChunkData {
    /// Create a chunk with the given key and payload.
    pub fn new(chunk_key: u64, data: impl Into<Bytes>) -> Self {
        Self {
            chunk_key,
            data: data.into(),
        }
    }

    /// Encoded size of the chunk, the unit used for response byte budgets.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.encoded_len()
    }
}

impl PrioritizedItem {
    /// Create an item destined for `table`, spanning `chunk_keys` in order.
    pub fn new(key: u64, table: impl Into<String>, priority: f64, chunk_keys: Vec<u64>) -> Self {
        Self {
            key,
            table: table.into(),
            priority,
            times_sampled: 0,
            inserted_at: None,
            flat_trajectory: Some(FlatTrajectory { chunk_keys }),
        }
    }

    /// The chunk keys this item's trajectory spans.
    #[must_use]
    pub fn chunk_keys(&self) -> &[u64] {
        self.flat_trajectory
            .as_ref()
            .map_or(&[], |trajectory| trajectory.chunk_keys.as_slice())
    }
}

impl SampleStreamRequest {
    /// Task requesting `num_samples` items from `table` with the table's
    /// default batch size and no rate-limiter deadline.
    pub fn new(table: impl Into<String>, num_samples: i64) -> Self {
        Self {
            table: table.into(),
            num_samples,
            flexible_batch_size: AUTO_SELECT_BATCH_SIZE,
            rate_limiter_timeout: None,
        }
    }

    /// Bound how long a single batch may wait on the table's rate limiter.
    #[must_use]
    pub fn with_timeout_millis(mut self, milliseconds: i64) -> Self {
        self.rate_limiter_timeout = Some(Timeout { milliseconds });
        self
    }
}
