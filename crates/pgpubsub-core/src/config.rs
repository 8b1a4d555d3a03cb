//! Engine tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::commit::DEFAULT_COMMIT_CHUNK_SIZE;
use crate::publish::DEFAULT_PUBLISH_BATCH_SIZE;

/// Default notification channel raised by the data table trigger.
pub const DEFAULT_CHANNEL: &str = "pubsub_data_changed";

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_BATCH_LIMIT: usize = 10_000;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rows claimed per batch pass.
    pub batch_size: usize,
    /// Rows processed per run, 0 for no limit.
    pub batch_limit: usize,
    /// Concurrent batch passes in parallel mode.
    pub workers: usize,
    /// Rows per bulk UPDATE statement.
    pub commit_chunk_size: usize,
    /// Records per multi-row data upsert.
    pub publish_batch_size: usize,
    pub channel: String,
    /// Interval of the `SELECT 1` sent on the listening connection.
    #[serde(with = "duration_secs")]
    pub keep_alive: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_limit: DEFAULT_BATCH_LIMIT,
            workers: DEFAULT_WORKERS,
            commit_chunk_size: DEFAULT_COMMIT_CHUNK_SIZE,
            publish_batch_size: DEFAULT_PUBLISH_BATCH_SIZE,
            channel: DEFAULT_CHANNEL.to_string(),
            keep_alive: DEFAULT_KEEP_ALIVE,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
