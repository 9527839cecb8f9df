//! Partitioned event log access
//!
//! A [`LogReader`] hands out raw records in per-partition order and accepts
//! per-message commits. Committing a position marks only that record as
//! "will not be redelivered"; it says nothing about lower offsets of the same
//! partition that may still be in flight or have failed.

use async_trait::async_trait;
use std::fmt;
use tokio_util::sync::CancellationToken;

use crate::error::ConsumerResult;

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

#[cfg(feature = "kafka")]
pub use kafka::{KafkaLogReader, KafkaReaderConfig};
pub use memory::{MemoryLog, MemoryLogReader};

/// Partition-scoped position of a record in the log
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogPosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl LogPosition {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.topic, self.partition, self.offset)
    }
}

/// A raw record fetched from the log
///
/// The payload is kept undecoded so a malformed envelope can still be
/// committed by position.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub position: LogPosition,
    pub payload: Vec<u8>,
}

/// Reader over a partitioned, offset-addressed log
#[async_trait]
pub trait LogReader: Send + Sync {
    /// Wait for the next record.
    ///
    /// Returns `Ok(None)` once `cancel` fires. Transport failures are returned
    /// as transient errors; the caller decides how to back off.
    async fn fetch(&self, cancel: &CancellationToken) -> ConsumerResult<Option<LogRecord>>;

    /// Durably record that `position` need not be redelivered.
    async fn commit(&self, position: &LogPosition) -> ConsumerResult<()>;

    /// Release underlying resources once processing has drained.
    async fn close(&self) -> ConsumerResult<()>;
}
