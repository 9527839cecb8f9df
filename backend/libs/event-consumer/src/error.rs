//! Error types for the event consumer library

use event_schema::SchemaError;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for consumer operations
pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Errors that can occur while consuming the event log
///
/// Only contract violations (double start, submit after shutdown, drain
/// timeout) are returned to callers synchronously; transport, handler and
/// commit failures are logged and folded into the retry-or-commit decision.
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// `start` called on a consumer that is already running
    #[error("Consumer already started")]
    AlreadyStarted,

    /// Operation attempted after the consumer was shut down
    #[error("Consumer already stopped")]
    AlreadyStopped,

    /// Shutdown requested on a consumer that was never started
    #[error("Consumer not started")]
    NotStarted,

    /// Submission or drain on a pool that was never started
    #[error("Worker pool not started")]
    PoolNotStarted,

    /// Submission on a pool that is draining or stopped
    #[error("Worker pool is shutting down")]
    PoolClosed,

    /// Blocking operation interrupted by the caller's cancellation signal
    #[error("Operation cancelled")]
    Cancelled,

    /// Workers did not finish within the drain timeout and were force-stopped
    #[error("Drain timed out after {0:?}")]
    DrainTimeout(Duration),

    /// Log temporarily unreachable
    #[error("Transport error: {0}")]
    Transport(String),

    /// Durability layer rejected a commit
    #[error("Commit failed: {0}")]
    Commit(String),

    /// Configuration values out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Envelope could not be decoded
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Kafka client error
    #[cfg(feature = "kafka")]
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

impl ConsumerError {
    /// Check if error is transient (fetch should back off and retry)
    pub fn is_transient(&self) -> bool {
        match self {
            ConsumerError::Transport(_) => true,
            #[cfg(feature = "kafka")]
            ConsumerError::Kafka(_) => true,
            _ => false,
        }
    }

    /// Check if error is a lifecycle contract violation
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            ConsumerError::AlreadyStarted
                | ConsumerError::AlreadyStopped
                | ConsumerError::NotStarted
                | ConsumerError::PoolNotStarted
                | ConsumerError::PoolClosed
                | ConsumerError::DrainTimeout(_)
        )
    }
}
