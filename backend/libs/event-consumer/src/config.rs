/// Consumer and worker pool configuration
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ConsumerError, ConsumerResult};

/// Where a consumer with no committed position starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StartPosition {
    /// Oldest available record
    #[default]
    Earliest,
    /// Only records appended after the consumer starts
    Latest,
}

impl StartPosition {
    /// Value for librdkafka's `auto.offset.reset`
    pub fn as_offset_reset(&self) -> &'static str {
        match self {
            StartPosition::Earliest => "earliest",
            StartPosition::Latest => "latest",
        }
    }
}

impl FromStr for StartPosition {
    type Err = ConsumerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" | "oldest" | "first" => Ok(StartPosition::Earliest),
            "latest" | "newest" | "last" => Ok(StartPosition::Latest),
            other => Err(ConsumerError::InvalidConfig(format!(
                "unknown start position '{}'",
                other
            ))),
        }
    }
}

/// Upper bound on `num_workers + queue_capacity`
pub const MAX_IN_FLIGHT: usize = tokio::sync::Semaphore::MAX_PERMITS;

/// Worker pool sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of concurrently running workers
    pub num_workers: usize,
    /// Queued envelopes before `submit` blocks
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 10,
            queue_capacity: 100,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> ConsumerResult<()> {
        if self.num_workers == 0 {
            return Err(ConsumerError::InvalidConfig(
                "num_workers must be at least 1".to_string(),
            ));
        }

        if self.queue_capacity == 0 {
            return Err(ConsumerError::InvalidConfig(
                "queue_capacity must be at least 1".to_string(),
            ));
        }

        // Queue slots and in-flight permits are tokio semaphore permits
        let in_flight = self.num_workers.checked_add(self.queue_capacity);
        if !matches!(in_flight, Some(total) if total <= MAX_IN_FLIGHT) {
            return Err(ConsumerError::InvalidConfig(format!(
                "num_workers + queue_capacity must not exceed {}",
                MAX_IN_FLIGHT
            )));
        }

        Ok(())
    }

    /// Envelopes that may be pending at once: running, queued or awaiting settlement
    pub fn max_in_flight(&self) -> usize {
        self.num_workers + self.queue_capacity
    }
}

/// Event consumer configuration
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Number of concurrently running workers (bounds concurrent handler calls)
    pub num_workers: usize,
    /// Bounded queue capacity between the fetch loop and the workers
    pub queue_capacity: usize,
    /// Max wait for in-flight work during graceful shutdown
    pub drain_timeout: Duration,
    /// Starting point for partitions without a committed position
    pub start_position: StartPosition,
    /// Fixed delay between fetch attempts after a transport error
    pub fetch_retry_backoff: Duration,
    /// Extra commit attempts before a commit failure is given up on
    pub commit_max_retries: u32,
    /// Fixed delay between commit attempts
    pub commit_retry_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            num_workers: 10,
            queue_capacity: 100,
            drain_timeout: Duration::from_secs(30),
            start_position: StartPosition::Earliest,
            fetch_retry_backoff: Duration::from_secs(1),
            commit_max_retries: 0,
            commit_retry_backoff: Duration::from_millis(200),
        }
    }
}

impl ConsumerConfig {
    /// Load consumer configuration from environment variables
    ///
    /// Environment variables:
    /// - `CONSUMER_NUM_WORKERS` (default 10)
    /// - `CONSUMER_QUEUE_CAPACITY` (default 100)
    /// - `CONSUMER_DRAIN_TIMEOUT_SECS` (default 30)
    /// - `CONSUMER_START_POSITION`: earliest/oldest or latest/newest (default earliest)
    /// - `CONSUMER_FETCH_RETRY_BACKOFF_MS` (default 1000)
    /// - `CONSUMER_COMMIT_MAX_RETRIES` (default 0)
    /// - `CONSUMER_COMMIT_RETRY_BACKOFF_MS` (default 200)
    ///
    /// Unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            num_workers: env_parse("CONSUMER_NUM_WORKERS").unwrap_or(defaults.num_workers),
            queue_capacity: env_parse("CONSUMER_QUEUE_CAPACITY")
                .unwrap_or(defaults.queue_capacity),
            drain_timeout: env_parse("CONSUMER_DRAIN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.drain_timeout),
            start_position: env_parse("CONSUMER_START_POSITION")
                .unwrap_or(defaults.start_position),
            fetch_retry_backoff: env_parse("CONSUMER_FETCH_RETRY_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.fetch_retry_backoff),
            commit_max_retries: env_parse("CONSUMER_COMMIT_MAX_RETRIES")
                .unwrap_or(defaults.commit_max_retries),
            commit_retry_backoff: env_parse("CONSUMER_COMMIT_RETRY_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.commit_retry_backoff),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            num_workers: self.num_workers,
            queue_capacity: self.queue_capacity,
        }
    }

    pub fn validate(&self) -> ConsumerResult<()> {
        self.pool_config().validate()?;

        if self.drain_timeout.is_zero() {
            return Err(ConsumerError::InvalidConfig(
                "drain_timeout must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

pub(crate) fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
