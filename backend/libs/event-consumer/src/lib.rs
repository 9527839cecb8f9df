//! # Event Consumer
//!
//! Asynchronous consumption of a partitioned, offset-addressed event log with
//! a bounded worker pool and per-message commits.
//!
//! ## How it works
//!
//! 1. A single fetch loop pulls records from a [`LogReader`] and decodes each
//!    payload into an [`EventEnvelope`]
//! 2. The envelope's position is recorded as pending and the envelope is
//!    submitted to the [`WorkerPool`]; a full queue blocks the fetch loop
//! 3. `num_workers` workers run the [`EventHandler`] and report outcomes on a
//!    channel
//! 4. The consumer commits the position of every success and leaves failures
//!    uncommitted, so they are redelivered after a restart
//!
//! Payloads that do not decode are committed immediately and skipped.
//!
//! Delivery is **at-least-once**: handlers must be idempotent on the envelope
//! id.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use event_consumer::{
//!     ConsumerConfig, EventConsumer, EventEnvelope, EventHandler, MemoryLog, StartPosition,
//! };
//! use std::sync::Arc;
//!
//! struct WelcomeEmail;
//!
//! #[async_trait]
//! impl EventHandler for WelcomeEmail {
//!     fn name(&self) -> &str {
//!         "welcome-email"
//!     }
//!
//!     async fn process(&self, event: &EventEnvelope) -> anyhow::Result<()> {
//!         tracing::info!(account_id = %event.account_id(), "sending welcome email");
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let log = MemoryLog::new("events", 3);
//! let consumer = EventConsumer::new(
//!     Arc::new(log.reader(StartPosition::Earliest)),
//!     Arc::new(WelcomeEmail),
//!     ConsumerConfig::from_env(),
//! )?;
//!
//! consumer
//!     .run_until(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! With the `kafka` feature, `KafkaLogReader` reads a Kafka consumer group
//! instead of the in-memory log.

pub mod config;
pub mod consumer;
mod error;
pub mod handler;
pub mod log;
pub mod metrics;
mod pending;
pub mod pool;

pub use config::{ConsumerConfig, PoolConfig, StartPosition};
pub use consumer::{ConsumerState, EventConsumer};
pub use error::{ConsumerError, ConsumerResult};
pub use event_schema::EventEnvelope;
pub use handler::{EventHandler, HandlerRouter};
#[cfg(feature = "kafka")]
pub use log::{KafkaLogReader, KafkaReaderConfig};
pub use log::{LogPosition, LogReader, LogRecord, MemoryLog, MemoryLogReader};
pub use metrics::ConsumerMetrics;
pub use pool::{Completion, CompletionReceiver, PoolState, WorkerPool};
