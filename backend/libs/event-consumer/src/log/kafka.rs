//! Kafka-backed log reader
//!
//! Auto-commit is disabled; every commit stores `offset + 1` for the record's
//! partition, which is the next offset the group resumes from.
//!
//! Commits are queued with `CommitMode::Async`. `commit` therefore only fails
//! on local errors (bad partition list, client state); a broker rejecting the
//! offset is reported through librdkafka's commit callback, not here, so
//! commit retries and the `commit_failures` counter never see it.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{LogPosition, LogReader, LogRecord};
use crate::config::{env_parse, StartPosition};
use crate::error::{ConsumerError, ConsumerResult};

/// Kafka consumer group settings
#[derive(Debug, Clone)]
pub struct KafkaReaderConfig {
    pub brokers: String,
    pub group_id: String,
    pub topics: Vec<String>,
    pub session_timeout_ms: u32,
    pub start_position: StartPosition,
}

impl KafkaReaderConfig {
    /// Load Kafka settings from environment variables
    ///
    /// `KAFKA_BROKERS` (default `localhost:9092`), `KAFKA_GROUP_ID` (default
    /// `event-consumer`), `KAFKA_TOPICS` comma separated (default `events`),
    /// `KAFKA_SESSION_TIMEOUT_MS` (default 30000) and `CONSUMER_START_POSITION`.
    pub fn from_env() -> Self {
        let topics = std::env::var("KAFKA_TOPICS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|topic| !topic.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .filter(|topics| !topics.is_empty())
            .unwrap_or_else(|| vec!["events".to_string()]);

        Self {
            brokers: std::env::var("KAFKA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string()),
            group_id: std::env::var("KAFKA_GROUP_ID")
                .unwrap_or_else(|_| "event-consumer".to_string()),
            topics,
            session_timeout_ms: env_parse("KAFKA_SESSION_TIMEOUT_MS").unwrap_or(30000),
            start_position: env_parse("CONSUMER_START_POSITION").unwrap_or_default(),
        }
    }
}

pub struct KafkaLogReader {
    consumer: StreamConsumer,
}

impl KafkaLogReader {
    pub fn new(config: &KafkaReaderConfig) -> ConsumerResult<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", config.start_position.as_offset_reset())
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("enable.partition.eof", "false")
            .create()?;

        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics)?;

        info!(
            brokers = %config.brokers,
            group_id = %config.group_id,
            topics = ?config.topics,
            start_position = ?config.start_position,
            "Kafka log reader subscribed"
        );

        Ok(Self { consumer })
    }
}

#[async_trait]
impl LogReader for KafkaLogReader {
    async fn fetch(&self, cancel: &CancellationToken) -> ConsumerResult<Option<LogRecord>> {
        tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            received = self.consumer.recv() => {
                let message = received.map_err(|e| ConsumerError::Transport(e.to_string()))?;
                let position = LogPosition::new(
                    message.topic(),
                    message.partition(),
                    message.offset(),
                );
                let payload = message.payload().map(<[u8]>::to_vec).unwrap_or_default();

                Ok(Some(LogRecord { position, payload }))
            }
        }
    }

    async fn commit(&self, position: &LogPosition) -> ConsumerResult<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &position.topic,
            position.partition,
            Offset::Offset(position.offset + 1),
        )
        .map_err(|e| ConsumerError::Commit(e.to_string()))?;

        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| ConsumerError::Commit(e.to_string()))?;

        debug!(position = %position, "Kafka offset committed");
        Ok(())
    }

    async fn close(&self) -> ConsumerResult<()> {
        self.consumer.unsubscribe();
        info!("Kafka log reader unsubscribed");
        Ok(())
    }
}
