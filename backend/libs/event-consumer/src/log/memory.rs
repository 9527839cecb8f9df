//! In-process partitioned log
//!
//! `MemoryLog` is the shared, append-only storage; each `MemoryLogReader`
//! is one consumer session over it. Commits live on the log, not on the
//! reader, so dropping a reader and opening a new one behaves like a
//! process restart: exactly the uncommitted records are delivered again.

use async_trait::async_trait;
use event_schema::EventEnvelope;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{LogPosition, LogReader, LogRecord};
use crate::config::StartPosition;
use crate::error::{ConsumerError, ConsumerResult};

#[derive(Clone)]
pub struct MemoryLog {
    shared: Arc<Shared>,
}

struct Shared {
    topic: String,
    state: Mutex<LogState>,
    appended: Notify,
}

#[derive(Default)]
struct LogState {
    partitions: Vec<Vec<Vec<u8>>>,
    committed: Vec<BTreeSet<i64>>,
    deliveries: HashMap<LogPosition, usize>,
    commit_order: Vec<LogPosition>,
    failing_fetches: u32,
    failing_commits: u32,
    closed_readers: usize,
}

impl MemoryLog {
    /// Create a log with `partitions` partitions (at least one)
    pub fn new(topic: impl Into<String>, partitions: usize) -> Self {
        let partitions = partitions.max(1);
        let state = LogState {
            partitions: vec![Vec::new(); partitions],
            committed: vec![BTreeSet::new(); partitions],
            ..Default::default()
        };

        Self {
            shared: Arc::new(Shared {
                topic: topic.into(),
                state: Mutex::new(state),
                appended: Notify::new(),
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    pub fn partition_count(&self) -> usize {
        self.shared.state.lock().partitions.len()
    }

    /// Append a raw payload and return its position
    pub fn append(
        &self,
        partition: i32,
        payload: impl Into<Vec<u8>>,
    ) -> ConsumerResult<LogPosition> {
        let position = {
            let mut state = self.shared.state.lock();
            let index = partition_index(&state, partition)?;
            let records = &mut state.partitions[index];
            records.push(payload.into());
            LogPosition::new(self.topic(), partition, records.len() as i64 - 1)
        };

        self.shared.appended.notify_waiters();
        Ok(position)
    }

    /// Encode and append an envelope
    pub fn append_envelope(
        &self,
        partition: i32,
        envelope: &EventEnvelope,
    ) -> ConsumerResult<LogPosition> {
        let payload = envelope.to_vec()?;
        self.append(partition, payload)
    }

    /// Open a new reader session
    pub fn reader(&self, start: StartPosition) -> MemoryLogReader {
        let cursors = {
            let state = self.shared.state.lock();
            state
                .partitions
                .iter()
                .zip(state.committed.iter())
                .map(|(records, committed)| match start {
                    _ if !committed.is_empty() => 0,
                    StartPosition::Earliest => 0,
                    StartPosition::Latest => records.len() as i64,
                })
                .collect()
        };

        MemoryLogReader {
            log: self.clone(),
            cursor: Mutex::new(ReaderCursor {
                offsets: cursors,
                next_partition: 0,
            }),
            closed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.shared
            .state
            .lock()
            .partitions
            .iter()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_committed(&self, position: &LogPosition) -> bool {
        let state = self.shared.state.lock();
        position.topic == self.shared.topic
            && partition_index(&state, position.partition)
                .map(|index| state.committed[index].contains(&position.offset))
                .unwrap_or(false)
    }

    /// Positions in the order their commits were accepted
    pub fn commit_order(&self) -> Vec<LogPosition> {
        self.shared.state.lock().commit_order.clone()
    }

    /// How many times the record at `position` has been handed out
    pub fn deliveries(&self, position: &LogPosition) -> usize {
        self.shared
            .state
            .lock()
            .deliveries
            .get(position)
            .copied()
            .unwrap_or(0)
    }

    /// Number of readers that have been closed
    pub fn closed_readers(&self) -> usize {
        self.shared.state.lock().closed_readers
    }

    /// Make the next `count` fetches fail with a transport error
    pub fn fail_next_fetches(&self, count: u32) {
        self.shared.state.lock().failing_fetches = count;
    }

    /// Make the next `count` commits fail
    pub fn fail_next_commits(&self, count: u32) {
        self.shared.state.lock().failing_commits = count;
    }
}

fn partition_index(state: &LogState, partition: i32) -> ConsumerResult<usize> {
    usize::try_from(partition)
        .ok()
        .filter(|index| *index < state.partitions.len())
        .ok_or_else(|| {
            ConsumerError::Transport(format!("partition {} does not exist", partition))
        })
}

struct ReaderCursor {
    offsets: Vec<i64>,
    next_partition: usize,
}

/// One consumer session over a [`MemoryLog`]
///
/// Partitions are served round-robin; records already committed on the log
/// are skipped.
pub struct MemoryLogReader {
    log: MemoryLog,
    cursor: Mutex<ReaderCursor>,
    closed: AtomicBool,
}

impl MemoryLogReader {
    fn try_next(&self) -> ConsumerResult<Option<LogRecord>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConsumerError::Transport("log reader is closed".to_string()));
        }

        let mut cursor = self.cursor.lock();
        let mut state = self.log.shared.state.lock();

        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(ConsumerError::Transport(
                "log temporarily unreachable".to_string(),
            ));
        }

        let partition_count = state.partitions.len();
        for step in 0..partition_count {
            let index = (cursor.next_partition + step) % partition_count;
            let len = state.partitions[index].len() as i64;

            let mut offset = cursor.offsets[index];
            while offset < len && state.committed[index].contains(&offset) {
                offset += 1;
            }
            cursor.offsets[index] = offset;

            if offset < len {
                cursor.offsets[index] = offset + 1;
                cursor.next_partition = (index + 1) % partition_count;

                let position = LogPosition::new(self.log.topic(), index as i32, offset);
                let payload = state.partitions[index][offset as usize].clone();
                *state.deliveries.entry(position.clone()).or_default() += 1;

                return Ok(Some(LogRecord { position, payload }));
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl LogReader for MemoryLogReader {
    async fn fetch(&self, cancel: &CancellationToken) -> ConsumerResult<Option<LogRecord>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            // Register interest before checking so an append in between is not missed
            let appended = self.log.shared.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if let Some(record) = self.try_next()? {
                return Ok(Some(record));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = &mut appended => {}
            }
        }
    }

    async fn commit(&self, position: &LogPosition) -> ConsumerResult<()> {
        let mut state = self.log.shared.state.lock();

        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(ConsumerError::Commit(format!(
                "durability layer rejected commit of {}",
                position
            )));
        }

        if position.topic != self.log.shared.topic {
            return Err(ConsumerError::Commit(format!(
                "unknown topic '{}'",
                position.topic
            )));
        }

        let index = partition_index(&state, position.partition)
            .map_err(|e| ConsumerError::Commit(e.to_string()))?;
        if position.offset < 0 || position.offset >= state.partitions[index].len() as i64 {
            return Err(ConsumerError::Commit(format!(
                "offset out of range: {}",
                position
            )));
        }

        if state.committed[index].insert(position.offset) {
            state.commit_order.push(position.clone());
        }

        debug!(position = %position, "memory log position committed");
        Ok(())
    }

    async fn close(&self) -> ConsumerResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.log.shared.state.lock().closed_readers += 1;
        }
        Ok(())
    }
}
