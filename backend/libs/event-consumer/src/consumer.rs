//! Event consumer orchestrator
//!
//! One fetch loop pulls records from the [`LogReader`], decodes them and hands
//! them to the [`WorkerPool`]; one completion loop turns worker outcomes into
//! commits. Commits are per message: a success commits exactly its own
//! position, a failure leaves it uncommitted so it is redelivered after a
//! restart, and a payload that cannot be decoded is committed and skipped.

use event_schema::EventEnvelope;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConsumerConfig;
use crate::error::{ConsumerError, ConsumerResult};
use crate::handler::EventHandler;
use crate::log::{LogPosition, LogReader, LogRecord};
use crate::metrics::ConsumerMetrics;
use crate::pending::PendingSet;
use crate::pool::{Completion, CompletionReceiver, WorkerPool};

/// Lifecycle of an [`EventConsumer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Started,
    Draining,
    Stopped,
}

/// State shared by the fetch loop and the completion loop
#[derive(Clone)]
struct Pipeline {
    reader: Arc<dyn LogReader>,
    pool: Arc<WorkerPool>,
    pending: Arc<PendingSet>,
    /// One permit per pending entry, bounding fetched-but-unsettled events
    in_flight: Arc<Semaphore>,
    metrics: Option<ConsumerMetrics>,
    handler_name: String,
    fetch_retry_backoff: Duration,
    commit_max_retries: u32,
    commit_retry_backoff: Duration,
}

struct ConsumerTasks {
    fetch: JoinHandle<()>,
    completions: JoinHandle<()>,
}

pub struct EventConsumer {
    pipeline: Pipeline,
    config: ConsumerConfig,
    state: Mutex<ConsumerState>,
    /// Stops the fetch loop
    shutdown: CancellationToken,
    /// Stops the workers; only fired on drop or forced stop
    pool_token: CancellationToken,
    tasks: Mutex<Option<ConsumerTasks>>,
}

impl EventConsumer {
    pub fn new(
        reader: Arc<dyn LogReader>,
        handler: Arc<dyn EventHandler>,
        config: ConsumerConfig,
    ) -> ConsumerResult<Self> {
        config.validate()?;

        let handler_name = handler.name().to_string();
        let pool = WorkerPool::new(config.pool_config(), handler)?;

        Ok(Self {
            pipeline: Pipeline {
                reader,
                pool: Arc::new(pool),
                pending: Arc::new(PendingSet::new()),
                in_flight: Arc::new(Semaphore::new(config.pool_config().max_in_flight())),
                metrics: None,
                handler_name,
                fetch_retry_backoff: config.fetch_retry_backoff,
                commit_max_retries: config.commit_max_retries,
                commit_retry_backoff: config.commit_retry_backoff,
            },
            config,
            state: Mutex::new(ConsumerState::Created),
            shutdown: CancellationToken::new(),
            pool_token: CancellationToken::new(),
            tasks: Mutex::new(None),
        })
    }

    pub fn with_metrics(mut self, metrics: ConsumerMetrics) -> Self {
        self.pipeline.metrics = Some(metrics);
        self
    }

    /// Start the worker pool, the fetch loop and the completion loop
    ///
    /// Must be called from within a Tokio runtime. A consumer starts once.
    pub fn start(&self) -> ConsumerResult<()> {
        let mut state = self.state.lock();
        match *state {
            ConsumerState::Created => {}
            ConsumerState::Started | ConsumerState::Draining => {
                return Err(ConsumerError::AlreadyStarted)
            }
            ConsumerState::Stopped => return Err(ConsumerError::AlreadyStopped),
        }

        let outcomes = self.pipeline.pool.start(&self.pool_token)?;

        let completions = tokio::spawn(self.pipeline.clone().completion_loop(outcomes));
        let fetch = tokio::spawn(self.pipeline.clone().fetch_loop(self.shutdown.clone()));

        *self.tasks.lock() = Some(ConsumerTasks { fetch, completions });
        *state = ConsumerState::Started;

        info!(
            handler = %self.pipeline.handler_name,
            num_workers = self.config.num_workers,
            queue_capacity = self.config.queue_capacity,
            start_position = ?self.config.start_position,
            "Event consumer started"
        );

        Ok(())
    }

    /// Stop fetching, drain the worker pool and close the reader
    ///
    /// `drain_timeout` bounds the whole shutdown: fetch loop exit, pool drain
    /// and settlement of reported outcomes. Returns `DrainTimeout` when it
    /// runs out; the pool has been force-stopped and the reader closed either
    /// way.
    pub async fn shutdown(&self) -> ConsumerResult<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ConsumerState::Started => {}
                ConsumerState::Created => return Err(ConsumerError::NotStarted),
                ConsumerState::Draining | ConsumerState::Stopped => {
                    return Err(ConsumerError::AlreadyStopped)
                }
            }
            *state = ConsumerState::Draining;
        }

        info!(
            handler = %self.pipeline.handler_name,
            pending = self.pipeline.pending.len(),
            "Event consumer shutting down"
        );

        // One deadline covers the fetch loop, the pool and outcome settlement
        let timeout = self.config.drain_timeout;
        let deadline = Instant::now() + timeout;

        self.shutdown.cancel();
        let tasks = self.tasks.lock().take();

        let mut drained = Ok(());
        let mut completions = None;

        if let Some(ConsumerTasks {
            mut fetch,
            completions: settling,
        }) = tasks
        {
            // Fetch and submit both observe the shutdown token
            match tokio::time::timeout_at(deadline, &mut fetch).await {
                Ok(Err(e)) => warn!(error = %e, "Fetch loop terminated abnormally"),
                Ok(Ok(())) => {}
                Err(_) => {
                    fetch.abort();
                    drained = Err(ConsumerError::DrainTimeout(timeout));
                }
            }
            completions = Some(settling);
        }

        if drained.is_ok() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            drained = self
                .pipeline
                .pool
                .drain(remaining)
                .await
                .map_err(|e| match e {
                    ConsumerError::DrainTimeout(_) => ConsumerError::DrainTimeout(timeout),
                    other => other,
                });
        } else {
            self.pipeline.pool.stop();
        }

        if let Some(mut completions) = completions {
            if drained.is_ok() {
                match tokio::time::timeout_at(deadline, &mut completions).await {
                    Ok(Err(e)) => warn!(error = %e, "Completion loop terminated abnormally"),
                    Ok(Ok(())) => {}
                    Err(_) => drained = Err(ConsumerError::DrainTimeout(timeout)),
                }
            }
            // Outcomes not yet settled are dropped; their positions stay uncommitted
            completions.abort();
        }

        if let Err(e) = self.pipeline.reader.close().await {
            warn!(error = %e, "Failed to close log reader");
        }

        *self.state.lock() = ConsumerState::Stopped;

        match &drained {
            Ok(()) => info!(handler = %self.pipeline.handler_name, "Event consumer stopped"),
            Err(e) => warn!(
                handler = %self.pipeline.handler_name,
                error = %e,
                pending = self.pipeline.pending.len(),
                "Event consumer stopped without a clean drain"
            ),
        }

        drained
    }

    /// Start, wait for `signal`, then shut down gracefully
    pub async fn run_until<F>(&self, signal: F) -> ConsumerResult<()>
    where
        F: Future<Output = ()>,
    {
        self.start()?;
        signal.await;
        self.shutdown().await
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock()
    }

    /// Events handed to workers whose outcome has not been settled
    pub fn pending_len(&self) -> usize {
        self.pipeline.pending.len()
    }

    /// Envelopes sitting in the worker queue
    pub fn queued(&self) -> usize {
        self.pipeline.pool.queued()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }
}

impl Drop for EventConsumer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.pool_token.cancel();
    }
}

impl Pipeline {
    async fn fetch_loop(self, shutdown: CancellationToken) {
        debug!(handler = %self.handler_name, "Fetch loop started");

        loop {
            let record = match self.reader.fetch(&shutdown).await {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) => {
                    if e.is_transient() {
                        warn!(
                            error = %e,
                            backoff_ms = self.fetch_retry_backoff.as_millis() as u64,
                            "Log fetch failed, backing off"
                        );
                    } else {
                        error!(
                            error = %e,
                            backoff_ms = self.fetch_retry_backoff.as_millis() as u64,
                            "Log fetch failed with a non-transient error, backing off"
                        );
                    }

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.fetch_retry_backoff) => continue,
                    }
                }
            };

            let envelope = match EventEnvelope::from_slice(&record.payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    self.skip_poison(&record, e.to_string()).await;
                    continue;
                }
            };

            // Stalls here once workers, queue and outcome bookkeeping are all full
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                acquired = self.in_flight.clone().acquire_owned() => match acquired {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let event_id = envelope.id().to_string();
            match self.pending.insert(&event_id, record.position.clone()) {
                Some(previous) => {
                    warn!(
                        event_id = %event_id,
                        previous = %previous,
                        position = %record.position,
                        "Duplicate event id already pending, tracking latest position"
                    );
                    drop(permit);
                }
                None => {
                    permit.forget();
                    self.observe(|m| m.pending.inc());
                }
            }

            debug!(
                event_id = %event_id,
                event_type = %envelope.event_type(),
                account_id = %envelope.account_id(),
                topic = %record.position.topic,
                partition = record.position.partition,
                offset = record.position.offset,
                "Submitting event to worker pool"
            );

            if let Err(e) = self.pool.submit(envelope, &shutdown).await {
                // Never committed, so the record is redelivered on restart
                self.release(&event_id);
                debug!(
                    event_id = %event_id,
                    position = %record.position,
                    error = %e,
                    "Submission rejected, leaving position uncommitted"
                );
                break;
            }
        }

        debug!(handler = %self.handler_name, "Fetch loop stopped");
    }

    async fn skip_poison(&self, record: &LogRecord, reason: String) {
        warn!(
            topic = %record.position.topic,
            partition = record.position.partition,
            offset = record.position.offset,
            payload_len = record.payload.len(),
            error = %reason,
            "Malformed event envelope, committing and skipping"
        );
        self.observe(|m| m.poison.inc());

        if let Err(e) = self.commit(&record.position).await {
            error!(
                position = %record.position,
                error = %e,
                "Failed to commit malformed event"
            );
            self.observe(|m| m.commit_failures.inc());
        }
    }

    async fn completion_loop(self, mut outcomes: CompletionReceiver) {
        while let Some(completion) = outcomes.recv().await {
            self.settle(completion).await;
        }

        debug!(handler = %self.handler_name, "Completion loop stopped");
    }

    async fn settle(&self, completion: Completion) {
        let Completion { envelope, result } = completion;

        let position = match self.pending.get(envelope.id()) {
            Some(position) => position,
            None => {
                warn!(
                    event_id = %envelope.id(),
                    event_type = %envelope.event_type(),
                    "Outcome for an event that is not pending, ignoring"
                );
                return;
            }
        };

        match result {
            Err(e) => {
                error!(
                    handler = %self.handler_name,
                    event_id = %envelope.id(),
                    event_type = %envelope.event_type(),
                    account_id = %envelope.account_id(),
                    campaign_id = ?envelope.campaign_id(),
                    topic = %position.topic,
                    partition = position.partition,
                    offset = position.offset,
                    error = %format!("{:#}", e),
                    "Event handler failed, leaving position uncommitted for redelivery"
                );
                self.observe(|m| m.failed.inc());
            }
            Ok(()) => {
                self.observe(|m| m.processed.inc());

                match self.commit(&position).await {
                    Ok(()) => debug!(
                        event_id = %envelope.id(),
                        position = %position,
                        "Event processed and committed"
                    ),
                    Err(e) => {
                        error!(
                            event_id = %envelope.id(),
                            event_type = %envelope.event_type(),
                            position = %position,
                            error = %e,
                            "Failed to commit processed event"
                        );
                        self.observe(|m| m.commit_failures.inc());
                    }
                }
            }
        }

        self.release(envelope.id());
    }

    fn release(&self, event_id: &str) {
        if self.pending.remove(event_id).is_some() {
            self.in_flight.add_permits(1);
            self.observe(|m| m.pending.dec());
        }
    }

    /// Commit one position, retrying up to `commit_max_retries` times
    async fn commit(&self, position: &LogPosition) -> ConsumerResult<()> {
        let mut attempt = 0;

        loop {
            match self.reader.commit(position).await {
                Ok(()) => {
                    self.observe(|m| m.committed.inc());
                    return Ok(());
                }
                Err(e) if attempt < self.commit_max_retries => {
                    attempt += 1;
                    warn!(
                        position = %position,
                        attempt,
                        max_retries = self.commit_max_retries,
                        error = %e,
                        "Commit failed, retrying"
                    );
                    tokio::time::sleep(self.commit_retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn observe(&self, f: impl FnOnce(&ConsumerMetrics)) {
        if let Some(metrics) = &self.metrics {
            f(metrics);
        }
    }
}
