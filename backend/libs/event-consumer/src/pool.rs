//! Fixed-size worker pool over a bounded queue
//!
//! `submit` blocks while the queue is full, which is what stalls the fetch
//! loop when handlers fall behind. Outcomes are not reported through a
//! callback: each worker sends a [`Completion`] on the channel returned by
//! [`WorkerPool::start`], and whoever owns the receiver does the bookkeeping.
//! That channel holds at most `num_workers` outcomes; a worker whose outcome
//! does not fit waits before dequeuing again, so slow bookkeeping pushes back
//! on the queue as well.

use event_schema::EventEnvelope;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{ConsumerError, ConsumerResult};
use crate::handler::EventHandler;

/// Lifecycle of a [`WorkerPool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// Outcome of one handler invocation
#[derive(Debug)]
pub struct Completion {
    pub envelope: EventEnvelope,
    pub result: anyhow::Result<()>,
}

impl Completion {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Receiving end of the outcome channel; closes once every worker has exited
pub type CompletionReceiver = mpsc::Receiver<Completion>;

type SharedQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<EventEnvelope>>>;

struct PoolInner {
    state: PoolState,
    sender: Option<mpsc::Sender<EventEnvelope>>,
    receiver: Option<mpsc::Receiver<EventEnvelope>>,
    token: Option<CancellationToken>,
    workers: Vec<JoinHandle<()>>,
}

pub struct WorkerPool {
    config: PoolConfig,
    handler: Arc<dyn EventHandler>,
    inner: Mutex<PoolInner>,
    /// Fires when the pool stops accepting submissions
    closing: CancellationToken,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, handler: Arc<dyn EventHandler>) -> ConsumerResult<Self> {
        config.validate()?;

        let (sender, receiver) = mpsc::channel(config.queue_capacity);

        Ok(Self {
            config,
            handler,
            inner: Mutex::new(PoolInner {
                state: PoolState::Idle,
                sender: Some(sender),
                receiver: Some(receiver),
                token: None,
                workers: Vec::new(),
            }),
            closing: CancellationToken::new(),
        })
    }

    /// Spawn exactly `num_workers` workers
    ///
    /// Cancelling `token` stops workers from dequeuing further envelopes; a
    /// handler call already in progress runs to completion, and its outcome is
    /// dropped if the outcome channel is full at that point.
    pub fn start(&self, token: &CancellationToken) -> ConsumerResult<CompletionReceiver> {
        let mut inner = self.inner.lock();

        match inner.state {
            PoolState::Idle => {}
            PoolState::Running | PoolState::Draining => return Err(ConsumerError::AlreadyStarted),
            PoolState::Stopped => return Err(ConsumerError::AlreadyStopped),
        }

        let receiver = inner.receiver.take().ok_or(ConsumerError::AlreadyStarted)?;
        let queue: SharedQueue = Arc::new(tokio::sync::Mutex::new(receiver));
        let (completions, outcomes) = mpsc::channel(self.config.num_workers);
        let worker_token = token.child_token();

        inner.workers = (0..self.config.num_workers)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    queue.clone(),
                    self.handler.clone(),
                    completions.clone(),
                    worker_token.clone(),
                ))
            })
            .collect();
        inner.token = Some(worker_token);
        inner.state = PoolState::Running;

        info!(
            handler = %self.handler.name(),
            num_workers = self.config.num_workers,
            queue_capacity = self.config.queue_capacity,
            "Worker pool started"
        );

        Ok(outcomes)
    }

    /// Enqueue an envelope, waiting for queue capacity
    ///
    /// Fails with `PoolNotStarted` before `start`, `PoolClosed` once draining
    /// or stopped (including while blocked on a full queue), and `Cancelled`
    /// if `cancel` fires first.
    pub async fn submit(
        &self,
        envelope: EventEnvelope,
        cancel: &CancellationToken,
    ) -> ConsumerResult<()> {
        let sender = {
            let inner = self.inner.lock();
            match inner.state {
                PoolState::Idle => return Err(ConsumerError::PoolNotStarted),
                PoolState::Draining | PoolState::Stopped => return Err(ConsumerError::PoolClosed),
                PoolState::Running => {}
            }
            inner.sender.clone().ok_or(ConsumerError::PoolClosed)?
        };

        tokio::select! {
            biased;
            _ = self.closing.cancelled() => Err(ConsumerError::PoolClosed),
            _ = cancel.cancelled() => Err(ConsumerError::Cancelled),
            sent = sender.send(envelope) => sent.map_err(|_| ConsumerError::PoolClosed),
        }
    }

    /// Close the queue and wait for queued and in-flight work
    ///
    /// On timeout the pool is force-stopped and `DrainTimeout` is returned.
    /// Draining an already stopped pool is a no-op.
    pub async fn drain(&self, timeout: Duration) -> ConsumerResult<()> {
        let workers = {
            let mut inner = self.inner.lock();
            match inner.state {
                PoolState::Idle => return Err(ConsumerError::PoolNotStarted),
                PoolState::Draining => return Err(ConsumerError::PoolClosed),
                PoolState::Stopped => return Ok(()),
                PoolState::Running => {}
            }
            inner.state = PoolState::Draining;
            inner.sender = None;
            std::mem::take(&mut inner.workers)
        };

        // Unblock submitters parked on a full queue so their sender clones drop
        self.closing.cancel();

        info!(
            handler = %self.handler.name(),
            workers = workers.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Draining worker pool"
        );

        let wait_all = async {
            for worker in workers {
                if let Err(e) = worker.await {
                    warn!(error = %e, "Worker task terminated abnormally");
                }
            }
        };

        match tokio::time::timeout(timeout, wait_all).await {
            Ok(()) => {
                let mut inner = self.inner.lock();
                inner.state = PoolState::Stopped;
                inner.token = None;
                info!(handler = %self.handler.name(), "Worker pool drained");
                Ok(())
            }
            Err(_) => {
                warn!(
                    handler = %self.handler.name(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Worker pool drain timed out, forcing stop"
                );
                self.stop();
                Err(ConsumerError::DrainTimeout(timeout))
            }
        }
    }

    /// Stop immediately without waiting for workers
    ///
    /// Workers stop dequeuing; queued envelopes are discarded. Idempotent.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if inner.state == PoolState::Stopped {
            return;
        }

        inner.state = PoolState::Stopped;
        inner.sender = None;
        inner.receiver = None;
        if let Some(token) = inner.token.take() {
            token.cancel();
        }
        inner.workers.clear();
        self.closing.cancel();

        debug!(handler = %self.handler.name(), "Worker pool stopped");
    }

    pub fn state(&self) -> PoolState {
        self.inner.lock().state
    }

    /// Envelopes waiting in the queue (not yet picked up by a worker)
    pub fn queued(&self) -> usize {
        self.inner
            .lock()
            .sender
            .as_ref()
            .map(|sender| sender.max_capacity() - sender.capacity())
            .unwrap_or(0)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_worker(
    worker_id: usize,
    queue: SharedQueue,
    handler: Arc<dyn EventHandler>,
    completions: mpsc::Sender<Completion>,
    token: CancellationToken,
) {
    debug!(worker_id, "Worker started");

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            item = async { queue.lock().await.recv().await } => item,
        };

        let envelope = match next {
            Some(envelope) => envelope,
            None => break,
        };

        let result = invoke(handler.clone(), envelope.clone()).await;
        let completion = Completion { envelope, result };

        tokio::select! {
            biased;
            sent = completions.send(completion) => {
                if sent.is_err() {
                    debug!(worker_id, "Completion receiver dropped");
                }
            }
            _ = token.cancelled() => {
                debug!(worker_id, "Pool stopped while reporting, outcome dropped");
                break;
            }
        }
    }

    debug!(worker_id, "Worker exited");
}

/// Run the handler on its own task so a panic surfaces as an error outcome
async fn invoke(handler: Arc<dyn EventHandler>, envelope: EventEnvelope) -> anyhow::Result<()> {
    match tokio::spawn(async move { handler.process(&envelope).await }).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(anyhow::anyhow!("handler panicked")),
        Err(e) => Err(anyhow::anyhow!("handler task cancelled: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Map;

    struct Noop;

    #[async_trait]
    impl EventHandler for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        async fn process(&self, _event: &EventEnvelope) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Panics;

    #[async_trait]
    impl EventHandler for Panics {
        fn name(&self) -> &str {
            "panics"
        }

        async fn process(&self, _event: &EventEnvelope) -> anyhow::Result<()> {
            panic!("boom");
        }
    }

    fn pool(handler: Arc<dyn EventHandler>, num_workers: usize) -> WorkerPool {
        WorkerPool::new(
            PoolConfig {
                num_workers,
                queue_capacity: 4,
            },
            handler,
        )
        .unwrap()
    }

    fn event() -> EventEnvelope {
        EventEnvelope::new("user.created", "acct-1", Map::new())
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = WorkerPool::new(
            PoolConfig {
                num_workers: 0,
                queue_capacity: 1,
            },
            Arc::new(Noop),
        );
        assert!(matches!(result, Err(ConsumerError::InvalidConfig(_))));

        let oversized = WorkerPool::new(
            PoolConfig {
                num_workers: 1,
                queue_capacity: usize::MAX,
            },
            Arc::new(Noop),
        );
        assert!(matches!(oversized, Err(ConsumerError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let pool = pool(Arc::new(Noop), 2);
        let token = CancellationToken::new();
        assert_eq!(pool.state(), PoolState::Idle);

        let _outcomes = pool.start(&token).unwrap();
        assert_eq!(pool.state(), PoolState::Running);
        assert!(matches!(pool.start(&token), Err(ConsumerError::AlreadyStarted)));

        pool.drain(Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.state(), PoolState::Stopped);
        assert!(matches!(pool.start(&token), Err(ConsumerError::AlreadyStopped)));
        assert!(pool.drain(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_drain_before_start_is_rejected() {
        let pool = pool(Arc::new(Noop), 1);
        assert!(matches!(
            pool.drain(Duration::from_millis(10)).await,
            Err(ConsumerError::PoolNotStarted)
        ));
    }

    #[tokio::test]
    async fn test_panicking_handler_reports_error() {
        let pool = pool(Arc::new(Panics), 1);
        let token = CancellationToken::new();
        let mut outcomes = pool.start(&token).unwrap();

        let envelope = event();
        pool.submit(envelope.clone(), &token).await.unwrap();

        let completion = outcomes.recv().await.unwrap();
        assert_eq!(completion.envelope.id(), envelope.id());
        assert!(!completion.is_success());

        // The worker survives the panic
        pool.submit(event(), &token).await.unwrap();
        assert!(outcomes.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_outcome_channel_closes_after_drain() {
        let pool = pool(Arc::new(Noop), 3);
        let token = CancellationToken::new();
        let mut outcomes = pool.start(&token).unwrap();

        pool.submit(event(), &token).await.unwrap();
        pool.drain(Duration::from_secs(1)).await.unwrap();

        assert!(outcomes.recv().await.is_some());
        assert!(outcomes.recv().await.is_none());
        assert_eq!(pool.queued(), 0);
    }
}
