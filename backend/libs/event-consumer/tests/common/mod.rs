//! Shared handlers and helpers for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use event_consumer::{Completion, CompletionReceiver, ConsumerConfig, EventEnvelope, EventHandler};
use parking_lot::Mutex;
use serde_json::Map;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn event(id: &str, event_type: &str) -> EventEnvelope {
    EventEnvelope::new(event_type, "acct-1", Map::new()).with_id(id)
}

pub fn test_config() -> ConsumerConfig {
    ConsumerConfig {
        num_workers: 2,
        queue_capacity: 8,
        drain_timeout: Duration::from_secs(5),
        fetch_retry_backoff: Duration::from_millis(10),
        ..Default::default()
    }
}

/// Read every outcome until the pool's workers have all exited
pub fn collect_outcomes(mut outcomes: CompletionReceiver) -> JoinHandle<Vec<Completion>> {
    tokio::spawn(async move {
        let mut collected = Vec::new();
        while let Some(completion) = outcomes.recv().await {
            collected.push(completion);
        }
        collected
    })
}

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Counts calls per event id, optionally failing chosen ids a number of times
#[derive(Default)]
pub struct RecordingHandler {
    calls: Mutex<HashMap<String, usize>>,
    failures: Mutex<HashMap<String, u32>>,
    delay: Option<Duration>,
    started: AtomicUsize,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn fail_times(self, event_id: &str, times: u32) -> Self {
        self.failures.lock().insert(event_id.to_string(), times);
        self
    }

    pub fn calls(&self, event_id: &str) -> usize {
        self.calls.lock().get(event_id).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    fn name(&self) -> &str {
        "recording"
    }

    async fn process(&self, event: &EventEnvelope) -> anyhow::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        *self.calls.lock().entry(event.id().to_string()).or_default() += 1;

        let mut failures = self.failures.lock();
        if let Some(remaining) = failures.get_mut(event.id()) {
            if *remaining > 0 {
                *remaining -= 1;
                anyhow::bail!("simulated failure for {}", event.id());
            }
        }

        Ok(())
    }
}

/// Blocks selected events (or all of them) until a permit is released
pub struct GatedHandler {
    gate: Semaphore,
    gated_ids: Option<HashSet<String>>,
    started: AtomicUsize,
    completed: AtomicUsize,
}

impl GatedHandler {
    /// Every event waits for a permit
    pub fn all() -> Self {
        Self {
            gate: Semaphore::new(0),
            gated_ids: None,
            started: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        }
    }

    /// Only the listed events wait for a permit
    pub fn only(ids: &[&str]) -> Self {
        Self {
            gated_ids: Some(ids.iter().map(|id| id.to_string()).collect()),
            ..Self::all()
        }
    }

    pub fn release(&self, permits: usize) {
        self.gate.add_permits(permits);
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for GatedHandler {
    fn name(&self) -> &str {
        "gated"
    }

    async fn process(&self, event: &EventEnvelope) -> anyhow::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);

        let gated = self
            .gated_ids
            .as_ref()
            .map(|ids| ids.contains(event.id()))
            .unwrap_or(true);
        if gated {
            self.gate.acquire().await?.forget();
        }

        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
