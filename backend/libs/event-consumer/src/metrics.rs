use prometheus::{IntCounter, IntGauge, Opts};
use tracing::warn;

/// Prometheus metrics for one consumer, labelled with its handler name
#[derive(Clone)]
pub struct ConsumerMetrics {
    pub processed: IntCounter,
    pub failed: IntCounter,
    pub committed: IntCounter,
    pub poison: IntCounter,
    pub commit_failures: IntCounter,
    pub pending: IntGauge,
}

impl ConsumerMetrics {
    pub fn new(handler: &str) -> Result<Self, prometheus::Error> {
        let opts = |name: &str, help: &str| {
            Opts::new(name, help).const_label("handler", handler.to_string())
        };

        let processed = IntCounter::with_opts(opts(
            "event_consumer_processed_total",
            "Events whose handler returned success",
        ))?;
        let failed = IntCounter::with_opts(opts(
            "event_consumer_failed_total",
            "Events whose handler returned an error (left uncommitted)",
        ))?;
        let committed = IntCounter::with_opts(opts(
            "event_consumer_committed_total",
            "Log positions committed, including poison messages",
        ))?;
        let poison = IntCounter::with_opts(opts(
            "event_consumer_poison_total",
            "Payloads that could not be decoded and were skipped",
        ))?;
        let commit_failures = IntCounter::with_opts(opts(
            "event_consumer_commit_failures_total",
            "Commits rejected by the log after all retries",
        ))?;
        let pending = IntGauge::with_opts(opts(
            "event_consumer_pending",
            "Events handed to workers whose outcome is not yet known",
        ))?;

        let registry = prometheus::default_registry();
        for metric in [
            Box::new(processed.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(failed.clone()),
            Box::new(committed.clone()),
            Box::new(poison.clone()),
            Box::new(commit_failures.clone()),
            Box::new(pending.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register consumer metric: {}", e);
            }
        }

        Ok(Self {
            processed,
            failed,
            committed,
            poison,
            commit_failures,
            pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_registration_is_tolerated() {
        let first = ConsumerMetrics::new("metrics-test").unwrap();
        let second = ConsumerMetrics::new("metrics-test").unwrap();

        first.processed.inc();
        second.processed.inc_by(2);

        assert_eq!(first.processed.get(), 1);
        assert_eq!(second.processed.get(), 2);
    }
}
