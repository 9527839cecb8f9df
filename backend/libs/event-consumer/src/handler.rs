/// Event handler contract and type-based routing
///
/// Domain services plug into the consumer by implementing [`EventHandler`].
/// Redelivery after a failure or a crash before commit is guaranteed, so
/// every implementation must be idempotent on the envelope id.
use anyhow::Context;
use async_trait::async_trait;
use event_schema::EventEnvelope;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable identifier used for logging and metrics, never for dispatch
    fn name(&self) -> &str;

    /// Process one event; an error leaves its log position uncommitted
    async fn process(&self, event: &EventEnvelope) -> anyhow::Result<()>;
}

/// Dispatches events to handlers by exact type, then by namespace
///
/// Event types nobody registered for are acknowledged and skipped, so a
/// consumer subscribed to a shared topic does not stall on foreign events.
pub struct HandlerRouter {
    name: String,
    by_type: HashMap<String, Arc<dyn EventHandler>>,
    by_namespace: HashMap<String, Arc<dyn EventHandler>>,
    fallback: Option<Arc<dyn EventHandler>>,
}

impl HandlerRouter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            by_type: HashMap::new(),
            by_namespace: HashMap::new(),
            fallback: None,
        }
    }

    /// Route one exact event type ("user.created")
    pub fn route(mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.by_type.insert(event_type.into(), handler);
        self
    }

    /// Route every event type under a namespace ("user" matches "user.created")
    pub fn route_namespace(
        mut self,
        namespace: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        self.by_namespace.insert(namespace.into(), handler);
        self
    }

    /// Handler for events no other route matches
    pub fn fallback(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    fn resolve(&self, event: &EventEnvelope) -> Option<&Arc<dyn EventHandler>> {
        self.by_type
            .get(event.event_type())
            .or_else(|| self.by_namespace.get(event.namespace()))
            .or(self.fallback.as_ref())
    }
}

#[async_trait]
impl EventHandler for HandlerRouter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, event: &EventEnvelope) -> anyhow::Result<()> {
        match self.resolve(event) {
            Some(handler) => handler
                .process(event)
                .await
                .with_context(|| format!("handler '{}' failed", handler.name())),
            None => {
                debug!(
                    router = %self.name,
                    event_id = %event.id(),
                    event_type = %event.event_type(),
                    "No handler registered for event type, skipping"
                );
                Ok(())
            }
        }
    }
}
