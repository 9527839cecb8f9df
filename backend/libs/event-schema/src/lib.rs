/// Event envelope shared by every producer and consumer of the event log
///
/// The envelope is the immutable unit of work that flows through the log:
/// identity, dot-namespaced type, tenant scope, and an open JSON payload.
/// Producers build it once with [`EventEnvelope::new`]; consumers decode it
/// with [`EventEnvelope::from_slice`] and never mutate it afterwards.
///
/// Wire shape:
/// ```json
/// {
///   "id": "6f1c9a52-0d0e-4a8b-9a57-0f5f0d5c3f0e",
///   "type": "user.created",
///   "account_id": "acct-42",
///   "campaign_id": null,
///   "data": { "email": "jane@example.com" },
///   "timestamp": "2026-10-16T09:30:00Z"
/// }
/// ```
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

mod error;

pub use error::{SchemaError, SchemaResult};

/// Separator between the namespace and the action of an event type
pub const TYPE_SEPARATOR: char = '.';

/// Immutable event envelope
///
/// Fields are private so an envelope cannot be altered once it has been
/// built or decoded; use the accessors to read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    account_id: String,
    #[serde(default)]
    campaign_id: Option<String>,
    #[serde(default)]
    data: Map<String, Value>,
    timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    /// Create a new envelope with a fresh UUID v4 id and the current time
    pub fn new(
        event_type: impl Into<String>,
        account_id: impl Into<String>,
        data: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            account_id: account_id.into(),
            campaign_id: None,
            data,
            timestamp: Utc::now(),
        }
    }

    /// Create an envelope from a payload value, which must be a JSON object
    pub fn from_value(
        event_type: impl Into<String>,
        account_id: impl Into<String>,
        data: Value,
    ) -> SchemaResult<Self> {
        match data {
            Value::Object(map) => Ok(Self::new(event_type, account_id, map)),
            other => Err(SchemaError::InvalidEnvelope(format!(
                "data must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Override the generated id (used when re-publishing a known event)
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_campaign_id(mut self, campaign_id: impl Into<String>) -> Self {
        self.campaign_id = Some(campaign_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn campaign_id(&self) -> Option<&str> {
        self.campaign_id.as_deref()
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Leading segment of the event type ("user" for "user.created")
    pub fn namespace(&self) -> &str {
        self.event_type
            .split(TYPE_SEPARATOR)
            .next()
            .unwrap_or_default()
    }

    /// Validate the invariants a decoded envelope must satisfy
    pub fn validate(&self) -> SchemaResult<()> {
        if self.id.trim().is_empty() {
            return Err(SchemaError::InvalidEnvelope("id is empty".to_string()));
        }

        if self.event_type.trim().is_empty() {
            return Err(SchemaError::InvalidEnvelope("type is empty".to_string()));
        }

        if self.event_type.starts_with(TYPE_SEPARATOR) || self.event_type.ends_with(TYPE_SEPARATOR)
        {
            return Err(SchemaError::InvalidEnvelope(format!(
                "type '{}' is not dot-namespaced",
                self.event_type
            )));
        }

        if self.account_id.trim().is_empty() {
            return Err(SchemaError::InvalidEnvelope(
                "account_id is empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Decode and validate an envelope from raw log bytes
    pub fn from_slice(payload: &[u8]) -> SchemaResult<Self> {
        let envelope: Self = serde_json::from_slice(payload)?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Encode the envelope into its wire representation
    pub fn to_vec(&self) -> SchemaResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
