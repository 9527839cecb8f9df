//! Error types for the event schema library

use thiserror::Error;

/// Result type alias for envelope operations
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Errors produced while building, encoding or decoding an envelope
#[derive(Error, Debug)]
pub enum SchemaError {
    /// Payload is not valid JSON or does not match the envelope shape
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Payload decoded but violates an envelope invariant
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),
}
