//--------------------------------------------------------------------------------------------------
// STRUCTS & ENUMS
//--------------------------------------------------------------------------------------------------
// | Name               | Description                                          | Key Methods       |
// |--------------------|------------------------------------------------------|-------------------|
// | DispatchResult     | Outcome reported by every CRUD / special callback   | applied, skipped  |
// | DispatchError      | Error taxonomy at the dispatch boundary             | should_requeue    |
// | AckDecision        | What the consumer loop does with a delivery         |                   |
//--------------------------------------------------------------------------------------------------

use serde::Serialize;
use thiserror::Error;

use super::envelope::Record;

/// Result shape returned by every dispatch callback.
///
/// `success: false` is a soft failure: the event could not be applied but
/// retrying cannot help either, so the message is still acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<Record>,
}

impl DispatchResult {
    /// The event was applied to local state
    pub fn applied(message: impl Into<String>, entity: Record) -> Self {
        Self {
            success: true,
            message: message.into(),
            entity: Some(entity),
        }
    }

    /// The event had already been applied (redelivery); nothing changed
    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            entity: None,
        }
    }

    /// The event cannot be applied and will not be retried
    pub fn soft_failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            entity: None,
        }
    }
}

/// Errors crossing the dispatch boundary
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DispatchError {
    /// Broker unreachable or connection lost
    #[error("Broker connection error: {0}")]
    Connection(String),

    /// Missing model or callback mapping
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Payload is missing a required field
    #[error("Validation error: {0}")]
    Validation(String),

    /// The record an update targets does not exist
    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: String },

    /// Store failed after every retry attempt
    #[error("Persistence error after {attempts} attempt(s): {message}")]
    Persistence { attempts: u32, message: String },

    /// Message body is not a valid envelope
    #[error("Decode error: {0}")]
    Decode(String),

    /// A callback panicked instead of returning
    #[error("Callback {callback} panicked: {message}")]
    CallbackPanicked { callback: String, message: String },
}

impl DispatchError {
    /// True when another delivery attempt may succeed: the message should go
    /// back to the queue. Every other error drops the message after logging.
    pub fn should_requeue(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Persistence { .. })
    }

    pub fn ack_decision(&self) -> AckDecision {
        if self.should_requeue() {
            AckDecision::Requeue
        } else {
            AckDecision::Ack
        }
    }
}

/// Final decision for a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Remove the message from the queue (applied, soft-failed or poison)
    Ack,
    /// Negative-acknowledge with requeue so another attempt happens later
    Requeue,
}
