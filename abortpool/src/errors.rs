//! Error types for abortpool.
//!
//! Registration conflicts are the only errors the registries raise; every
//! other failure surfaced to callers is either their own error or a
//! [`CancellationError`].

use crate::cancellation::CancelReason;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// The umbrella error type for abortpool operations.
#[derive(Debug, Clone, Error)]
pub enum AbortPoolError {
    /// An id was registered while still live.
    #[error("{0}")]
    DuplicateRegistration(#[from] DuplicateRegistrationError),

    /// The operation was cancelled.
    #[error("{0}")]
    Cancelled(#[from] CancellationError),
}

impl AbortPoolError {
    /// Returns true if this error reports a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Error raised when registering an id that is already live.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Operation '{id}' is already registered")]
pub struct DuplicateRegistrationError {
    /// The conflicting id.
    pub id: String,
}

impl DuplicateRegistrationError {
    /// Creates a new duplicate registration error.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Failure surfaced to whatever was awaiting a cancelled operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Operation cancelled: {reason}")]
pub struct CancellationError {
    /// The registry id of the operation, when known.
    pub operation_id: Option<String>,
    /// The timer duration, when the cause was a timeout.
    pub timeout: Option<Duration>,
    /// The cause recorded on the token.
    pub reason: CancelReason,
}

impl CancellationError {
    /// Attaches an operation id.
    #[must_use]
    pub fn with_operation_id(mut self, id: impl Into<String>) -> Self {
        self.operation_id = Some(id.into());
        self
    }

    /// Returns true if the cancellation was caused by a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.timeout.is_some()
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!("CancellationError"));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        if let Some(ref id) = self.operation_id {
            map.insert("operation_id".to_string(), serde_json::json!(id));
        }
        if let Some(timeout) = self.timeout {
            map.insert(
                "timeout_ms".to_string(),
                serde_json::json!(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)),
            );
        }
        map.insert(
            "reason".to_string(),
            serde_json::to_value(&self.reason).unwrap_or(serde_json::Value::Null),
        );
        map
    }
}

impl From<CancelReason> for CancellationError {
    fn from(reason: CancelReason) -> Self {
        let (operation_id, timeout) = match &reason {
            CancelReason::Aborted { id } => (Some(id.clone()), None),
            CancelReason::Timeout { duration } => (None, Some(*duration)),
            CancelReason::Requested(_) => (None, None),
        };
        Self {
            operation_id,
            timeout,
            reason,
        }
    }
}
