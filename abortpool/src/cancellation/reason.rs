//! Causes carried by a fired cancellation token.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Why a token was cancelled.
///
/// The first cause recorded on a token is the one every listener observes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CancelReason {
    /// The operation was aborted through its registry.
    Aborted {
        /// The registry id of the aborted operation.
        id: String,
    },
    /// A timer token elapsed.
    Timeout {
        /// The effective (clamped) timer duration.
        duration: Duration,
    },
    /// Cancellation requested directly on a source.
    Requested(String),
}

impl CancelReason {
    /// Creates an abort cause for a registry id.
    #[must_use]
    pub fn aborted(id: impl Into<String>) -> Self {
        Self::Aborted { id: id.into() }
    }

    /// Creates a timeout cause.
    #[must_use]
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Creates a free-form cause.
    #[must_use]
    pub fn requested(message: impl Into<String>) -> Self {
        Self::Requested(message.into())
    }

    /// Returns true if this cause comes from an elapsed timer.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aborted { id } => write!(f, "operation '{id}' aborted"),
            Self::Timeout { duration } => {
                write!(f, "timed out after {}ms", duration.as_millis())
            }
            Self::Requested(message) => f.write_str(message),
        }
    }
}
