//! Mock operations and callbacks for testing.

use crate::errors::CancellationError;
use crate::registry::RegistrationConfig;
use parking_lot::Mutex;
use std::future::{ready, Ready};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Error produced by [`FlakyOperation`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlakyError {
    /// The attempt failed on purpose.
    #[error("attempt {attempt} failed")]
    Failed {
        /// The attempt index passed to the operation.
        attempt: u32,
    },

    /// The operation was cancelled.
    #[error("{0}")]
    Cancelled(#[from] CancellationError),
}

/// An operation that fails a fixed number of times, then succeeds.
///
/// On success it yields the 0-based index of the successful call.
#[derive(Debug)]
pub struct FlakyOperation {
    failures: u32,
    calls: AtomicU32,
}

impl FlakyOperation {
    /// Fails the first `failures` calls.
    #[must_use]
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }

    /// Never succeeds.
    #[must_use]
    pub fn always_failing() -> Self {
        Self::new(u32::MAX)
    }

    /// Runs one attempt.
    pub fn call(&self, attempt: u32) -> Ready<Result<u32, FlakyError>> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        if index < self.failures {
            ready(Err(FlakyError::Failed { attempt }))
        } else {
            ready(Ok(index))
        }
    }

    /// Returns the number of calls so far.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Records the configs passed to `on_aborted` / `on_aborted_timeout`.
#[derive(Debug, Clone, Default)]
pub struct CallbackRecorder {
    seen: Arc<Mutex<Vec<RegistrationConfig>>>,
}

impl CallbackRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a callback that records into this recorder.
    #[must_use]
    pub fn callback(&self) -> impl Fn(&RegistrationConfig) + Send + Sync + 'static {
        let seen = self.seen.clone();
        move |config: &RegistrationConfig| seen.lock().push(config.clone())
    }

    /// Number of recorded invocations.
    #[must_use]
    pub fn count(&self) -> usize {
        self.seen.lock().len()
    }

    /// The most recent config received.
    #[must_use]
    pub fn last(&self) -> Option<RegistrationConfig> {
        self.seen.lock().last().cloned()
    }
}
