//! Registry and registration configuration.

use crate::cancellation::{cancellation_error, CancellationToken};
use crate::errors::CancellationError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked with the registration's config, callbacks stripped.
pub type AbortCallback = Arc<dyn Fn(&RegistrationConfig) + Send + Sync>;

/// Pool-wide settings for a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Prefix of generated ids (`{pool_name}-{counter}`).
    pub pool_name: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            pool_name: "pool".to_string(),
        }
    }
}

impl RegistryConfig {
    /// Creates a new registry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the pool name.
    #[must_use]
    pub fn with_pool_name(mut self, name: impl Into<String>) -> Self {
        self.pool_name = name.into();
        self
    }
}

/// Per-operation registration options.
#[derive(Clone, Default)]
pub struct RegistrationConfig {
    /// Explicit id; generated when absent.
    pub abort_id: Option<String>,
    /// Invoked after an explicit `abort` of this operation.
    pub on_aborted: Option<AbortCallback>,
    /// Cancels the operation after this long (composite registry only).
    pub abort_timeout: Option<Duration>,
    /// Invoked when `abort_timeout` elapses (composite registry only).
    pub on_aborted_timeout: Option<AbortCallback>,
    /// Caller-owned token merged into the operation's token.
    pub external_token: Option<CancellationToken>,
}

impl RegistrationConfig {
    /// Creates an empty registration config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the operation id.
    #[must_use]
    pub fn with_abort_id(mut self, id: impl Into<String>) -> Self {
        self.abort_id = Some(id.into());
        self
    }

    /// Sets the abort callback.
    #[must_use]
    pub fn with_on_aborted<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RegistrationConfig) + Send + Sync + 'static,
    {
        self.on_aborted = Some(Arc::new(callback));
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_abort_timeout(mut self, timeout: Duration) -> Self {
        self.abort_timeout = Some(timeout);
        self
    }

    /// Sets the timeout callback.
    #[must_use]
    pub fn with_on_aborted_timeout<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RegistrationConfig) + Send + Sync + 'static,
    {
        self.on_aborted_timeout = Some(Arc::new(callback));
        self
    }

    /// Sets the external token.
    #[must_use]
    pub fn with_external_token(mut self, token: CancellationToken) -> Self {
        self.external_token = Some(token);
        self
    }

    /// Returns a copy without `on_aborted` and `on_aborted_timeout`.
    #[must_use]
    pub fn without_callbacks(&self) -> Self {
        Self {
            abort_id: self.abort_id.clone(),
            on_aborted: None,
            abort_timeout: self.abort_timeout,
            on_aborted_timeout: None,
            external_token: self.external_token.clone(),
        }
    }
}

impl std::fmt::Debug for RegistrationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationConfig")
            .field("abort_id", &self.abort_id)
            .field("on_aborted", &self.on_aborted.is_some())
            .field("abort_timeout", &self.abort_timeout)
            .field("on_aborted_timeout", &self.on_aborted_timeout.is_some())
            .field("external_token", &self.external_token)
            .finish()
    }
}

/// The id and token handed out by `register`.
#[derive(Debug, Clone)]
pub struct Registration {
    /// The operation id.
    pub id: String,
    /// The token the operation should observe.
    pub token: CancellationToken,
}

impl Registration {
    /// The error an operation should surface once its token has fired,
    /// tagged with this registration's id.
    #[must_use]
    pub fn cancellation_error(&self) -> Option<CancellationError> {
        self.token
            .is_cancelled()
            .then(|| cancellation_error(&self.token).with_operation_id(self.id.as_str()))
    }
}

/// Identifies an entry either by id or by the config it was registered with.
#[derive(Debug, Clone, Copy)]
pub enum OperationKey<'a> {
    /// A literal id.
    Id(&'a str),
    /// Resolved like `register` does: `abort_id`, or a freshly generated id.
    Config(&'a RegistrationConfig),
}

impl<'a> From<&'a str> for OperationKey<'a> {
    fn from(id: &'a str) -> Self {
        Self::Id(id)
    }
}

impl<'a> From<&'a String> for OperationKey<'a> {
    fn from(id: &'a String) -> Self {
        Self::Id(id.as_str())
    }
}

impl<'a> From<&'a RegistrationConfig> for OperationKey<'a> {
    fn from(config: &'a RegistrationConfig) -> Self {
        Self::Config(config)
    }
}
