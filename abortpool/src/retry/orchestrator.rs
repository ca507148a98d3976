//! Cancellable retry orchestration.
//!
//! Executes an operation under a retry/backoff policy. The error returned to
//! the caller is always the operation's own error from the last attempt, or a
//! cancellation error converted through `E: From<CancellationError>` when the
//! policy's token fires.

use super::{JitterStrategy, RetryConfig};
use crate::cancellation::{cancellation_error, CancellationToken};
use crate::errors::CancellationError;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Custom delay as a function of the failed attempt's index.
pub type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Decides whether a failure should be retried.
pub type ShouldRetryFn<E> = Arc<dyn Fn(&RetryContext<'_, E>) -> bool + Send + Sync>;

/// What the policy knows about a failed attempt.
#[derive(Debug)]
pub struct RetryContext<'a, E> {
    /// 0-based index of the attempt that failed.
    pub attempt_index: u32,
    /// The error it failed with.
    pub last_error: &'a E,
    /// Attempts still allowed after this one.
    pub retries_left: u32,
}

/// States of a single `retry` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryState {
    /// Running an attempt.
    Attempting,
    /// Waiting before the next attempt.
    Delaying,
    /// An attempt succeeded.
    Succeeded,
    /// All attempts failed.
    Exhausted,
    /// The cancellation token fired.
    Aborted,
    /// `should_retry` declined a failure.
    RejectedByPolicy,
}

impl RetryState {
    /// Returns true for states that end the invocation.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Attempting | Self::Delaying)
    }
}

/// Diagnostics for one `retry` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryReport {
    /// The state the invocation ended in.
    pub final_state: RetryState,
    /// Number of times the operation was invoked.
    pub attempts: u32,
    /// Delays waited between attempts, in order.
    pub delays: Vec<Duration>,
}

impl Default for RetryReport {
    fn default() -> Self {
        Self {
            final_state: RetryState::Attempting,
            attempts: 0,
            delays: Vec::new(),
        }
    }
}

/// Full retry policy: [`RetryConfig`] plus runtime hooks.
pub struct RetryOptions<E> {
    /// Serializable part of the policy.
    pub config: RetryConfig,
    /// Overrides the fixed/exponential formula when set.
    pub delay_fn: Option<DelayFn>,
    /// Defaults to always retrying.
    pub should_retry: Option<ShouldRetryFn<E>>,
    /// Aborts the invocation when fired.
    pub cancellation_token: Option<CancellationToken>,
}

impl<E> Default for RetryOptions<E> {
    fn default() -> Self {
        Self::from_config(RetryConfig::default())
    }
}

impl<E> Clone for RetryOptions<E> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            delay_fn: self.delay_fn.clone(),
            should_retry: self.should_retry.clone(),
            cancellation_token: self.cancellation_token.clone(),
        }
    }
}

impl<E> std::fmt::Debug for RetryOptions<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOptions")
            .field("config", &self.config)
            .field("delay_fn", &self.delay_fn.is_some())
            .field("should_retry", &self.should_retry.is_some())
            .field("cancellation_token", &self.cancellation_token)
            .finish()
    }
}

impl<E> RetryOptions<E> {
    /// Creates options with the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options from a config.
    #[must_use]
    pub fn from_config(config: RetryConfig) -> Self {
        Self {
            config,
            delay_fn: None,
            should_retry: None,
            cancellation_token: None,
        }
    }

    /// Sets the total number of attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Sets a fixed (or exponential base) delay.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.delay_fn = None;
        self
    }

    /// Sets a custom delay function.
    #[must_use]
    pub fn with_delay_fn<F>(mut self, delay: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.delay_fn = Some(Arc::new(delay));
        self
    }

    /// Enables or disables exponential backoff.
    #[must_use]
    pub fn with_exponential_backoff(mut self, enabled: bool) -> Self {
        self.config.use_exponential_backoff = enabled;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.config.jitter = jitter;
        self
    }

    /// Sets the retry predicate.
    #[must_use]
    pub fn with_should_retry<F>(mut self, should_retry: F) -> Self
    where
        F: Fn(&RetryContext<'_, E>) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(should_retry));
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    /// Delay after the failed attempt `attempt_index`.
    #[must_use]
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        match &self.delay_fn {
            Some(delay_fn) => delay_fn(attempt_index),
            None => self.config.calculate_delay(attempt_index),
        }
    }

    fn allows_retry(&self, context: &RetryContext<'_, E>) -> bool {
        self.should_retry
            .as_ref()
            .map_or(true, |should_retry| should_retry(context))
    }
}

/// Replays failed operations under a [`RetryOptions`] policy.
///
/// Holds no per-invocation state; one orchestrator can serve any number of
/// concurrent `retry` calls.
pub struct RetryOrchestrator<E> {
    options: RetryOptions<E>,
}

impl<E> Clone for RetryOrchestrator<E> {
    fn clone(&self) -> Self {
        Self {
            options: self.options.clone(),
        }
    }
}

impl<E> std::fmt::Debug for RetryOrchestrator<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOrchestrator")
            .field("options", &self.options)
            .finish()
    }
}

impl<E> Default for RetryOrchestrator<E> {
    fn default() -> Self {
        Self {
            options: RetryOptions::default(),
        }
    }
}

impl<E> RetryOrchestrator<E>
where
    E: From<CancellationError>,
{
    /// Creates an orchestrator for a policy.
    #[must_use]
    pub fn new(options: RetryOptions<E>) -> Self {
        Self { options }
    }

    /// The policy in use.
    #[must_use]
    pub fn options(&self) -> &RetryOptions<E> {
        &self.options
    }

    /// Runs `operation(attempt_index)` until it succeeds, the policy gives
    /// up, or the token fires.
    pub async fn retry<T, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.retry_with_report(operation).await.0
    }

    /// Like [`RetryOrchestrator::retry`], also returning what happened.
    pub async fn retry_with_report<T, F, Fut>(&self, mut operation: F) -> (Result<T, E>, RetryReport)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.options.config.effective_max_attempts();
        let token = self.options.cancellation_token.clone();
        let mut report = RetryReport::default();
        let mut attempt_index = 0;

        loop {
            report.final_state = RetryState::Attempting;
            if let Some(token) = token.as_ref().filter(|t| t.is_cancelled()) {
                return Self::aborted(token, report);
            }

            report.attempts += 1;
            let outcome = match &token {
                Some(token) => {
                    tokio::select! {
                        biased;
                        () = token.cancelled() => return Self::aborted(token, report),
                        outcome = operation(attempt_index) => outcome,
                    }
                }
                None => operation(attempt_index).await,
            };

            let error = match outcome {
                Ok(value) => {
                    report.final_state = RetryState::Succeeded;
                    debug!(attempts = report.attempts, "Retry succeeded");
                    return (Ok(value), report);
                }
                Err(error) => error,
            };

            let retries_left = max_attempts - attempt_index - 1;
            let retry_allowed = {
                let context = RetryContext {
                    attempt_index,
                    last_error: &error,
                    retries_left,
                };
                self.options.allows_retry(&context)
            };

            if !retry_allowed {
                report.final_state = RetryState::RejectedByPolicy;
                debug!(attempt = attempt_index, "Retry rejected by policy");
                return (Err(error), report);
            }
            if retries_left == 0 {
                report.final_state = RetryState::Exhausted;
                debug!(attempts = report.attempts, "Retries exhausted");
                return (Err(error), report);
            }

            let delay = self.options.delay_for(attempt_index);
            report.final_state = RetryState::Delaying;
            report.delays.push(delay);
            debug!(
                attempt = attempt_index,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Retrying after error"
            );

            match &token {
                Some(token) => {
                    tokio::select! {
                        biased;
                        () = token.cancelled() => return Self::aborted(token, report),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }

            attempt_index += 1;
        }
    }

    fn aborted<T>(token: &CancellationToken, mut report: RetryReport) -> (Result<T, E>, RetryReport) {
        report.final_state = RetryState::Aborted;
        debug!(attempts = report.attempts, "Retry aborted");
        (Err(cancellation_error(token).into()), report)
    }
}

impl<E> RetryOrchestrator<E>
where
    E: From<CancellationError> + Send + 'static,
{
    /// Wraps `operation` so every call applies this policy independently.
    pub fn make_retriable<A, T, F, Fut>(
        &self,
        operation: F,
    ) -> impl Fn(A) -> BoxFuture<'static, Result<T, E>> + Send + Sync
    where
        A: Clone + Send + Sync + 'static,
        T: Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let operation = Arc::new(operation);
        let options = self.options.clone();

        move |args: A| {
            let orchestrator = Self::new(options.clone());
            let operation = operation.clone();
            async move {
                orchestrator
                    .retry(move |_attempt| (*operation)(args.clone()))
                    .await
            }
            .boxed()
        }
    }
}

/// Runs `operation` under `options`.
pub async fn retry<T, E, F, Fut>(operation: F, options: RetryOptions<E>) -> Result<T, E>
where
    E: From<CancellationError>,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    RetryOrchestrator::new(options).retry(operation).await
}
