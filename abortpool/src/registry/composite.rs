//! Registry layering timeouts and external tokens over the base pool.

use super::pool::{invoke_guarded, run_guarded, CleanupHook};
use super::{CancellationRegistry, OperationKey, Registration, RegistrationConfig, RegistryConfig};
use crate::cancellation::{CancelReason, CancellationToken, CompositeToken, TimerToken};
use crate::errors::DuplicateRegistrationError;
use std::future::Future;
use tracing::debug;

/// A [`CancellationRegistry`] whose operations may also be cancelled by a
/// timeout or by a caller-owned token.
///
/// Propagation is one-directional: the timeout, the external token and a pool
/// `abort` all cancel the operation, but nothing the pool does ever cancels
/// the external token. A single `cleanup` releases the timer, the composite
/// token and the registry's own listener.
#[derive(Clone, Default)]
pub struct CompositeCancellationRegistry {
    base: CancellationRegistry,
}

impl CompositeCancellationRegistry {
    /// Creates a registry with the default pool name.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry from a config.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            base: CancellationRegistry::with_config(config),
        }
    }

    /// The underlying pool.
    #[must_use]
    pub fn base(&self) -> &CancellationRegistry {
        &self.base
    }

    /// Registers an operation whose token also fires on timeout or when
    /// `external_token` fires.
    ///
    /// If `external_token` is already cancelled the entry is torn down before
    /// this returns; the returned token is then already cancelled.
    pub fn register(
        &self,
        config: RegistrationConfig,
    ) -> Result<Registration, DuplicateRegistrationError> {
        let Registration {
            id,
            token: pool_token,
        } = self.base.register(config.clone())?;

        let mut candidates = vec![pool_token.clone()];

        let timer = config
            .abort_timeout
            .filter(|timeout| !timeout.is_zero())
            .map(TimerToken::new);
        if let Some(timer) = &timer {
            candidates.push(timer.token());
        }

        if let Some(external) = &config.external_token {
            candidates.push(external.clone());
        }

        if candidates.len() == 1 {
            return Ok(Registration {
                id,
                token: pool_token,
            });
        }

        let composite = CompositeToken::from_tokens(candidates);
        let combined = composite.token();

        let listener = self.fire_listener(&id, &config);
        let subscription = combined.subscribe(listener);

        let hook: CleanupHook = Box::new(move || {
            if let Some(timer) = timer {
                timer.release();
            }
            subscription.unsubscribe();
            composite.release();
        });

        // The listener may already have torn the entry down.
        if let Err(hook) = self.base.attach_cleanup(&id, hook) {
            invoke_guarded("cleanup hook", &id, hook);
        }

        if config
            .external_token
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            self.base.cleanup(id.as_str());
        }

        Ok(Registration { id, token: combined })
    }

    fn fire_listener(
        &self,
        id: &str,
        config: &RegistrationConfig,
    ) -> impl FnOnce(&CancelReason) + Send + 'static {
        let registry = self.base.downgrade();
        let id = id.to_string();
        let on_timeout = config.on_aborted_timeout.clone();
        let stripped = config.without_callbacks();

        move |reason: &CancelReason| {
            let Some(registry) = CancellationRegistry::upgrade(&registry) else {
                return;
            };
            if !registry.contains(&id) {
                return;
            }
            if reason.is_timeout() {
                debug!(id = %id, "Operation timed out");
                if let Some(callback) = on_timeout {
                    invoke_guarded("on_aborted_timeout callback", &id, || callback(&stripped));
                }
            }
            registry.cleanup(id.as_str());
        }
    }

    /// See [`CancellationRegistry::cleanup`].
    pub fn cleanup<'a>(&self, key: impl Into<OperationKey<'a>>) {
        self.base.cleanup(key);
    }

    /// See [`CancellationRegistry::abort`]. Never cancels the external token.
    pub fn abort<'a>(&self, key: impl Into<OperationKey<'a>>) -> bool {
        self.base.abort(key)
    }

    /// See [`CancellationRegistry::abort_all`].
    pub fn abort_all(&self) {
        self.base.abort_all();
    }

    /// Returns the pool-owned token for a live id.
    ///
    /// This is the pool's constituent, not the merged token `register`
    /// returned.
    #[must_use]
    pub fn get_token(&self, id: &str) -> Option<CancellationToken> {
        self.base.get_token(id)
    }

    /// Like [`CancellationRegistry::auto_cleanup`], registering through the
    /// composite path.
    pub async fn auto_cleanup<F, Fut, T, E>(
        &self,
        factory: F,
        config: RegistrationConfig,
    ) -> Result<T, E>
    where
        F: FnOnce(Registration) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DuplicateRegistrationError>,
    {
        let registration = self.register(config)?;
        run_guarded(&self.base, registration, factory).await
    }

    /// Returns the number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.base.len()
    }

    /// Returns true if no entries are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.base.is_empty()
    }

    /// Returns true if `id` is live.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.base.contains(id)
    }
}

impl std::fmt::Debug for CompositeCancellationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeCancellationRegistry")
            .field("base", &self.base)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationSource;
    use crate::testing::CallbackRecorder;
    use std::time::Duration;

    async fn alive_tasks() -> usize {
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        tokio::runtime::Handle::current().metrics().num_alive_tasks()
    }

    #[test]
    fn test_plain_registration_uses_pool_token() {
        let registry = CompositeCancellationRegistry::new();
        let registration = registry.register(RegistrationConfig::new()).unwrap();

        let pool_token = registry.get_token(&registration.id).unwrap();
        assert!(registration.token.ptr_eq(&pool_token));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = CompositeCancellationRegistry::new();
        let config = RegistrationConfig::new().with_abort_id("dup");
        registry.register(config.clone()).unwrap();
        assert!(registry.register(config).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_already_cancelled_external_token() {
        let registry = CompositeCancellationRegistry::new();
        let external = CancellationSource::new();
        external.cancel(CancelReason::requested("caller gave up"));

        let registration = registry
            .register(RegistrationConfig::new().with_external_token(external.token()))
            .unwrap();

        assert!(registry.is_empty());
        assert!(registration.token.is_cancelled());
        assert_eq!(
            registration.token.reason(),
            Some(CancelReason::requested("caller gave up"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_external_with_timeout_leaves_no_timer() {
        let registry = CompositeCancellationRegistry::new();
        let external = CancellationSource::new();
        external.cancel(CancelReason::requested("early"));
        let recorder = CallbackRecorder::new();

        let registration = registry
            .register(
                RegistrationConfig::new()
                    .with_abort_timeout(Duration::from_millis(10))
                    .with_on_aborted_timeout(recorder.callback())
                    .with_external_token(external.token()),
            )
            .unwrap();

        assert!(registry.is_empty());

        // The timer task was aborted before its 10ms could elapse.
        assert_eq!(alive_tasks().await, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.count(), 0);
        assert_eq!(
            registration.token.reason(),
            Some(CancelReason::requested("early"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_task_lives_until_cleanup() {
        let registry = CompositeCancellationRegistry::new();

        let registration = registry
            .register(RegistrationConfig::new().with_abort_timeout(Duration::from_secs(60)))
            .unwrap();
        assert_eq!(alive_tasks().await, 1);

        registry.cleanup(&registration.id);
        assert_eq!(alive_tasks().await, 0);
        assert!(!registration.token.is_cancelled());
    }

    #[test]
    fn test_abort_never_reaches_external_token() {
        let registry = CompositeCancellationRegistry::new();
        let external = CancellationSource::new();
        let aborted = CallbackRecorder::new();

        let registration = registry
            .register(
                RegistrationConfig::new()
                    .with_abort_id("op")
                    .with_on_aborted(aborted.callback())
                    .with_external_token(external.token()),
            )
            .unwrap();

        assert!(registry.abort("op"));

        assert!(registration.token.is_cancelled());
        assert_eq!(registration.token.reason(), Some(CancelReason::aborted("op")));
        assert!(!external.token().is_cancelled());
        assert_eq!(aborted.count(), 1);
        assert!(registry.is_empty());
        // Composite detached from the external token.
        assert_eq!(external.token().listener_count(), 0);
    }

    #[test]
    fn test_external_token_cancels_operation() {
        let registry = CompositeCancellationRegistry::new();
        let external = CancellationSource::new();
        let aborted = CallbackRecorder::new();

        let registration = registry
            .register(
                RegistrationConfig::new()
                    .with_on_aborted(aborted.callback())
                    .with_external_token(external.token()),
            )
            .unwrap();

        external.cancel(CancelReason::requested("navigation"));

        assert!(registration.token.is_cancelled());
        assert!(registry.is_empty());
        assert_eq!(aborted.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_only_timeout_callback() {
        let registry = CompositeCancellationRegistry::new();
        let aborted = CallbackRecorder::new();
        let timed_out = CallbackRecorder::new();

        let registration = registry
            .register(
                RegistrationConfig::new()
                    .with_abort_id("slow")
                    .with_abort_timeout(Duration::from_millis(100))
                    .with_on_aborted(aborted.callback())
                    .with_on_aborted_timeout(timed_out.callback()),
            )
            .unwrap();

        registration.token.cancelled().await;

        assert!(registration.token.reason().is_some_and(|r| r.is_timeout()));
        assert_eq!(timed_out.count(), 1);
        assert_eq!(aborted.count(), 0);
        assert!(!registry.contains("slow"));
        assert!(timed_out.last().unwrap().on_aborted_timeout.is_none());

        // Abort after the timeout is a no-op.
        assert!(!registry.abort("slow"));
        assert_eq!(aborted.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_before_timeout_releases_timer() {
        let registry = CompositeCancellationRegistry::new();
        let timed_out = CallbackRecorder::new();

        let registration = registry
            .register(
                RegistrationConfig::new()
                    .with_abort_id("op")
                    .with_abort_timeout(Duration::from_millis(100))
                    .with_on_aborted_timeout(timed_out.callback()),
            )
            .unwrap();

        assert!(registry.abort("op"));
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(registration.token.reason(), Some(CancelReason::aborted("op")));
        assert_eq!(timed_out.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_releases_everything() {
        let registry = CompositeCancellationRegistry::new();
        let external = CancellationSource::new();
        let timed_out = CallbackRecorder::new();

        let registration = registry
            .register(
                RegistrationConfig::new()
                    .with_abort_timeout(Duration::from_millis(100))
                    .with_on_aborted_timeout(timed_out.callback())
                    .with_external_token(external.token()),
            )
            .unwrap();

        registry.cleanup(&registration.id);
        assert_eq!(external.token().listener_count(), 0);
        assert_eq!(registration.token.listener_count(), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!registration.token.is_cancelled());
        assert_eq!(timed_out.count(), 0);
    }

    #[test]
    fn test_abort_all_skips_callbacks() {
        let registry = CompositeCancellationRegistry::new();
        let external = CancellationSource::new();
        let aborted = CallbackRecorder::new();

        let tokens: Vec<_> = (0..3)
            .map(|_| {
                registry
                    .register(
                        RegistrationConfig::new()
                            .with_on_aborted(aborted.callback())
                            .with_external_token(external.token()),
                    )
                    .unwrap()
                    .token
            })
            .collect();

        registry.abort_all();

        assert!(registry.is_empty());
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
        assert_eq!(aborted.count(), 0);
        assert!(!external.token().is_cancelled());
        assert_eq!(external.token().listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_cleanup_uses_combined_token() {
        let registry = CompositeCancellationRegistry::new();

        let result: Result<bool, crate::errors::AbortPoolError> = registry
            .auto_cleanup(
                |registration| async move {
                    registration.token.cancelled().await;
                    Ok(registration.token.reason().is_some_and(|r| r.is_timeout()))
                },
                RegistrationConfig::new().with_abort_timeout(Duration::from_millis(20)),
            )
            .await;

        assert!(result.unwrap());
        assert!(registry.is_empty());
    }
}
