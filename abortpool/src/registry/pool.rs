//! Id-keyed registry of live cancellable operations.

use super::{OperationKey, Registration, RegistrationConfig, RegistryConfig};
use crate::cancellation::{CancelReason, CancellationSource, CancellationToken};
use crate::errors::DuplicateRegistrationError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Releases whatever an entry attached (timers, subscriptions).
pub(crate) type CleanupHook = Box<dyn FnOnce() + Send>;

struct RegistryEntry {
    source: CancellationSource,
    cleanup_hook: Option<CleanupHook>,
    config: RegistrationConfig,
}

pub(crate) struct RegistryState {
    pool_name: String,
    counter: AtomicU64,
    entries: Mutex<HashMap<String, RegistryEntry>>,
}

/// Central bookkeeping for cancellable operations identified by string ids.
///
/// Cloning yields another handle to the same registry. No user callback,
/// cleanup hook or token listener runs while the entry map is locked, so
/// callbacks may call back into the registry.
#[derive(Clone)]
pub struct CancellationRegistry {
    state: Arc<RegistryState>,
}

impl Default for CancellationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationRegistry {
    /// Creates a registry with the default pool name.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Creates a registry from a config.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            state: Arc::new(RegistryState {
                pool_name: config.pool_name,
                counter: AtomicU64::new(0),
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the pool name used for generated ids.
    #[must_use]
    pub fn pool_name(&self) -> &str {
        &self.state.pool_name
    }

    /// Returns `abort_id` if set, otherwise the next `{pool_name}-{counter}`.
    ///
    /// Does not check uniqueness.
    pub fn generate_id(&self, config: Option<&RegistrationConfig>) -> String {
        if let Some(id) = config.and_then(|c| c.abort_id.as_ref()) {
            return id.clone();
        }
        let counter = self.state.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}", self.state.pool_name, counter)
    }

    /// Registers an operation and returns its id and token.
    ///
    /// Fails if the id is already live; the existing entry is untouched.
    pub fn register(
        &self,
        config: RegistrationConfig,
    ) -> Result<Registration, DuplicateRegistrationError> {
        let id = self.generate_id(Some(&config));
        let source = CancellationSource::new();
        let token = source.token();

        {
            let mut entries = self.state.entries.lock();
            if entries.contains_key(&id) {
                return Err(DuplicateRegistrationError::new(id));
            }
            entries.insert(
                id.clone(),
                RegistryEntry {
                    source,
                    cleanup_hook: None,
                    config,
                },
            );
        }

        debug!(pool = %self.state.pool_name, id = %id, "Registered operation");
        Ok(Registration { id, token })
    }

    /// Removes an entry and runs its cleanup hook. No-op if absent.
    pub fn cleanup<'a>(&self, key: impl Into<OperationKey<'a>>) {
        let id = self.resolve_id(key.into());
        let removed = self.state.entries.lock().remove(&id);

        if let Some(entry) = removed {
            debug!(pool = %self.state.pool_name, id = %id, "Cleaned up operation");
            if let Some(hook) = entry.cleanup_hook {
                invoke_guarded("cleanup hook", &id, hook);
            }
        }
    }

    /// Cancels an operation, cleans it up, then invokes `on_aborted`.
    ///
    /// Returns false if no such entry exists.
    pub fn abort<'a>(&self, key: impl Into<OperationKey<'a>>) -> bool {
        let id = self.resolve_id(key.into());
        let (token, config) = {
            let entries = self.state.entries.lock();
            match entries.get(&id) {
                Some(entry) => (entry.source.token(), entry.config.clone()),
                None => return false,
            }
        };

        debug!(pool = %self.state.pool_name, id = %id, "Aborting operation");
        token.cancel(CancelReason::aborted(id.as_str()));
        self.cleanup(id.as_str());

        if let Some(callback) = &config.on_aborted {
            let stripped = config.without_callbacks();
            invoke_guarded("on_aborted callback", &id, || callback(&stripped));
        }
        true
    }

    /// Cancels and cleans up every entry without invoking `on_aborted`.
    pub fn abort_all(&self) {
        let drained: Vec<(String, RegistryEntry)> = {
            let mut entries = self.state.entries.lock();
            entries.drain().collect()
        };

        debug!(pool = %self.state.pool_name, count = drained.len(), "Aborting all operations");

        for (id, entry) in drained {
            if !entry.source.is_cancelled() {
                let source = &entry.source;
                invoke_guarded("cancel", &id, || {
                    source.cancel(CancelReason::aborted(id.as_str()));
                });
            }
            if let Some(hook) = entry.cleanup_hook {
                invoke_guarded("cleanup hook", &id, hook);
            }
        }
    }

    /// Registers, runs `factory`, and cleans up once the returned future
    /// settles, fails, panics or is dropped.
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
        run_guarded(self, registration, factory).await
    }

    /// Returns the token for a live id.
    #[must_use]
    pub fn get_token(&self, id: &str) -> Option<CancellationToken> {
        self.state
            .entries
            .lock()
            .get(id)
            .map(|entry| entry.source.token())
    }

    /// Returns true if `id` is live.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.state.entries.lock().contains_key(id)
    }

    /// Returns the live ids, in no particular order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.state.entries.lock().keys().cloned().collect()
    }

    /// Returns the number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.entries.lock().len()
    }

    /// Returns true if no entries are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.entries.lock().is_empty()
    }

    /// Chains `hook` onto the entry's cleanup hook.
    ///
    /// If the entry is already gone the hook is handed back so the caller can
    /// release its resources immediately.
    pub(crate) fn attach_cleanup(&self, id: &str, hook: CleanupHook) -> Result<(), CleanupHook> {
        let mut entries = self.state.entries.lock();
        let Some(entry) = entries.get_mut(id) else {
            return Err(hook);
        };
        entry.cleanup_hook = Some(match entry.cleanup_hook.take() {
            Some(existing) => Box::new(move || {
                existing();
                hook();
            }),
            None => hook,
        });
        Ok(())
    }

    pub(crate) fn downgrade(&self) -> Weak<RegistryState> {
        Arc::downgrade(&self.state)
    }

    pub(crate) fn upgrade(state: &Weak<RegistryState>) -> Option<Self> {
        state.upgrade().map(|state| Self { state })
    }

    fn resolve_id(&self, key: OperationKey<'_>) -> String {
        match key {
            OperationKey::Id(id) => id.to_string(),
            OperationKey::Config(config) => self.generate_id(Some(config)),
        }
    }
}

impl std::fmt::Debug for CancellationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationRegistry")
            .field("pool_name", &self.state.pool_name)
            .field("len", &self.len())
            .finish()
    }
}

/// Runs `factory` and cleans up `registration` on every exit path.
pub(crate) async fn run_guarded<F, Fut, T, E>(
    registry: &CancellationRegistry,
    registration: Registration,
    factory: F,
) -> Result<T, E>
where
    F: FnOnce(Registration) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    struct CleanupGuard<'r> {
        registry: &'r CancellationRegistry,
        id: String,
    }

    impl Drop for CleanupGuard<'_> {
        fn drop(&mut self) {
            self.registry.cleanup(self.id.as_str());
        }
    }

    let _guard = CleanupGuard {
        registry,
        id: registration.id.clone(),
    };
    factory(registration).await
}

pub(crate) fn invoke_guarded<F: FnOnce()>(what: &str, id: &str, f: F) {
    if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        warn!(id = %id, "{} panicked: {:?}", what, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CallbackRecorder;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_generate_id_uses_abort_id() {
        let registry = CancellationRegistry::new();
        let config = RegistrationConfig::new().with_abort_id("custom");
        assert_eq!(registry.generate_id(Some(&config)), "custom");
        assert_eq!(registry.generate_id(Some(&config)), "custom");
    }

    #[test]
    fn test_generate_id_counter_increases() {
        let registry = CancellationRegistry::with_config(RegistryConfig::new().with_pool_name("fetch"));
        assert_eq!(registry.generate_id(None), "fetch-1");
        assert_eq!(registry.generate_id(None), "fetch-2");
        assert_eq!(registry.generate_id(Some(&RegistrationConfig::new())), "fetch-3");
    }

    #[test]
    fn test_registries_do_not_share_counters() {
        let a = CancellationRegistry::new();
        let b = CancellationRegistry::new();
        assert_eq!(a.generate_id(None), "pool-1");
        assert_eq!(b.generate_id(None), "pool-1");
    }

    #[test]
    fn test_register_returns_live_token() {
        let registry = CancellationRegistry::new();
        let registration = registry.register(RegistrationConfig::new()).unwrap();

        assert_eq!(registration.id, "pool-1");
        assert!(!registration.token.is_cancelled());
        assert!(registry.contains("pool-1"));
        assert!(registry.get_token("pool-1").unwrap().ptr_eq(&registration.token));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = CancellationRegistry::new();
        let config = RegistrationConfig::new().with_abort_id("dup");

        let first = registry.register(config.clone()).unwrap();
        let err = registry.register(config).unwrap_err();
        assert_eq!(err, DuplicateRegistrationError::new("dup"));

        // First registration still valid and abortable.
        assert!(registry.abort("dup"));
        assert!(first.token.is_cancelled());
    }

    #[test]
    fn test_abort_unknown_returns_false() {
        let registry = CancellationRegistry::new();
        assert!(!registry.abort("missing"));
    }

    #[test]
    fn test_abort_cancels_and_calls_back_once() {
        let registry = CancellationRegistry::new();
        let recorder = CallbackRecorder::new();

        let config = RegistrationConfig::new()
            .with_abort_id("op")
            .with_abort_timeout(std::time::Duration::from_secs(5))
            .with_on_aborted(recorder.callback());
        let registration = registry.register(config).unwrap();

        assert!(registry.abort("op"));
        assert!(registration.token.is_cancelled());
        assert_eq!(registration.token.reason(), Some(CancelReason::aborted("op")));
        assert_eq!(recorder.count(), 1);

        let seen = recorder.last().unwrap();
        assert_eq!(seen.abort_id.as_deref(), Some("op"));
        assert_eq!(seen.abort_timeout, Some(std::time::Duration::from_secs(5)));
        assert!(seen.on_aborted.is_none());

        assert!(!registry.abort("op"));
        registry.cleanup("op");
        assert_eq!(recorder.count(), 1);
    }

    #[test]
    fn test_cleanup_then_abort_returns_false() {
        let registry = CancellationRegistry::new();
        let registration = registry.register(RegistrationConfig::new()).unwrap();

        registry.cleanup(&registration.id);
        assert!(!registry.abort(&registration.id));
        assert!(!registration.token.is_cancelled());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cleanup_by_config() {
        let registry = CancellationRegistry::new();
        let config = RegistrationConfig::new().with_abort_id("by-config");
        registry.register(config.clone()).unwrap();

        registry.cleanup(&config);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cleanup_missing_is_noop() {
        let registry = CancellationRegistry::new();
        registry.cleanup("nothing");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reentrant_abort_from_callback() {
        let registry = CancellationRegistry::new();
        let reentrant = registry.clone();
        let observed = Arc::new(Mutex::new(None));
        let observed_clone = observed.clone();

        let config = RegistrationConfig::new()
            .with_abort_id("op")
            .with_on_aborted(move |_| {
                *observed_clone.lock() = Some((reentrant.contains("op"), reentrant.abort("op")));
            });
        registry.register(config).unwrap();

        assert!(registry.abort("op"));
        assert_eq!(*observed.lock(), Some((false, false)));
    }

    #[test]
    fn test_abort_callback_panic_suppressed() {
        let registry = CancellationRegistry::new();
        let config = RegistrationConfig::new()
            .with_abort_id("op")
            .with_on_aborted(|_| panic!("Intentional"));
        registry.register(config).unwrap();

        assert!(registry.abort("op"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cleanup_hook_runs_after_removal() {
        let registry = CancellationRegistry::new();
        registry
            .register(RegistrationConfig::new().with_abort_id("op"))
            .unwrap();

        let inspector = registry.clone();
        let seen_live = Arc::new(Mutex::new(None));
        let seen_clone = seen_live.clone();
        registry
            .attach_cleanup(
                "op",
                Box::new(move || *seen_clone.lock() = Some(inspector.contains("op"))),
            )
            .unwrap_or_else(|_| panic!("entry should exist"));

        registry.cleanup("op");
        assert_eq!(*seen_live.lock(), Some(false));
    }

    #[test]
    fn test_attach_cleanup_to_missing_entry_hands_hook_back() {
        let registry = CancellationRegistry::new();
        let result = registry.attach_cleanup("gone", Box::new(|| {}));
        assert!(result.is_err());
    }

    #[test]
    fn test_abort_all() {
        let registry = CancellationRegistry::new();
        let recorder = CallbackRecorder::new();
        let hooks = Arc::new(AtomicUsize::new(0));

        let tokens: Vec<_> = (0..5)
            .map(|_| {
                let registration = registry
                    .register(RegistrationConfig::new().with_on_aborted(recorder.callback()))
                    .unwrap();
                let hooks = hooks.clone();
                registry
                    .attach_cleanup(
                        &registration.id,
                        Box::new(move || {
                            hooks.fetch_add(1, Ordering::SeqCst);
                        }),
                    )
                    .unwrap_or_else(|_| panic!("entry should exist"));
                registration.token
            })
            .collect();

        registry.abort_all();

        assert!(registry.is_empty());
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
        assert_eq!(hooks.load(Ordering::SeqCst), 5);
        assert_eq!(recorder.count(), 0);
    }

    #[test]
    fn test_abort_all_with_panicking_hook() {
        let registry = CancellationRegistry::new();
        let first = registry.register(RegistrationConfig::new()).unwrap();
        let second = registry.register(RegistrationConfig::new()).unwrap();
        registry
            .attach_cleanup(&first.id, Box::new(|| panic!("Intentional")))
            .unwrap_or_else(|_| panic!("entry should exist"));

        registry.abort_all();

        assert!(first.token.is_cancelled());
        assert!(second.token.is_cancelled());
    }

    #[tokio::test]
    async fn test_auto_cleanup_on_success() {
        let registry = CancellationRegistry::new();
        let inner = registry.clone();

        let result: Result<usize, crate::errors::AbortPoolError> = registry
            .auto_cleanup(
                |registration| async move {
                    assert!(inner.contains(&registration.id));
                    Ok(inner.len())
                },
                RegistrationConfig::new(),
            )
            .await;

        assert_eq!(result.unwrap(), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_auto_cleanup_on_failure() {
        let registry = CancellationRegistry::new();

        let result: Result<(), crate::errors::AbortPoolError> = registry
            .auto_cleanup(
                |registration| async move {
                    Err(crate::errors::CancellationError::from(CancelReason::aborted(registration.id)).into())
                },
                RegistrationConfig::new(),
            )
            .await;

        assert!(result.is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_auto_cleanup_when_factory_panics() {
        let registry = CancellationRegistry::new();
        let handle = registry.clone();

        let joined = tokio::spawn(async move {
            let _: Result<(), crate::errors::AbortPoolError> = handle
                .auto_cleanup(
                    |_registration| -> std::future::Ready<Result<(), crate::errors::AbortPoolError>> {
                        panic!("factory failed before producing a future")
                    },
                    RegistrationConfig::new(),
                )
                .await;
        })
        .await;

        assert!(joined.is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_auto_cleanup_duplicate_propagates() {
        let registry = CancellationRegistry::new();
        registry
            .register(RegistrationConfig::new().with_abort_id("busy"))
            .unwrap();

        let result: Result<(), crate::errors::AbortPoolError> = registry
            .auto_cleanup(|_| async { Ok(()) }, RegistrationConfig::new().with_abort_id("busy"))
            .await;

        assert!(matches!(
            result,
            Err(crate::errors::AbortPoolError::DuplicateRegistration(_))
        ));
        // The live entry is left alone.
        assert!(registry.contains("busy"));
    }
}
