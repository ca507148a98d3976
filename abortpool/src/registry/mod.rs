//! Registries of cancellable operations.
//!
//! This module provides:
//! - CancellationRegistry, the id-keyed pool of live operations
//! - CompositeCancellationRegistry, which adds timeouts and external tokens
//! - CancellationPool, the object-safe surface both registries share

mod composite;
mod config;
mod pool;

pub use composite::CompositeCancellationRegistry;
pub use config::{AbortCallback, OperationKey, Registration, RegistrationConfig, RegistryConfig};
pub use pool::CancellationRegistry;

use crate::cancellation::CancellationToken;
use crate::errors::DuplicateRegistrationError;

/// The operations collaborators need from a registry.
///
/// Lets store layers and I/O wrappers hold `&dyn CancellationPool` without
/// caring whether timeouts and external tokens are supported.
pub trait CancellationPool: Send + Sync {
    /// Registers an operation.
    fn register(&self, config: RegistrationConfig)
        -> Result<Registration, DuplicateRegistrationError>;

    /// Removes an entry and runs its cleanup hook.
    fn cleanup(&self, key: OperationKey<'_>);

    /// Cancels and cleans up an entry; false if it was not live.
    fn abort(&self, key: OperationKey<'_>) -> bool;

    /// Cancels and cleans up every entry.
    fn abort_all(&self);

    /// Returns the pool token for a live id.
    fn get_token(&self, id: &str) -> Option<CancellationToken>;
}

impl CancellationPool for CancellationRegistry {
    fn register(
        &self,
        config: RegistrationConfig,
    ) -> Result<Registration, DuplicateRegistrationError> {
        Self::register(self, config)
    }

    fn cleanup(&self, key: OperationKey<'_>) {
        Self::cleanup(self, key);
    }

    fn abort(&self, key: OperationKey<'_>) -> bool {
        Self::abort(self, key)
    }

    fn abort_all(&self) {
        Self::abort_all(self);
    }

    fn get_token(&self, id: &str) -> Option<CancellationToken> {
        Self::get_token(self, id)
    }
}

impl CancellationPool for CompositeCancellationRegistry {
    fn register(
        &self,
        config: RegistrationConfig,
    ) -> Result<Registration, DuplicateRegistrationError> {
        Self::register(self, config)
    }

    fn cleanup(&self, key: OperationKey<'_>) {
        Self::cleanup(self, key);
    }

    fn abort(&self, key: OperationKey<'_>) -> bool {
        Self::abort(self, key)
    }

    fn abort_all(&self) {
        Self::abort_all(self);
    }

    fn get_token(&self, id: &str) -> Option<CancellationToken> {
        Self::get_token(self, id)
    }
}
