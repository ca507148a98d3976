//! # Abortpool
//!
//! Cancellation and retry coordination for many concurrent logical operations.
//!
//! Abortpool provides:
//!
//! - **Cancellation tokens**: observable, one-shot tokens with ordered listeners
//! - **Timer and composite tokens**: fire after a delay, or with the first of several tokens
//! - **Registries**: id-keyed pools issuing tokens, with idempotent abort and cleanup
//! - **Composite registries**: timeouts and caller-owned tokens merged without leaking listeners
//! - **Retry orchestration**: fixed or exponential backoff that stays cancellable
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use abortpool::prelude::*;
//! use std::time::Duration;
//!
//! let registry = CompositeCancellationRegistry::new();
//!
//! let body = registry
//!     .auto_cleanup(
//!         |registration| fetch(url).with_cancellation(&registration.token),
//!         RegistrationConfig::new().with_abort_timeout(Duration::from_secs(5)),
//!     )
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod errors;
pub mod registry;
pub mod retry;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{
        CancelReason, CancellationExt, CancellationSource, CancellationToken, CompositeToken,
        Subscription, TimerToken,
    };
    pub use crate::errors::{AbortPoolError, CancellationError, DuplicateRegistrationError};
    pub use crate::registry::{
        CancellationPool, CancellationRegistry, CompositeCancellationRegistry, OperationKey,
        Registration, RegistrationConfig, RegistryConfig,
    };
    pub use crate::retry::{
        retry, JitterStrategy, RetryConfig, RetryContext, RetryOptions, RetryOrchestrator,
        RetryReport, RetryState,
    };
}
