//! Retry orchestration with backoff and cancellation.
//!
//! This module provides:
//! - RetryConfig, the serializable policy (attempts, backoff, jitter)
//! - RetryOptions, which adds a custom delay, a retry predicate and a token
//! - RetryOrchestrator, which runs and replays operations under a policy

mod config;
mod orchestrator;

pub use config::{JitterStrategy, RetryConfig, MAX_ATTEMPTS, MIN_ATTEMPTS};
pub use orchestrator::{
    retry, DelayFn, RetryContext, RetryOptions, RetryOrchestrator, RetryReport, RetryState,
    ShouldRetryFn,
};
