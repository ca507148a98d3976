//! Cancellation primitives.
//!
//! This module provides:
//! - CancellationToken / CancellationSource for cooperative cancellation
//! - TimerToken, which fires after a delay
//! - CompositeToken, which fires with the first of several tokens
//! - CancellationExt for racing futures against a token

mod composite;
mod ext;
mod reason;
mod timer;
mod token;

pub use composite::CompositeToken;
pub use ext::CancellationExt;
pub(crate) use ext::cancellation_error;
pub use reason::CancelReason;
pub use timer::{TimerToken, MAX_TIMER_DELAY};
pub use token::{CancelListener, CancellationSource, CancellationToken, Subscription};
