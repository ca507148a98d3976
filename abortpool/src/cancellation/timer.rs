//! Tokens that fire after a fixed delay.

use super::{CancelReason, CancellationSource, CancellationToken};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Longest delay a timer token will wait (2^31 - 1 milliseconds).
pub const MAX_TIMER_DELAY: Duration = Duration::from_millis(i32::MAX as u64);

/// A token that fires automatically once its duration elapses.
///
/// Must be created inside a Tokio runtime; otherwise the token never fires.
pub struct TimerToken {
    token: CancellationToken,
    duration: Duration,
    handle: Mutex<Option<AbortHandle>>,
}

impl TimerToken {
    /// Creates a timer token, clamping `duration` to [`MAX_TIMER_DELAY`].
    ///
    /// A zero duration fires on the next scheduler turn.
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        let duration = clamp_delay(duration);
        let source = CancellationSource::new();
        let token = source.token();

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let task = runtime.spawn(async move {
                    if duration.is_zero() {
                        tokio::task::yield_now().await;
                    } else {
                        tokio::time::sleep(duration).await;
                    }
                    debug!(duration_ms = duration.as_millis() as u64, "Timer token fired");
                    source.cancel(CancelReason::timeout(duration));
                });
                Some(task.abort_handle())
            }
            Err(_) => {
                warn!("TimerToken created outside a Tokio runtime; it will never fire");
                None
            }
        };

        Self {
            token,
            duration,
            handle: Mutex::new(handle),
        }
    }

    /// Creates a timer token from a millisecond count.
    ///
    /// Non-finite, negative or overflowing values use [`MAX_TIMER_DELAY`].
    #[must_use]
    pub fn from_millis(millis: f64) -> Self {
        Self::new(delay_from_millis(millis))
    }

    /// Returns the token that fires on expiry.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// The effective, clamped delay.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Stops the pending fire. Safe to call repeatedly or after firing.
    pub fn release(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }

    /// Returns true while the timer can still fire.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.token.is_cancelled()
            && self
                .handle
                .lock()
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }
}

impl std::fmt::Debug for TimerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerToken")
            .field("duration", &self.duration)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

fn clamp_delay(duration: Duration) -> Duration {
    duration.min(MAX_TIMER_DELAY)
}

fn delay_from_millis(millis: f64) -> Duration {
    #[allow(clippy::cast_precision_loss)]
    let max = MAX_TIMER_DELAY.as_millis() as f64;
    if !millis.is_finite() || millis < 0.0 || millis > max {
        return MAX_TIMER_DELAY;
    }
    Duration::from_secs_f64(millis / 1000.0)
}
