//! Cancellation token and source for cooperative cancellation.

use super::CancelReason;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::warn;

/// A listener invoked once when a token fires.
pub type CancelListener = Box<dyn FnOnce(&CancelReason) + Send>;

#[derive(Default)]
struct TokenState {
    /// Whether cancellation has been requested.
    cancelled: AtomicBool,
    /// The reason for cancellation (first one wins).
    reason: RwLock<Option<CancelReason>>,
    /// Pending listeners, in subscription order.
    listeners: Mutex<Vec<(u64, CancelListener)>>,
    next_listener_id: AtomicU64,
    /// Wakes `cancelled()` futures.
    notify: Notify,
}

/// Read-only handle observing whether an operation was cancelled, and why.
///
/// Cloning is cheap; all clones observe the same state. A token only ever
/// moves from "not cancelled" to "cancelled".
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    /// Creates a token that nothing can cancel.
    #[must_use]
    pub fn never() -> Self {
        Self::default()
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        self.state.reason.read().clone()
    }

    /// Returns true if both handles refer to the same token.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Registers a listener to be invoked when the token fires.
    ///
    /// If the token is already cancelled, the listener runs immediately and
    /// the returned subscription is inert.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: FnOnce(&CancelReason) + Send + 'static,
    {
        {
            let mut listeners = self.state.listeners.lock();
            // Checked under the listener lock so a concurrent `cancel` either
            // sees this listener or we see its reason.
            if !self.is_cancelled() {
                let id = self.state.next_listener_id.fetch_add(1, Ordering::Relaxed);
                listeners.push((id, Box::new(listener)));
                return Subscription {
                    state: Arc::downgrade(&self.state),
                    id,
                    released: AtomicBool::new(false),
                };
            }
        }

        if let Some(reason) = self.reason() {
            invoke_listener(Box::new(listener), &reason);
        }
        Subscription::inert()
    }

    /// Waits until the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Requests cancellation.
    ///
    /// Only the first call records a reason and notifies listeners; later
    /// calls return false.
    pub(crate) fn cancel(&self, reason: CancelReason) -> bool {
        let listeners = {
            let mut listeners = self.state.listeners.lock();
            if self
                .state
                .cancelled
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return false;
            }
            *self.state.reason.write() = Some(reason.clone());
            std::mem::take(&mut *listeners)
        };

        self.state.notify.notify_waiters();

        for (_, listener) in listeners {
            invoke_listener(listener, &reason);
        }
        true
    }

    /// Number of listeners still waiting for this token.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.state.listeners.lock().len()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

fn invoke_listener(listener: CancelListener, reason: &CancelReason) {
    if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        listener(reason);
    })) {
        warn!("Cancellation listener panicked: {:?}", e);
    }
}

/// Handle detaching a listener from its token.
///
/// Dropping a subscription leaves the listener attached.
#[derive(Debug)]
pub struct Subscription {
    state: Weak<TokenState>,
    id: u64,
    released: AtomicBool,
}

impl Subscription {
    fn inert() -> Self {
        Self {
            state: Weak::new(),
            id: 0,
            released: AtomicBool::new(true),
        }
    }

    /// Removes the listener if it has not fired yet. Idempotent.
    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(state) = self.state.upgrade() {
            // Dropped outside the lock; a listener may own other tokens.
            let removed = {
                let mut listeners = state.listeners.lock();
                listeners
                    .iter()
                    .position(|(id, _)| *id == self.id)
                    .map(|index| listeners.remove(index))
            };
            drop(removed);
        }
    }

    /// Returns true once the subscription was released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// The side of a token that can trigger cancellation.
#[derive(Default)]
pub struct CancellationSource {
    token: CancellationToken,
}

impl CancellationSource {
    /// Creates a new source with a fresh token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handle to the owned token.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancels the token. Returns false if it was already cancelled.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.token.cancel(reason)
    }

    /// Returns whether the token was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl std::fmt::Debug for CancellationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationSource")
            .field("token", &self.token)
            .finish()
    }
}
