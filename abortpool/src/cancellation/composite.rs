//! Tokens merging several constituents into one.

use super::{CancellationSource, CancellationToken, Subscription};
use parking_lot::Mutex;
use std::sync::Arc;

/// A token that fires when the first of its constituents fires.
///
/// The composite carries the cause of the constituent that fired. Once it
/// fires, or once [`CompositeToken::release`] is called, every subscription on
/// the constituents is dropped.
pub struct CompositeToken {
    token: CancellationToken,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
}

impl CompositeToken {
    /// Merges the given tokens; absent entries are ignored.
    ///
    /// With no constituents the composite never fires.
    pub fn new<I>(tokens: I) -> Self
    where
        I: IntoIterator<Item = Option<CancellationToken>>,
    {
        let constituents: Vec<CancellationToken> = tokens.into_iter().flatten().collect();
        let source = Arc::new(CancellationSource::new());
        let token = source.token();
        let subscriptions = Arc::new(Mutex::new(Vec::with_capacity(constituents.len())));

        let composite = Self {
            token,
            subscriptions,
        };

        if let Some(reason) = constituents.iter().find_map(CancellationToken::reason) {
            source.cancel(reason);
            return composite;
        }

        for constituent in &constituents {
            let source = source.clone();
            let subscriptions = composite.subscriptions.clone();
            let subscription = constituent.subscribe(move |reason| {
                source.cancel(reason.clone());
                release_all(&subscriptions);
            });
            composite.subscriptions.lock().push(subscription);

            // A constituent may fire between subscriptions.
            if composite.token.is_cancelled() {
                composite.release();
                break;
            }
        }

        composite
    }

    /// Merges a list of tokens that are all present.
    pub fn from_tokens<I>(tokens: I) -> Self
    where
        I: IntoIterator<Item = CancellationToken>,
    {
        Self::new(tokens.into_iter().map(Some))
    }

    /// Returns the merged token.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Detaches from every constituent. Idempotent.
    pub fn release(&self) {
        release_all(&self.subscriptions);
    }

    /// Number of constituents still observed.
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.lock().len()
    }
}

impl std::fmt::Debug for CompositeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeToken")
            .field("token", &self.token)
            .field("active_subscriptions", &self.active_subscriptions())
            .finish()
    }
}

fn release_all(subscriptions: &Mutex<Vec<Subscription>>) {
    let taken = std::mem::take(&mut *subscriptions.lock());
    for subscription in taken {
        subscription.unsubscribe();
    }
}
