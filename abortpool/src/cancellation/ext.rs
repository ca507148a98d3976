//! Racing futures against a cancellation token.

use super::CancellationToken;
use crate::errors::CancellationError;
use crate::registry::Registration;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;

/// Extension trait adding cancellation to any fallible future.
///
/// The future resolves to its own result, or to a [`CancellationError`]
/// converted into `E` as soon as the token fires. The inner future is dropped
/// on cancellation.
pub trait CancellationExt: Future + Sized {
    /// Races `self` against `token`.
    fn with_cancellation<'a, T, E>(self, token: &CancellationToken) -> BoxFuture<'a, Result<T, E>>
    where
        Self: Future<Output = Result<T, E>> + Send + 'a,
        T: Send + 'a,
        E: From<CancellationError> + Send + 'a;

    /// Races `self` against a registration's token, tagging any
    /// cancellation error with the registration id.
    fn with_registration<'a, T, E>(self, registration: &Registration) -> BoxFuture<'a, Result<T, E>>
    where
        Self: Future<Output = Result<T, E>> + Send + 'a,
        T: Send + 'a,
        E: From<CancellationError> + Send + 'a;
}

impl<F> CancellationExt for F
where
    F: Future,
{
    fn with_cancellation<'a, T, E>(self, token: &CancellationToken) -> BoxFuture<'a, Result<T, E>>
    where
        Self: Future<Output = Result<T, E>> + Send + 'a,
        T: Send + 'a,
        E: From<CancellationError> + Send + 'a,
    {
        race(self, token.clone(), None)
    }

    fn with_registration<'a, T, E>(self, registration: &Registration) -> BoxFuture<'a, Result<T, E>>
    where
        Self: Future<Output = Result<T, E>> + Send + 'a,
        T: Send + 'a,
        E: From<CancellationError> + Send + 'a,
    {
        race(self, registration.token.clone(), Some(registration.id.clone()))
    }
}

fn race<'a, F, T, E>(
    future: F,
    token: CancellationToken,
    operation_id: Option<String>,
) -> BoxFuture<'a, Result<T, E>>
where
    F: Future<Output = Result<T, E>> + Send + 'a,
    T: Send + 'a,
    E: From<CancellationError> + Send + 'a,
{
    async move {
        tokio::select! {
            biased;
            () = token.cancelled() => {
                let error = cancellation_error(&token);
                Err(match operation_id {
                    Some(id) => error.with_operation_id(id),
                    None => error,
                }
                .into())
            }
            result = future => result,
        }
    }
    .boxed()
}

/// Builds the error describing why `token` fired.
pub(crate) fn cancellation_error(token: &CancellationToken) -> CancellationError {
    token
        .reason()
        .map_or_else(
            || CancellationError::from(super::CancelReason::requested("cancelled")),
            CancellationError::from,
        )
}
