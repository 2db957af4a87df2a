// Shared fixtures for unit tests

use futures::future::BoxFuture;

use crate::auth::{Credential, OAuthProvider};
use crate::error::AuthError;

/// Provider that never grants consent and leaves credentials untouched
pub struct NoopProvider;

impl OAuthProvider for NoopProvider {
    fn sign_in(&self) -> BoxFuture<'_, Result<Credential, AuthError>> {
        Box::pin(async { Err(AuthError::ConsentDenied("not available in tests".to_string())) })
    }

    fn refresh_if_expired<'a>(
        &'a self,
        current: &'a Credential,
    ) -> BoxFuture<'a, Result<Credential, AuthError>> {
        Box::pin(async move { Ok(current.clone()) })
    }
}
