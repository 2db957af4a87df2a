// OAuth authorization collaborator: interactive consent and token refresh

use futures::future::BoxFuture;
use reqwest::Url;
use std::time::Duration;

use super::consent::ConsentBroker;
use super::refresh::{self, ClientRegistration};
use super::types::Credential;
use crate::error::AuthError;
use crate::http_client::OAuthHttpClient;

/// Performs the consent flow and refreshes credentials on the manager's behalf
///
/// Implementations return the resulting credential; persisting it is the
/// caller's job.
pub trait OAuthProvider: Send + Sync + 'static {
    /// Run the interactive consent flow to completion
    fn sign_in(&self) -> BoxFuture<'_, Result<Credential, AuthError>>;

    /// Return `current` untouched if it is still fresh, otherwise a refreshed one
    fn refresh_if_expired<'a>(
        &'a self,
        current: &'a Credential,
    ) -> BoxFuture<'a, Result<Credential, AuthError>>;
}

/// Google OAuth 2.0 settings
#[derive(Debug, Clone)]
pub struct GoogleOAuthSettings {
    pub registration: ClientRegistration,
    pub auth_url: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    /// Refresh once the token expires within this many seconds
    pub refresh_threshold: i64,
    pub consent_timeout: Duration,
}

/// Google implementation backed by the consent broker and the token endpoint
pub struct GoogleOAuth {
    settings: GoogleOAuthSettings,
    http: OAuthHttpClient,
    broker: ConsentBroker,
}

impl GoogleOAuth {
    pub fn new(settings: GoogleOAuthSettings, http: OAuthHttpClient, broker: ConsentBroker) -> Self {
        Self {
            settings,
            http,
            broker,
        }
    }

    /// Consent screen URL for a given `state`
    pub fn authorization_url(&self, state: &str) -> Result<Url, AuthError> {
        let scope = self.settings.scopes.join(" ");
        Url::parse_with_params(
            &self.settings.auth_url,
            &[
                ("client_id", self.settings.registration.client_id.as_str()),
                ("redirect_uri", self.settings.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", state),
            ],
        )
        .map_err(|e| AuthError::ConsentDenied(format!("Invalid authorization URL: {}", e)))
    }

    async fn run_consent(&self) -> Result<Credential, AuthError> {
        let state = uuid::Uuid::new_v4().simple().to_string();
        let url = self.authorization_url(&state)?;
        let rx = self.broker.register(&state);

        tracing::info!("Google sign-in required, open this URL to grant access:");
        tracing::info!("{}", url);

        let timeout = self.settings.consent_timeout;
        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                return Err(AuthError::ConsentDenied(
                    "Consent flow was abandoned".to_string(),
                ))
            }
            Err(_) => {
                self.broker.cancel(&state);
                return Err(AuthError::ConsentTimeout(timeout.as_secs()));
            }
        };

        let code = outcome.map_err(AuthError::ConsentDenied)?;
        refresh::exchange_code(
            &self.http,
            &self.settings.registration,
            &code,
            &self.settings.redirect_uri,
        )
        .await
    }

    async fn refresh_if_needed(&self, current: &Credential) -> Result<Credential, AuthError> {
        if !current.expires_within(self.settings.refresh_threshold) {
            tracing::debug!(
                "Token still valid until {}, skipping refresh",
                current.expires_at.to_rfc3339()
            );
            return Ok(current.clone());
        }

        refresh::refresh_access_token(&self.http, &self.settings.registration, current).await
    }
}

impl OAuthProvider for GoogleOAuth {
    fn sign_in(&self) -> BoxFuture<'_, Result<Credential, AuthError>> {
        Box::pin(self.run_consent())
    }

    fn refresh_if_expired<'a>(
        &'a self,
        current: &'a Credential,
    ) -> BoxFuture<'a, Result<Credential, AuthError>> {
        Box::pin(self.refresh_if_needed(current))
    }
}
