// Google token endpoint calls

use chrono::{Duration, Utc};

use super::types::{Credential, GoogleErrorResponse, GoogleTokenResponse};
use crate::error::AuthError;
use crate::http_client::{OAuthHttpClient, RawResponse};

/// OAuth client registration used against the token endpoint
#[derive(Debug, Clone)]
pub struct ClientRegistration {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
}

/// Exchange an authorization code for a fresh credential
pub async fn exchange_code(
    http: &OAuthHttpClient,
    registration: &ClientRegistration,
    code: &str,
    redirect_uri: &str,
) -> Result<Credential, AuthError> {
    tracing::info!("Exchanging authorization code for Google tokens...");

    let form = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("client_id", registration.client_id.as_str()),
        ("client_secret", registration.client_secret.as_str()),
        ("redirect_uri", redirect_uri),
    ];

    let response = http.post_form(&registration.token_url, &form).await?;
    let data = parse_token_response(response)?;

    let refresh_token = data.refresh_token.clone().ok_or_else(|| {
        AuthError::InvalidResponse(
            "Consent response has no refresh_token (was access_type=offline sent?)".to_string(),
        )
    })?;

    let credential = Credential {
        access_token: data.access_token,
        refresh_token,
        expires_at: expiry_from(data.expires_in)?,
    };

    tracing::info!(
        "Google sign-in complete, token {}..., expires: {}",
        credential.token_hint(),
        credential.expires_at.to_rfc3339()
    );

    Ok(credential)
}

/// Refresh the access token using the stored refresh token
pub async fn refresh_access_token(
    http: &OAuthHttpClient,
    registration: &ClientRegistration,
    current: &Credential,
) -> Result<Credential, AuthError> {
    tracing::info!("Refreshing Google access token...");

    let form = [
        ("grant_type", "refresh_token"),
        ("refresh_token", current.refresh_token.as_str()),
        ("client_id", registration.client_id.as_str()),
        ("client_secret", registration.client_secret.as_str()),
    ];

    let response = http.post_form(&registration.token_url, &form).await?;
    let data = parse_token_response(response)?;

    // Google usually omits refresh_token on refresh; keep the one we have
    let credential = Credential {
        access_token: data.access_token,
        refresh_token: data
            .refresh_token
            .unwrap_or_else(|| current.refresh_token.clone()),
        expires_at: expiry_from(data.expires_in)?,
    };

    tracing::info!(
        "Token refreshed, expires: {}",
        credential.expires_at.to_rfc3339()
    );

    Ok(credential)
}

/// Turn a raw token endpoint response into token data or a typed error
fn parse_token_response(response: RawResponse) -> Result<GoogleTokenResponse, AuthError> {
    if !response.status.is_success() {
        if let Ok(err) = serde_json::from_str::<GoogleErrorResponse>(&response.body) {
            tracing::error!(
                "Google OAuth error details: error={}, description={}",
                err.error,
                err.error_description.as_deref().unwrap_or("-")
            );

            if err.error == "invalid_grant" {
                return Err(AuthError::Revoked(
                    err.error_description.unwrap_or(err.error),
                ));
            }
        }

        return Err(AuthError::Upstream {
            status: response.status.as_u16(),
            message: response.body,
        });
    }

    let data: GoogleTokenResponse = serde_json::from_str(&response.body)
        .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;

    if data.access_token.is_empty() {
        return Err(AuthError::InvalidResponse(
            "Response does not contain access_token".to_string(),
        ));
    }

    Ok(data)
}

/// Expiration time with a 60 second safety buffer
///
/// Lifetimes that do not fit a timestamp are rejected rather than wrapped.
fn expiry_from(expires_in: Option<u64>) -> Result<chrono::DateTime<Utc>, AuthError> {
    let expires_in = expires_in.unwrap_or(3600);
    i64::try_from(expires_in)
        .ok()
        .and_then(|secs| Duration::try_seconds(secs - 60))
        .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
        .ok_or_else(|| {
            AuthError::InvalidResponse(format!("expires_in out of range: {}", expires_in))
        })
}
