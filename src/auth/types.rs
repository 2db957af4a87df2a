// Authentication types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Storage key holding the serialized Google credential
pub const CREDENTIAL_KEY: &str = "oauth2-params";

/// Signed-in user as reported by the dashboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub company: String,
}

impl Principal {
    pub fn new(id: impl Into<String>, company: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            company: company.into(),
        }
    }
}

/// Delegated Google credential, replaced wholesale on every refresh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// True when the access token expires within `threshold_secs`
    pub fn expires_within(&self, threshold_secs: i64) -> bool {
        self.expires_at <= Utc::now() + Duration::seconds(threshold_secs)
    }

    /// True when the access token is already past its expiry
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Short token prefix safe to put in logs
    pub fn token_hint(&self) -> &str {
        self.access_token
            .get(..8)
            .unwrap_or(self.access_token.as_str())
    }
}

/// Lifecycle states of the credential manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// No gated principal, nothing scheduled
    Idle,
    /// Waiting on the interactive consent flow
    AwaitingConsent,
    /// Credential stored, refresh timer armed
    Scheduled,
}

/// Snapshot of the manager published after every transition
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleStatus {
    pub state: LifecycleState,
    pub principal: Option<Principal>,
    pub timer_armed: bool,
    pub consent_attempts: u64,
    pub refresh_cycles: u64,
    pub refresh_failures: u64,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for LifecycleStatus {
    fn default() -> Self {
        Self {
            state: LifecycleState::Idle,
            principal: None,
            timer_armed: false,
            consent_attempts: 0,
            refresh_cycles: 0,
            refresh_failures: 0,
            last_refresh_at: None,
            last_error: None,
        }
    }
}

/// Google token endpoint response
#[derive(Debug, Deserialize)]
pub struct GoogleTokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
    #[allow(dead_code)]
    pub scope: Option<String>,
    #[allow(dead_code)]
    pub token_type: Option<String>,
}

/// Google token endpoint error body
#[derive(Debug, Deserialize)]
pub struct GoogleErrorResponse {
    pub error: String,
    pub error_description: Option<String>,
}
