use axum::{
    extract::{Query, State},
    http::StatusCode,
    middleware::{self as axum_middleware},
    response::{Html, IntoResponse},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::{ConsentBroker, CredentialManager, LifecycleStatus, Principal};
use crate::error::{ApiError, Result};
use crate::middleware;

/// Application version from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub proxy_api_key: String,
    pub manager: Arc<CredentialManager>,
    pub broker: ConsentBroker,
}

/// Body of `PUT /v1/principal`
#[derive(Debug, Deserialize)]
pub struct PrincipalRequest {
    pub id: String,
    pub company: String,
}

/// Query string Google appends to the redirect URI
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub state: Option<String>,
    pub code: Option<String>,
    pub error: Option<String>,
}

/// Health check routes (no authentication required)
pub fn health_routes() -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
}

/// OAuth redirect target (no API key: the browser lands here from Google)
pub fn oauth_routes(state: AppState) -> Router {
    Router::new()
        .route("/oauth2/callback", get(oauth_callback_handler))
        .with_state(state)
}

/// Lifecycle control routes used by the dashboard (require authentication)
pub fn lifecycle_routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/status", get(status_handler))
        .route(
            "/v1/principal",
            put(set_principal_handler).delete(clear_principal_handler),
        )
        .route("/v1/sign-in", post(sign_in_handler))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .with_state(state)
}

/// GET / - Simple health check
async fn root_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Procure Keeper is running",
        "version": VERSION
    }))
}

/// GET /health - Detailed health check
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": VERSION
    }))
}

/// GET /v1/status - Lifecycle status snapshot
async fn status_handler(State(state): State<AppState>) -> Json<LifecycleStatus> {
    Json(state.manager.status())
}

/// PUT /v1/principal - Report the signed-in user
async fn set_principal_handler(
    State(state): State<AppState>,
    Json(body): Json<PrincipalRequest>,
) -> Result<StatusCode> {
    if body.id.trim().is_empty() {
        return Err(ApiError::ValidationError("id must not be empty".to_string()));
    }

    tracing::debug!(id = %body.id, company = %body.company, "Principal update received");
    state
        .manager
        .set_principal(Some(Principal::new(body.id, body.company)))?;
    Ok(StatusCode::ACCEPTED)
}

/// DELETE /v1/principal - User signed out
async fn clear_principal_handler(State(state): State<AppState>) -> Result<StatusCode> {
    tracing::debug!("Principal cleared");
    state.manager.set_principal(None)?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /v1/sign-in - Start the Google consent flow on demand
async fn sign_in_handler(State(state): State<AppState>) -> Result<impl IntoResponse> {
    state.manager.sign_in()?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "consent_started",
            "message": "Follow the authorization URL printed in the keeper log"
        })),
    ))
}

/// GET /oauth2/callback - Google redirect with the authorization code
async fn oauth_callback_handler(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Result<Html<&'static str>> {
    let consent_state = params
        .state
        .ok_or_else(|| ApiError::ValidationError("Missing state parameter".to_string()))?;

    let delivered = match (params.code, params.error) {
        (_, Some(error)) => {
            tracing::warn!("Google consent returned error: {}", error);
            state.broker.fail(&consent_state, error)
        }
        (Some(code), None) => state.broker.complete(&consent_state, code),
        (None, None) => {
            return Err(ApiError::ValidationError(
                "Callback carries neither code nor error".to_string(),
            ))
        }
    };

    if !delivered {
        return Err(ApiError::UnknownConsent(consent_state));
    }

    Ok(Html(
        "<html><body><h3>Google access granted.</h3><p>You can close this window.</p></body></html>",
    ))
}
