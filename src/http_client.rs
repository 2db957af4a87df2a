use anyhow::{Context, Result};
use reqwest::{Client, Request, StatusCode};
use std::time::Duration;

use crate::error::AuthError;

/// HTTP client for the Google OAuth endpoints with retry logic
#[derive(Clone)]
pub struct OAuthHttpClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Maximum number of retries
    max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    base_delay_ms: u64,
}

/// Final answer from the server after retries: status and raw body
#[derive(Debug)]
pub struct RawResponse {
    pub status: StatusCode,
    pub body: String,
}

impl OAuthHttpClient {
    /// Create a new HTTP client
    pub fn new(
        max_connections: usize,
        connect_timeout: u64,
        request_timeout: u64,
        max_retries: u32,
    ) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(max_connections)
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .user_agent(format!(
                "procure-keeper/{}-{}",
                env!("CARGO_PKG_VERSION"),
                machine_fingerprint()
            ))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            max_retries,
            base_delay_ms: 1000, // 1 second base delay
        })
    }

    /// Override the backoff base delay
    pub fn with_base_delay(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// POST an urlencoded form, retrying on 429, 5xx and transport errors
    ///
    /// Any other status is returned as-is so the caller can read OAuth error bodies.
    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> std::result::Result<RawResponse, AuthError> {
        let request = self
            .client
            .post(url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .form(form)
            .build()
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        self.execute_with_retry(request).await
    }

    async fn execute_with_retry(
        &self,
        request: Request,
    ) -> std::result::Result<RawResponse, AuthError> {
        let mut attempt = 0;
        let url = request.url().clone();

        tracing::debug!(method = %request.method(), url = %url, "Sending HTTP request");

        loop {
            let req = request
                .try_clone()
                .ok_or_else(|| AuthError::Transport("Request body is not cloneable".into()))?;

            match self.client.execute(req).await {
                Ok(response) => {
                    let status = response.status();
                    tracing::debug!(status = %status, "Received HTTP response");

                    let retryable = status == StatusCode::TOO_MANY_REQUESTS
                        || status.is_server_error();

                    if retryable && attempt < self.max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            "Received {}, retrying after {}ms (attempt {}/{})",
                            status,
                            delay,
                            attempt + 1,
                            self.max_retries
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = response
                        .text()
                        .await
                        .map_err(|e| AuthError::Transport(e.to_string()))?;

                    if !status.is_success() {
                        tracing::warn!(
                            status = status.as_u16(),
                            url = %url,
                            attempt = attempt + 1,
                            "OAuth endpoint returned an error response"
                        );
                    }

                    return Ok(RawResponse { status, body });
                }

                Err(e) => {
                    let error_kind = if e.is_timeout() {
                        "timeout"
                    } else if e.is_connect() {
                        "connection_failed"
                    } else if e.is_request() {
                        "request_error"
                    } else if e.is_body() {
                        "body_error"
                    } else {
                        "unknown"
                    };

                    if attempt < self.max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            error_kind = error_kind,
                            url = %url,
                            "Request failed: {}, retrying after {}ms (attempt {}/{})",
                            e,
                            delay,
                            attempt + 1,
                            self.max_retries
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    tracing::error!(
                        error_kind = error_kind,
                        error = %e,
                        url = %url,
                        total_attempts = attempt + 1,
                        "HTTP request failed after all retries"
                    );

                    return Err(AuthError::Transport(format!("{} (kind: {})", e, error_kind)));
                }
            }
        }
    }

    /// Calculate exponential backoff delay
    fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        // base_delay * 2^attempt plus up to 10% jitter
        let delay = self.base_delay_ms * 2_u64.pow(attempt);
        let jitter = (delay as f64 * 0.1 * rand::random()) as u64;
        delay + jitter
    }
}

/// Hashed hostname for the User-Agent
fn machine_fingerprint() -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let mut hasher = DefaultHasher::new();
    hostname.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

// Simple random number generation for jitter
mod rand {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hash, Hasher};

    pub fn random() -> f64 {
        let state = RandomState::new();
        let mut hasher = state.build_hasher();
        std::time::SystemTime::now().hash(&mut hasher);
        (hasher.finish() % 1000) as f64 / 1000.0
    }
}
