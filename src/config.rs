use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::{Confirm, Input, Password};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::{ClientRegistration, GoogleOAuthSettings, ManagerSettings};

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_SCOPES: &str = "https://www.googleapis.com/auth/drive";

/// Procure Keeper - Google credential lifecycle service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Server host address
    #[arg(short = 'H', long, env = "SERVER_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Server port
    #[arg(short, long, env = "SERVER_PORT", default_value = "8000")]
    pub port: u16,

    /// API key the dashboard presents to this service
    #[arg(short = 'k', long, env = "PROXY_API_KEY")]
    pub api_key: Option<String>,

    /// Google OAuth client ID
    #[arg(long, env = "GOOGLE_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Google OAuth client secret
    #[arg(long, env = "GOOGLE_CLIENT_SECRET")]
    pub client_secret: Option<String>,

    /// Redirect URI registered with Google (defaults to this server's callback)
    #[arg(long, env = "GOOGLE_REDIRECT_URI")]
    pub redirect_uri: Option<String>,

    /// Space-separated OAuth scopes
    #[arg(long, env = "GOOGLE_SCOPES", default_value = DEFAULT_SCOPES)]
    pub scopes: String,

    /// Company whose users get a managed Google credential
    #[arg(short = 'c', long, env = "GATED_COMPANY", default_value = "Procure")]
    pub gated_company: String,

    /// Path to the credential SQLite database
    #[arg(short = 'd', long, env = "CREDENTIAL_DB_FILE")]
    pub db_file: Option<String>,

    /// Keep credentials in memory only
    #[arg(long, env = "EPHEMERAL_STORE", default_value = "false")]
    pub ephemeral: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// HTTP max retries
    #[arg(long, env = "HTTP_MAX_RETRIES", default_value = "3")]
    pub http_retries: u32,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Server settings
    pub server_host: String,
    pub server_port: u16,

    // Authentication
    pub proxy_api_key: String,

    // Google OAuth client
    pub google_client_id: String,
    pub google_client_secret: String,
    pub google_redirect_uri: String,
    pub google_scopes: Vec<String>,
    pub google_auth_url: String,
    pub google_token_url: String,

    // Lifecycle
    pub gated_company: String,
    pub token_refresh_threshold: u64,
    pub refresh_interval_secs: u64,
    pub activation_debounce_ms: u64,
    pub consent_timeout_secs: u64,

    // Storage
    pub store: StoreMode,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub http_max_retries: u32,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StoreMode {
    Sqlite(PathBuf),
    Memory,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        Self::from_args(args)
    }

    /// Build configuration from parsed CLI arguments plus env-only settings
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let port = args.port;
        let google_redirect_uri = args
            .redirect_uri
            .unwrap_or_else(|| format!("http://localhost:{}/oauth2/callback", port));

        let store = if args.ephemeral {
            StoreMode::Memory
        } else {
            StoreMode::Sqlite(
                args.db_file
                    .map(|s| expand_tilde(&s))
                    .or_else(default_db_path)
                    .context("CREDENTIAL_DB_FILE is required when no home directory is available")?,
            )
        };

        let config = Config {
            server_host: args.host,
            server_port: args.port,

            proxy_api_key: args
                .api_key
                .context("PROXY_API_KEY is required (use -k or set PROXY_API_KEY env var)")?,

            google_client_id: args
                .client_id
                .context("GOOGLE_CLIENT_ID is required (use --client-id or set GOOGLE_CLIENT_ID)")?,

            google_client_secret: args.client_secret.context(
                "GOOGLE_CLIENT_SECRET is required (use --client-secret or set GOOGLE_CLIENT_SECRET)",
            )?,

            google_redirect_uri,
            google_scopes: parse_scopes(&args.scopes),
            google_auth_url: std::env::var("GOOGLE_AUTH_URL")
                .unwrap_or_else(|_| GOOGLE_AUTH_URL.to_string()),
            google_token_url: std::env::var("GOOGLE_TOKEN_URL")
                .unwrap_or_else(|_| GOOGLE_TOKEN_URL.to_string()),

            gated_company: args.gated_company,

            token_refresh_threshold: env_or("TOKEN_REFRESH_THRESHOLD", 300),
            refresh_interval_secs: env_or("REFRESH_INTERVAL_SECS", 30),
            activation_debounce_ms: env_or("ACTIVATION_DEBOUNCE_MS", 1000),
            consent_timeout_secs: env_or("CONSENT_TIMEOUT_SECS", 300),

            store,

            http_max_connections: env_or("HTTP_MAX_CONNECTIONS", 10),
            http_connect_timeout: env_or("HTTP_CONNECT_TIMEOUT", 10),
            http_request_timeout: args.http_timeout,
            http_max_retries: args.http_retries,

            log_level: args.log_level,
            log_format: parse_log_format(&args.log_format),
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.proxy_api_key.is_empty() {
            anyhow::bail!("PROXY_API_KEY cannot be empty");
        }

        if self.google_scopes.is_empty() {
            anyhow::bail!("GOOGLE_SCOPES must name at least one scope");
        }

        if self.refresh_interval_secs == 0 {
            anyhow::bail!("REFRESH_INTERVAL_SECS must be greater than zero");
        }

        reqwest::Url::parse(&self.google_redirect_uri).with_context(|| {
            format!("GOOGLE_REDIRECT_URI is not a valid URL: {}", self.google_redirect_uri)
        })?;

        Ok(())
    }

    /// Lifecycle settings for the credential manager
    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            gated_company: self.gated_company.clone(),
            debounce: Duration::from_millis(self.activation_debounce_ms),
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
        }
    }

    /// Google OAuth client settings
    pub fn google_settings(&self) -> GoogleOAuthSettings {
        GoogleOAuthSettings {
            registration: ClientRegistration {
                client_id: self.google_client_id.clone(),
                client_secret: self.google_client_secret.clone(),
                token_url: self.google_token_url.clone(),
            },
            auth_url: self.google_auth_url.clone(),
            redirect_uri: self.google_redirect_uri.clone(),
            scopes: self.google_scopes.clone(),
            refresh_threshold: self.token_refresh_threshold as i64,
            consent_timeout: Duration::from_secs(self.consent_timeout_secs),
        }
    }
}

/// Parse a numeric env var, falling back to `default`
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Default database location under the user's data directory
fn default_db_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("procure-keeper").join("credentials.sqlite3"))
}

/// Split scopes on whitespace or commas
fn parse_scopes(s: &str) -> Vec<String> {
    s.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|scope| !scope.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse log format from string
fn parse_log_format(s: &str) -> LogFormat {
    match s.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}


// === Interactive Setup ===

/// Check if interactive setup is needed (no .env file and missing required values)
pub fn needs_interactive_setup() -> bool {
    let env_file_exists = std::path::Path::new(".env").exists();

    let has_proxy_key = std::env::var("PROXY_API_KEY").is_ok();
    let has_client_id = std::env::var("GOOGLE_CLIENT_ID").is_ok();
    let has_client_secret = std::env::var("GOOGLE_CLIENT_SECRET").is_ok();

    !env_file_exists && (!has_proxy_key || !has_client_id || !has_client_secret)
}

/// Configuration collected from interactive setup
#[derive(Debug, Clone)]
pub struct InteractiveConfig {
    pub proxy_api_key: String,
    pub google_client_id: String,
    pub google_client_secret: String,
    pub gated_company: String,
    pub server_port: String,
}

/// Run interactive setup to collect required configuration
pub fn run_interactive_setup() -> Result<InteractiveConfig> {
    println!();
    println!("Procure Keeper - first time setup");
    println!("No configuration found. Let's register your Google OAuth client.");
    println!();

    let proxy_api_key: String = Password::new()
        .with_prompt("API key the dashboard will use (PROXY_API_KEY)")
        .interact()
        .context("Failed to read PROXY_API_KEY")?;

    if proxy_api_key.is_empty() {
        anyhow::bail!("PROXY_API_KEY cannot be empty");
    }

    let google_client_id: String = Input::new()
        .with_prompt("Google OAuth client ID (GOOGLE_CLIENT_ID)")
        .interact_text()
        .context("Failed to read GOOGLE_CLIENT_ID")?;

    let google_client_secret: String = Password::new()
        .with_prompt("Google OAuth client secret (GOOGLE_CLIENT_SECRET)")
        .interact()
        .context("Failed to read GOOGLE_CLIENT_SECRET")?;

    let gated_company: String = Input::new()
        .with_prompt("Company whose users get Google Drive access")
        .default("Procure".to_string())
        .interact_text()
        .context("Failed to read gated company")?;

    let server_port: String = Input::new()
        .with_prompt("Server port")
        .default("8000".to_string())
        .interact_text()
        .context("Failed to read server port")?;

    let config = InteractiveConfig {
        proxy_api_key,
        google_client_id,
        google_client_secret,
        gated_company,
        server_port,
    };

    println!();
    let save_to_env = Confirm::new()
        .with_prompt("Save configuration to .env file?")
        .default(true)
        .interact()
        .context("Failed to read save confirmation")?;

    if save_to_env {
        save_env_file(&config)?;
        println!("Configuration saved to .env file");
    }

    println!();
    Ok(config)
}

/// Save configuration to .env file
fn save_env_file(config: &InteractiveConfig) -> Result<()> {
    let env_content = format!(
        r#"# Procure Keeper Configuration
# Generated by interactive setup

# Key the dashboard sends in Authorization / x-api-key (required)
PROXY_API_KEY={}

# Google OAuth client (required)
GOOGLE_CLIENT_ID={}
GOOGLE_CLIENT_SECRET={}

# Company whose users get a managed Google credential
GATED_COMPANY={}

# Server settings
SERVER_HOST=127.0.0.1
SERVER_PORT={}

# Logging (trace, debug, info, warn, error)
LOG_LEVEL=info
"#,
        config.proxy_api_key,
        config.google_client_id,
        config.google_client_secret,
        config.gated_company,
        config.server_port,
    );

    let mut file = std::fs::File::create(".env").context("Failed to create .env file")?;
    file.write_all(env_content.as_bytes())
        .context("Failed to write .env file")?;

    Ok(())
}
