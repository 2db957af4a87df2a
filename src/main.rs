use anyhow::Result;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use procure_keeper::auth::{
    ConsentBroker, CredentialManager, CredentialStore, GoogleOAuth, MemoryStore, SqliteStore,
};
use procure_keeper::config::{self, Config, LogFormat, StoreMode};
use procure_keeper::http_client::OAuthHttpClient;
use procure_keeper::{middleware, routes};

#[tokio::main]
async fn main() -> Result<()> {
    // Check if interactive setup is needed (no .env and missing required values)
    if config::needs_interactive_setup() {
        let interactive_config = config::run_interactive_setup()?;

        // Set environment variables from interactive config so Config::load() can use them
        std::env::set_var("PROXY_API_KEY", &interactive_config.proxy_api_key);
        std::env::set_var("GOOGLE_CLIENT_ID", &interactive_config.google_client_id);
        std::env::set_var("GOOGLE_CLIENT_SECRET", &interactive_config.google_client_secret);
        std::env::set_var("GATED_COMPANY", &interactive_config.gated_company);
        std::env::set_var("SERVER_PORT", &interactive_config.server_port);
    }

    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    init_tracing(&config);

    tracing::info!("Procure Keeper starting...");
    tracing::info!(
        "Server configured: {}:{}",
        config.server_host,
        config.server_port
    );

    let store: Arc<dyn CredentialStore> = match &config.store {
        StoreMode::Sqlite(path) => {
            tracing::info!("Using credential database: {}", path.display());
            Arc::new(SqliteStore::open(path)?)
        }
        StoreMode::Memory => {
            tracing::warn!("Using in-memory credential store, credentials are lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    let http = OAuthHttpClient::new(
        config.http_max_connections,
        config.http_connect_timeout,
        config.http_request_timeout,
        config.http_max_retries,
    )?;

    let broker = ConsentBroker::new();
    let google = Arc::new(GoogleOAuth::new(
        config.google_settings(),
        http,
        broker.clone(),
    ));

    let manager = Arc::new(CredentialManager::spawn(
        google,
        store,
        config.manager_settings(),
    ));
    tracing::info!("Credential manager initialized");

    let app_state = routes::AppState {
        proxy_api_key: config.proxy_api_key.clone(),
        manager: manager.clone(),
        broker,
    };

    let app = build_app(app_state);

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    print_startup_banner(&config);
    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Session over: cancel timers before the runtime goes away
    manager.shutdown().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Initialize logging; RUST_LOG overrides the configured level
fn init_tracing(config: &Config) {
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_file(true)
            .with_line_number(true)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .init(),
    }
}

/// Build the application with all routes and middleware
fn build_app(state: routes::AppState) -> axum::Router {
    use axum::Router;

    Router::new()
        .merge(routes::health_routes())
        .merge(routes::oauth_routes(state.clone()))
        .merge(routes::lifecycle_routes(state))
        .layer(middleware::cors_layer())
        .layer(TraceLayer::new_for_http())
}

/// Print startup banner
fn print_startup_banner(config: &Config) {
    println!();
    println!("  Procure Keeper {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Server:         http://{}:{}",
        config.server_host, config.server_port
    );
    println!("  Gated company:  {}", config.gated_company);
    println!("  Redirect URI:   {}", config.google_redirect_uri);
    match &config.store {
        StoreMode::Sqlite(path) => println!("  Store:          {}", path.display()),
        StoreMode::Memory => println!("  Store:          in-memory"),
    }
    println!("  Log Level:      {}", config.log_level);
    println!();
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
