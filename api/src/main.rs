/// dlrelay API Server
///
/// REST/SSE front for a hosted yt-dlp service. Translates download options
/// into yt-dlp arguments and relays the service's progress events.
mod config;
mod relay;
mod routes;
mod stream_log;

#[cfg(test)]
mod mock_upstream;

use anyhow::Context;
use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{info, warn, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use config::{Config, LogConfig};
use relay::RelayClient;

/// Shared application state for all API handlers.
pub struct AppState {
    pub config: Config,
    pub relay: RelayClient,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env
    dotenvy::dotenv().ok();

    // Init tracing
    let log_config = LogConfig::from_env();
    let file_layer = match &log_config.file {
        Some(path) => Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(open_log_file(path)?)),
        ),
        None => None,
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| log_config.default_filter().into()))
        .with(fmt::layer())
        .with(file_layer)
        .init();
    if let Some(path) = &log_config.file {
        info!("Logging to file: {}", path.display());
    }

    // Config
    let config = Config::from_env()?;
    info!("=== dlrelay v{} starting ===", env!("CARGO_PKG_VERSION"));
    info!("Upstream: {}", config.upstream_url);
    info!("Download base URL: {}", config.download_base_url);
    info!("Download timeout: {}s", config.download_timeout);
    info!("CORS origins: {}", config.cors_origins.join(", "));

    let relay = RelayClient::from_config(&config)?;
    let addr = config.bind_addr();
    let state = Arc::new(AppState { config, relay });
    let app = build_router(state);

    // Bind
    info!("dlrelay listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("dlrelay shut down");
    Ok(())
}

/// Router with every route, CORS and request tracing applied.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config);

    Router::new()
        .route("/", get(routes::root))
        .route("/api/health", get(routes::health))
        .route("/api/help", get(routes::help))
        .route("/api/download", get(routes::download).post(routes::download))
        .route("/api/download/custom", post(routes::download_custom))
        .route("/api/download/sync", get(routes::download_sync).post(routes::download_sync))
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    if config.allows_any_origin() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    // Credentials rule out wildcards, so methods and headers mirror the request.
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

fn open_log_file(path: &Path) -> anyhow::Result<File> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating log directory {}", dir.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
