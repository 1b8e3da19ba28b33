/// API route handlers for the relay.
use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use dlrelay_shared::errors::RelayError;
use dlrelay_shared::models::{CustomDownloadRequest, DownloadRequest, HelpText, ProgressEvent, SyncResult};
use dlrelay_shared::params;

use crate::stream_log::StreamLog;
use crate::AppState;

pub const SERVICE_NAME: &str = "dlrelay";

// ====== RESPONSE TYPES ======

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_secs: Option<f64>,
}

pub type ApiError = (StatusCode, Json<ErrorBody>);

type EventStream = Sse<BoxStream<'static, Result<Event, Infallible>>>;

fn api_error(err: RelayError) -> ApiError {
    let status = match &err {
        RelayError::Validation(_) => StatusCode::BAD_REQUEST,
        RelayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    };
    if err.is_user_error() {
        info!("Rejected request: {}", err);
    } else {
        warn!("Request failed: {}", err);
    }
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
            kind: err.kind(),
            elapsed_secs: err.elapsed().map(|d| d.as_secs_f64()),
        }),
    )
}

/// Malformed query strings and bodies are validation errors, reported as JSON.
fn query_params<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    query
        .map(|Query(req)| req)
        .map_err(|rejection| api_error(RelayError::Validation(rejection.body_text())))
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(req)| req)
        .map_err(|rejection| api_error(RelayError::Validation(rejection.body_text())))
}

// ====== SSE ======

/// Encode a progress event as one SSE message: `event` is the status, `id`
/// the position in the stream, `data` the JSON event.
pub fn to_sse_event(seq: u64, event: &ProgressEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| event.message.clone());
    Event::default()
        .event(event.status.as_str())
        .id(seq.to_string())
        .data(data)
}

fn relay_sse(state: &AppState, params: &[String], kind: &'static str) -> EventStream {
    let mut log = StreamLog::start(kind);
    debug!("SSE [{}] relaying {} tokens", log.id(), params.len());
    let mut seq: u64 = 0;
    let events = state.relay.stream(params).map(move |event| {
        seq += 1;
        log.event(&event);
        Ok::<_, Infallible>(to_sse_event(seq, &event))
    });
    Sse::new(events.boxed()).keep_alive(KeepAlive::default())
}

// ====== DOWNLOAD ROUTES ======

/// GET|POST /api/download - Relay progress for a friendly request as SSE
pub async fn download(
    State(state): State<Arc<AppState>>,
    query: Result<Query<DownloadRequest>, QueryRejection>,
) -> Result<EventStream, ApiError> {
    let req = query_params(query)?;
    info!(
        "Download request: url={} format={:?} quality={:?} audio_only={}",
        req.url, req.format, req.quality, req.audio_only
    );
    let params = params::build_params(&req).map_err(api_error)?;
    Ok(relay_sse(&state, &params, "download"))
}

/// POST /api/download/custom - Relay progress for raw yt-dlp parameters as SSE
pub async fn download_custom(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CustomDownloadRequest>, JsonRejection>,
) -> Result<EventStream, ApiError> {
    let req = json_body(body)?;
    info!("Custom download request: url={} params={:?}", req.url, req.params);
    let params = params::custom_params(&req).map_err(api_error)?;
    Ok(relay_sse(&state, &params, "custom"))
}

/// GET|POST /api/download/sync - Block until the job finishes
pub async fn download_sync(
    State(state): State<Arc<AppState>>,
    query: Result<Query<DownloadRequest>, QueryRejection>,
) -> Result<Json<SyncResult>, ApiError> {
    let req = query_params(query)?;
    info!(
        "Sync download request: url={} format={:?} quality={:?}",
        req.url, req.format, req.quality
    );
    let params = params::build_params(&req).map_err(api_error)?;
    let result = state.relay.download_sync(&params).await.map_err(api_error)?;
    info!(
        "Sync download finished: status={} filename={}",
        result.status,
        result.filename.as_deref().unwrap_or("N/A")
    );
    Ok(Json(result))
}

// ====== INFO ROUTES ======

/// GET /api/help - yt-dlp help text from the remote service
pub async fn help(State(state): State<Arc<AppState>>) -> Result<Json<HelpText>, ApiError> {
    let help = state.relay.help().await.map_err(api_error)?;
    Ok(Json(help))
}

/// GET /api/health
pub async fn health() -> Json<serde_json::Value> {
    debug!("Health check");
    Json(serde_json::json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET / - Service info and endpoint index
pub async fn root(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "description": "REST/SSE relay for a hosted yt-dlp service",
        "upstream": state.config.upstream_url,
        "endpoints": {
            "health": "/api/health",
            "download_streaming": "/api/download",
            "download_custom": "/api/download/custom",
            "download_sync": "/api/download/sync",
            "help": "/api/help",
        },
    }))
}
