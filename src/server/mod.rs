// HTTP surface - thin plumbing between the dashboard and the core.
// Every failure leaves as {"error": message} with a non-2xx status.

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerSettings;
use crate::ledger::{LedgerStats, SkipLedger, SkipRecord, Timeframe, TrendPoint};
use crate::monitor::Monitor;
use crate::spotify::{Session, SpotifyClient, SpotifyError};

#[derive(Clone)]
pub struct AppState {
    pub session: Arc<Session>,
    pub spotify: SpotifyClient,
    pub ledger: Arc<SkipLedger>,
    pub monitor: Arc<Monitor>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/auth/login", get(index))
        .route("/auth/callback", get(auth_callback))
        .route("/monitor/start", post(start_monitor))
        .route("/monitor/stop", post(stop_monitor))
        .route("/monitor/status", get(monitor_status))
        .route("/api/analytics", get(analytics))
        .route("/api/skipped-songs", get(skipped_songs))
        .route("/api/delete-songs", post(delete_songs))
        .route("/api/stats", get(db_stats))
        .route("/playlists", get(playlists))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: AppState, settings: &ServerSettings) -> Result<()> {
    let addr = format!("{}:{}", settings.bind_address, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on http://{addr}");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

/// Boundary error type; everything the handlers can fail with maps onto
/// a status code plus the dashboard's expected error envelope.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotAuthenticated,
    Upstream(SpotifyError),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotAuthenticated => (
                StatusCode::UNAUTHORIZED,
                "not authenticated with Spotify, visit /auth/login first".to_string(),
            ),
            ApiError::Upstream(e) => (StatusCode::BAD_GATEWAY, e.to_string()),
            ApiError::Internal(e) => {
                error!("request failed: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<SpotifyError> for ApiError {
    fn from(e: SpotifyError) -> Self {
        match e {
            SpotifyError::NotAuthenticated => ApiError::NotAuthenticated,
            other => ApiError::Upstream(other),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

#[derive(Debug, Deserialize)]
struct TimeframeParams {
    timeframe: Option<String>,
    // Accepted for dashboard-URL compatibility; the ledger carries no
    // playlist attribution, so it cannot filter.
    #[serde(rename = "playlist")]
    _playlist: Option<String>,
}

impl TimeframeParams {
    fn timeframe(&self) -> Result<Timeframe, ApiError> {
        match self.timeframe.as_deref() {
            None | Some("") => Ok(Timeframe::default()),
            Some(raw) => raw
                .parse()
                .map_err(|e: crate::ledger::ParseTimeframeError| ApiError::BadRequest(e.to_string())),
        }
    }
}

async fn index(State(state): State<AppState>) -> Redirect {
    Redirect::temporary(&state.session.authorize_url())
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    error: Option<String>,
}

async fn auth_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Some(denied) = params.error {
        return Err(ApiError::BadRequest(format!("authorization denied: {denied}")));
    }
    let code = params
        .code
        .ok_or_else(|| ApiError::BadRequest("missing authorization code".to_string()))?;

    state.session.exchange_code(&code).await?;

    // Monitoring begins as soon as the session exists
    state.monitor.start().await?;

    Ok(Json(json!({ "status": "authenticated", "monitoring": true })))
}

#[derive(Debug, Serialize)]
struct MonitorStatus {
    active: bool,
}

async fn start_monitor(State(state): State<AppState>) -> Result<Json<MonitorStatus>, ApiError> {
    if !state.session.is_authenticated().await {
        return Err(ApiError::NotAuthenticated);
    }
    state.monitor.start().await?;
    Ok(Json(MonitorStatus { active: true }))
}

async fn stop_monitor(State(state): State<AppState>) -> Result<Json<MonitorStatus>, ApiError> {
    state.monitor.stop().await?;
    Ok(Json(MonitorStatus { active: false }))
}

async fn monitor_status(State(state): State<AppState>) -> Json<MonitorStatus> {
    Json(MonitorStatus {
        active: state.monitor.is_active().await,
    })
}

#[derive(Debug, Serialize)]
struct Analytics {
    timeframe: Timeframe,
    total_skips: i64,
    unique_songs: usize,
    skip_trends: Vec<TrendPoint>,
}

async fn analytics(
    State(state): State<AppState>,
    Query(params): Query<TimeframeParams>,
) -> Result<Json<Analytics>, ApiError> {
    let timeframe = params.timeframe()?;
    let total_skips = state.ledger.total_skips(timeframe).await?;
    let songs = state.ledger.skipped_songs(timeframe).await?;
    let skip_trends = state.ledger.skip_trends(timeframe).await?;

    Ok(Json(Analytics {
        timeframe,
        total_skips,
        unique_songs: songs.len(),
        skip_trends,
    }))
}

async fn skipped_songs(
    State(state): State<AppState>,
    Query(params): Query<TimeframeParams>,
) -> Result<Json<Vec<SkipRecord>>, ApiError> {
    let timeframe = params.timeframe()?;
    Ok(Json(state.ledger.skipped_songs(timeframe).await?))
}

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    #[serde(rename = "songIds")]
    song_ids: Vec<String>,
}

async fn delete_songs(
    State(state): State<AppState>,
    Json(request): Json<DeleteRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state.ledger.remove_records(&request.song_ids).await?;
    if deleted > 0 {
        info!("pruned {deleted} songs from the skip ledger");
    }
    Ok(Json(json!({ "deleted": deleted })))
}

async fn db_stats(State(state): State<AppState>) -> Result<Json<LedgerStats>, ApiError> {
    Ok(Json(state.ledger.stats().await?))
}

async fn playlists(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(state.spotify.current_user_playlists().await?))
}
