//! HTTP request handlers.

use super::AppState;
use crate::config::{AppConfig, ConfigError};
use crate::engine::EngineError;
use crate::models::TargetUpdate;
use crate::registry::RegistryError;
use crate::scheduler::SchedulerError;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

// ============================================================================
// Errors
// ============================================================================

impl EngineError {
    fn status_code(&self) -> StatusCode {
        match self {
            EngineError::Registry(RegistryError::InvalidAddress(_)) => StatusCode::BAD_REQUEST,
            EngineError::Registry(RegistryError::DuplicateTarget(_)) => StatusCode::CONFLICT,
            EngineError::Registry(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
            EngineError::Scheduler(SchedulerError::InvalidInterval(_)) => StatusCode::BAD_REQUEST,
            EngineError::Scheduler(SchedulerError::AlreadyRunning) => StatusCode::CONFLICT,
            EngineError::Config(ConfigError::Invalid(_) | ConfigError::Format(_)) => StatusCode::BAD_REQUEST,
            EngineError::Config(_) | EngineError::Log(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, EngineError>;

// ============================================================================
// Lifecycle
// ============================================================================

pub async fn handle_start(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.engine.start().await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_stop(State(state): State<AppState>) -> StatusCode {
    state.engine.stop().await;
    StatusCode::NO_CONTENT
}

pub async fn handle_state(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "state": state.engine.state().await }))
}

// ============================================================================
// Targets
// ============================================================================

pub async fn handle_list_targets(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.list_targets())
}

#[derive(Debug, Deserialize)]
pub struct AddTargetRequest {
    pub address: String,
    #[serde(default)]
    pub label: Option<String>,
}

pub async fn handle_add_target(
    State(state): State<AppState>,
    Json(req): Json<AddTargetRequest>,
) -> ApiResult<impl IntoResponse> {
    let target = state.engine.add_target(&req.address, req.label.as_deref())?;
    Ok((StatusCode::CREATED, Json(target)))
}

pub async fn handle_update_target(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(fields): Json<TargetUpdate>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.update_target(&id, fields)?))
}

pub async fn handle_remove_target(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine.remove_target(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_toggle_target(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.toggle_target(&id)?))
}

pub async fn handle_presets(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.preset_targets())
}

// ============================================================================
// Settings and statistics
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct IntervalRequest {
    pub interval_ms: u64,
}

pub async fn handle_set_interval(
    State(state): State<AppState>,
    Json(req): Json<IntervalRequest>,
) -> ApiResult<StatusCode> {
    state.engine.set_interval(req.interval_ms)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub struct TargetQuery {
    pub target_id: Option<String>,
}

pub async fn handle_get_statistics(
    State(state): State<AppState>,
    Query(query): Query<TargetQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.get_statistics(query.target_id.as_deref())?))
}

pub async fn handle_reset_statistics(
    State(state): State<AppState>,
    Query(query): Query<TargetQuery>,
) -> ApiResult<StatusCode> {
    state.engine.reset_statistics(query.target_id.as_deref())?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub struct RecentQuery {
    pub count: Option<usize>,
}

pub async fn handle_recent(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> impl IntoResponse {
    Json(state.engine.recent_outcomes(query.count))
}

pub async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.get_config())
}

pub async fn handle_save_config(
    State(state): State<AppState>,
    Json(config): Json<AppConfig>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.save_config(config)?))
}

pub async fn handle_log_path(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "path": state.engine.log_path() }))
}

// ============================================================================
// Events
// ============================================================================

pub async fn handle_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.engine.subscribe()).filter_map(|item| match item {
        Ok(event) => match Event::default().event(event.name()).json_data(&event) {
            Ok(sse) => Some(Ok(sse)),
            Err(e) => {
                tracing::warn!("Failed to encode {} event: {}", event.name(), e);
                None
            }
        },
        Err(e) => {
            // Lagging subscribers skip what they missed.
            tracing::debug!("Event subscriber lagged: {}", e);
            None
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
