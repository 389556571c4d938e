use super::state::AppState;
use crate::session::{SessionError, SessionRecord};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use tracing::{error, warn};

/// Records returned by the history endpoint
const HISTORY_LIMIT: usize = 20;

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok" or "degraded"
    pub status: &'static str,
    pub backend: &'static str,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_workers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_workers: Option<usize>,
    pub in_flight: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<u64>,
    pub active_sessions: usize,
    pub connections: usize,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub total: usize,
    pub records: Vec<SessionRecord>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub session_id: String,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/v1/health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let healthy = state.is_system_healthy();

    let (in_flight, queue_depth, load_ok) = match state.dispatcher.load().await {
        Ok(load) => (load.in_flight, load.queue_depth, true),
        Err(e) => {
            warn!("Failed to read dispatcher load: {:#}", e);
            (0, None, false)
        }
    };

    Json(HealthResponse {
        status: if healthy && load_ok { "ok" } else { "degraded" },
        backend: state.dispatcher.name(),
        healthy,
        active_workers: state.health.as_ref().map(|h| h.active_workers()),
        min_workers: state.health.as_ref().map(|h| h.min_workers()),
        in_flight,
        queue_depth,
        active_sessions: state.sessions.active_count(),
        connections: state.connections.active(),
    })
}

/// GET /api/v1/history
pub async fn history(State(state): State<AppState>) -> Response {
    match state.sessions.history(HISTORY_LIMIT).await {
        Ok(records) => Json(HistoryResponse {
            total: records.len(),
            records,
        })
        .into_response(),
        Err(e) => {
            error!("Failed to load history: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to load history")
        }
    }
}

/// GET /api/v1/session/:id
/// Live snapshot if the session is in memory, else its stored record
pub async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if let Some(session) = state.sessions.get_session(&id).await {
        return Json(session).into_response();
    }

    match state.sessions.record(&id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("session not found: {}", id)),
        Err(e) => {
            error!("Failed to load session {}: {}", id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to load session")
        }
    }
}

/// DELETE /api/v1/session/:id
pub async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.sessions.delete_session(&id).await {
        Ok(()) => Json(DeleteResponse {
            session_id: id,
            status: "deleted",
        })
        .into_response(),
        Err(e @ SessionError::NotFound(_)) => error_response(StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => {
            error!("Failed to delete session {}: {}", id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to delete session")
        }
    }
}

/// GET /api/v1/asr/queue/status
pub async fn queue_status(State(state): State<AppState>) -> Response {
    proxy(&state, "/api/v1/asr/queue/status").await
}

/// GET /api/v1/stats
pub async fn stats(State(state): State<AppState>) -> Response {
    proxy(&state, "/api/v1/stats").await
}

async fn proxy(state: &AppState, path: &str) -> Response {
    match state.engine.get(path).await {
        Ok((status, body)) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
        }
        Err(e) => {
            warn!("Proxy request to {} failed: {:#}", path, e);
            error_response(StatusCode::BAD_GATEWAY, "recognition engine unavailable")
        }
    }
}
