use super::state::AppState;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::warn;

/// Seconds a rejected client is asked to wait before retrying
const RETRY_AFTER_SECS: &str = "5";

/// Connection slot held for the lifetime of an upgraded socket
#[derive(Clone)]
pub struct ConnectionPermit(#[allow(dead_code)] Arc<OwnedSemaphorePermit>);

/// Admit a new streaming connection only when a connection slot is free and
/// enough recognition workers are alive.
pub async fn admit(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    if !state.is_system_healthy() {
        let (active, required) = state
            .health
            .as_ref()
            .map_or((0, 0), |h| (h.active_workers(), h.min_workers()));
        warn!(
            "Rejecting connection: {} of {} required workers alive",
            active, required
        );
        return unavailable("insufficient healthy workers");
    }

    let Some(permit) = state.connections.try_acquire() else {
        warn!(
            "Rejecting connection: limit of {} reached",
            state.connections.max()
        );
        return unavailable("too many connections");
    };

    request
        .extensions_mut()
        .insert(ConnectionPermit(Arc::new(permit)));
    next.run(request).await
}

fn unavailable(reason: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::RETRY_AFTER, RETRY_AFTER_SECS)],
        Json(json!({ "error": "service unavailable", "reason": reason })),
    )
        .into_response()
}
