use super::state::AppState;
use super::{admission, handlers, ws};
use axum::{middleware, routing::get, Router};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Streaming sessions, gated by admission control
        .route(
            "/ws/asr",
            get(ws::asr_socket).route_layer(middleware::from_fn_with_state(
                state.clone(),
                admission::admit,
            )),
        )
        // Service state
        .route("/api/v1/health", get(handlers::health))
        .route("/api/v1/history", get(handlers::history))
        .route(
            "/api/v1/session/:id",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        // Recognition engine pass-through
        .route("/api/v1/asr/queue/status", get(handlers::queue_status))
        .route("/api/v1/stats", get(handlers::stats))
        // Request logging, browser clients on other origins
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
