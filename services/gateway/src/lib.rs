pub mod config;
pub mod control;
pub mod state;
pub mod ws;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;

pub use config::GatewayConfig;
pub use state::GatewayState;

/// Builds the router: the WebSocket endpoint (plus optional legacy alias),
/// minimal session control endpoints, and health checks -- a small fraction
/// of the teacher's route list, since almost all of its REST surface (races,
/// participants, chips, dashboard SSE, admin token management, forwarder
/// config) has no counterpart here.
pub fn build_router(state: GatewayState) -> Router {
    let mut router = Router::new()
        .route("/ws/:session_id", get(ws::ws_handler))
        .route("/sessions", post(control::start_session))
        .route("/sessions/:session_id", axum::routing::delete(control::stop_session))
        .route("/sessions/:session_id/pause", post(control::pause_session))
        .route("/sessions/:session_id/resume", post(control::resume_session))
        .route(
            "/sessions/:session_id/finalize",
            post(control::finalize_session),
        )
        .route(
            "/sessions/:session_id/snapshot",
            get(control::snapshot_session),
        )
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz));

    if state.config.legacy_events_alias {
        router = router.route("/events/:session_id", get(ws::ws_handler));
    }

    router.fallback(fallback_404).with_state(state)
}

async fn fallback_404() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}

mod health {
    use axum::response::IntoResponse;
    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
