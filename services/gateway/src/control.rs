//! Minimal control endpoints for session lifecycle, analogous in spirit to
//! the teacher's small `http::` route modules but scoped to exactly what
//! this system needs: sessions are created/stopped/paused out of band from
//! the WebSocket stream itself (spec §6: "session is created via a
//! separate control channel").

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use loquilex_session_core::{AdmissionError, StartRequest};
use serde::{Deserialize, Serialize};

use crate::state::GatewayState;

#[derive(Debug, Deserialize, Default)]
pub struct StartSessionRequest {
    #[serde(default)]
    pub wants_cuda: bool,
}

#[derive(Debug, Serialize)]
pub struct StartSessionResponse {
    pub session_id: String,
}

pub async fn start_session(
    State(state): State<GatewayState>,
    Json(req): Json<StartSessionRequest>,
) -> impl IntoResponse {
    match state
        .sessions
        .start(StartRequest {
            wants_cuda: req.wants_cuda,
        })
        .await
    {
        Ok(sid) => {
            state.spawn_close_dispatcher(&sid).await;
            state.spawn_heartbeat_sweeper(&sid);
            (StatusCode::CREATED, Json(StartSessionResponse { session_id: sid })).into_response()
        }
        Err(e) => admission_error_response(&e),
    }
}

pub async fn stop_session(
    State(state): State<GatewayState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let stopped = state.sessions.stop(&session_id).await;
    state.drop_session_dispatcher(&session_id).await;
    if stopped {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

pub async fn pause_session(
    State(state): State<GatewayState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    lifecycle_response(state.sessions.pause(&session_id).await)
}

pub async fn resume_session(
    State(state): State<GatewayState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    lifecycle_response(state.sessions.resume(&session_id).await)
}

pub async fn finalize_session(
    State(state): State<GatewayState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    lifecycle_response(state.sessions.finalize(&session_id).await)
}

pub async fn snapshot_session(
    State(state): State<GatewayState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.sessions.snapshot(&session_id).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => admission_error_response(&e),
    }
}

fn lifecycle_response(result: Result<(), AdmissionError>) -> axum::response::Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => admission_error_response(&e),
    }
}

fn admission_error_response(err: &AdmissionError) -> axum::response::Response {
    let status = match err {
        AdmissionError::NotFound(_) => StatusCode::NOT_FOUND,
        AdmissionError::ResourceBusy { .. } | AdmissionError::SessionCapReached { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    (status, err.to_string()).into_response()
}
