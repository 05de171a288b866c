//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that round-trips the repository storage

use crate::services::repository::SharedRepository;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;

/// `GET /healthz`
///
/// Very small liveness probe; always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(ReadyResponse {
            status: "ok",
            error: None,
        }),
    )
}

/// `GET /readyz`
///
/// Runs the backend's `health_check` (disk write/read/delete, plus
/// `SELECT 1` for SQLite). HTTP 200 when it passes, 503 otherwise.
pub async fn readyz(State(repo): State<SharedRepository>) -> impl IntoResponse {
    match repo.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ok",
                error: None,
            }),
        ),
        Err(err) => {
            tracing::warn!(error = %err, "readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadyResponse {
                    status: "error",
                    error: Some(err.to_string()),
                }),
            )
        }
    }
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}
