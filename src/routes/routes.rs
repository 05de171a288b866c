//! Defines routes for the build distribution API.
//!
//! ## Structure
//! - `GET  /api/apps`: newest build of every app
//! - `POST /api/apps/upload`: multipart upload of an `.apk` / `.ipa`
//! - `GET  /api/apps/{bundle_id}`: newest build of one app
//! - `GET  /api/apps/{bundle_id}/versions`: all builds, newest first
//! - `GET  /api/apps/{bundle_id}/versions/{version}/{build_number}`: one build
//! - `GET  /api/apps/{bundle_id}/builds/{upload_id}/download`: binary
//! - `GET  /healthz`, `GET /readyz`: probes

use crate::{
    handlers::{
        build_handlers::{
            download_build, get_build, latest_version, list_apps, list_versions, upload_build,
        },
        health_handlers::{healthz, readyz},
    },
    services::repository::SharedRepository,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router; `max_upload_bytes` caps request bodies.
///
/// The router carries the shared repository handle to all handlers.
pub fn routes(max_upload_bytes: usize) -> Router<SharedRepository> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/apps", get(list_apps))
        .route("/api/apps/upload", post(upload_build))
        .route("/api/apps/{bundle_id}", get(latest_version))
        .route("/api/apps/{bundle_id}/versions", get(list_versions))
        .route(
            "/api/apps/{bundle_id}/versions/{version}/{build_number}",
            get(get_build),
        )
        .route(
            "/api/apps/{bundle_id}/builds/{upload_id}/download",
            get(download_build),
        )
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}
