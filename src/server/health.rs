//! Liveness check.

use axum::http::StatusCode;

/// `GET /health`: 200 with body `OK` while the process is serving requests.
///
/// Says nothing about storage or delivery health.
pub async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}
