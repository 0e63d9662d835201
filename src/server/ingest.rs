//! Batch ingestion handler.
//!
//! Validates the request, stores array payloads durably, and only then
//! answers the sender. A 200 therefore means the batch survives a crash
//! (to the extent the storage provider is durable).

use axum::Json;
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{FromRequest, Request, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::AppState;
use crate::config::IngestMode;
use crate::storage::{StorageError, StorageProvider};
use crate::types::Batch;

/// Body of every ingestion response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub msg: String,
}

impl Reply {
    pub fn ok() -> Self {
        Reply {
            msg: "ok".to_string(),
        }
    }
}

/// Request rejected before anything was stored.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Non-POST methods not supported")]
    MethodNotPost,

    #[error("Expected application/json request")]
    NotJson,

    #[error("Malformed JSON")]
    MalformedJson,

    /// Only in strict mode.
    #[error("Expected JSON array")]
    NotArray,
}

/// Errors that end an ingestion request.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The body could not be read, usually because it exceeds the limit.
    #[error("{}", .0.body_text())]
    Body(#[from] BytesRejection),
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = match &self {
            IngestError::Validation(_) => StatusCode::BAD_REQUEST,
            IngestError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            IngestError::Body(rejection) => rejection.status(),
        };
        let reply = Reply {
            msg: self.to_string(),
        };
        (status, Json(reply)).into_response()
    }
}

/// Ingestion handler, mounted on `/` for every method.
///
/// # Responses
///
/// | request                                  | status | `msg`                                 |
/// |------------------------------------------|--------|---------------------------------------|
/// | method other than POST                   | 400    | `Non-POST methods not supported`      |
/// | content type not `application/json`     | 400    | `Expected application/json request`   |
/// | body over the size limit                 | 413    | the rejection text                    |
/// | body is not valid JSON                   | 400    | `Malformed JSON`                      |
///
/// Method and content type are checked before the body is read, so a
/// rejected request never has its body buffered.
/// | JSON but not an array (permissive mode)  | 200    | `ok` (ping, nothing stored)           |
/// | JSON but not an array (strict mode)      | 400    | `Expected JSON array`                 |
/// | JSON array, stored                       | 200    | `ok`                                  |
/// | JSON array, storage failed               | 500    | the storage error                     |
pub async fn ingest_handler<S: StorageProvider>(
    State(state): State<AppState<S>>,
    request: Request,
) -> Result<Json<Reply>, IngestError> {
    check_head(request.method(), request.headers())?;
    let body = Bytes::from_request(request, &()).await?;
    let payload = parse_json(&body)?;

    let events = match payload {
        Value::Array(events) => events,
        other => {
            return match state.ingest_mode() {
                IngestMode::Permissive => {
                    debug!("Received ping");
                    state.forward_ping(other);
                    Ok(Json(Reply::ok()))
                }
                IngestMode::Strict => Err(ValidationError::NotArray.into()),
            };
        }
    };

    let batch = Batch::new(events);
    let id = state.storage().store(&batch).await.map_err(|e| {
        warn!(error = %e, events = batch.len(), "Failed to store batch");
        e
    })?;

    info!(batch_id = %id, events = batch.len(), "Stored batch");
    state.batch_stored();

    Ok(Json(Reply::ok()))
}

/// Checks method, then content type.
fn check_head(method: &Method, headers: &HeaderMap) -> Result<(), ValidationError> {
    if method != Method::POST {
        return Err(ValidationError::MethodNotPost);
    }
    if !is_json(headers) {
        return Err(ValidationError::NotJson);
    }
    Ok(())
}

fn parse_json(body: &[u8]) -> Result<Value, ValidationError> {
    serde_json::from_slice(body).map_err(|_| ValidationError::MalformedJson)
}

/// True if the media type essence is `application/json`, ignoring case and
/// parameters such as `charset`.
fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case("application/json"))
}
