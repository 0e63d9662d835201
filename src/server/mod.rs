//! HTTP surface of the webhook endpoint.
//!
//! # Endpoints
//!
//! - `POST /` - Accepts a JSON batch and stores it before answering 200
//! - `GET /health` - Returns 200 if the server is running
//!
//! Any other method on `/` gets the 400 described in [`ingest_handler`].

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{any, get};
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tracing::debug;

use crate::config::IngestMode;
use crate::storage::StorageProvider;

pub mod health;
pub mod ingest;

pub use health::health_handler;
pub use ingest::{IngestError, Reply, ValidationError, ingest_handler};

/// Shared application state, handed to handlers via axum's `State`
/// extractor.
pub struct AppState<S> {
    inner: Arc<AppStateInner<S>>,
}

struct AppStateInner<S> {
    storage: Arc<S>,

    /// Notified after every successful store so a parked pump retrieves
    /// immediately.
    wake: Arc<Notify>,

    /// Non-array payloads on their way to the consumer's `on_ping`.
    pings: mpsc::Sender<Value>,

    mode: IngestMode,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        AppState {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: StorageProvider> AppState<S> {
    pub fn new(
        storage: Arc<S>,
        wake: Arc<Notify>,
        pings: mpsc::Sender<Value>,
        mode: IngestMode,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                storage,
                wake,
                pings,
                mode,
            }),
        }
    }

    pub fn storage(&self) -> &S {
        &self.inner.storage
    }

    pub fn ingest_mode(&self) -> IngestMode {
        self.inner.mode
    }

    /// Wakes the delivery pump. Safe to call with no pump running: the
    /// notification is kept until someone waits.
    pub(crate) fn batch_stored(&self) {
        self.inner.wake.notify_one();
    }

    /// Passes a ping on without ever blocking the request.
    pub(crate) fn forward_ping(&self, payload: Value) {
        if let Err(e) = self.inner.pings.try_send(payload) {
            debug!(reason = %e, "Dropping ping notification");
        }
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router<S: StorageProvider>(app_state: AppState<S>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/", any(ingest_handler::<S>))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(app_state)
}
