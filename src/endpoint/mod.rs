//! Wiring: one storage provider, one HTTP router, one delivery pipeline.
//!
//! ```ignore
//! let mut endpoint = EndpointBuilder::new()
//!     .storage(SpoolStorage::open("/var/spool/webhooks")?)
//!     .config(EndpointConfig::from_env()?)
//!     .build()?;
//! endpoint.spawn_delivery(MyConsumer::new())?;
//! endpoint.serve(TcpListener::bind(addr).await?).await?;
//! ```
//!
//! Delivery is started at most once per endpoint, either as a controller
//! driving a [`BatchConsumer`] or as a raw [`BatchStream`] the caller reads.
//! Batches stored before delivery starts wait in storage.

use std::sync::Arc;

use axum::Router;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{ConfigError, EndpointConfig};
use crate::delivery::{BatchConsumer, BatchStream, Controller, DeliveryError, Pump};
use crate::server::{AppState, build_router};
use crate::storage::{StorageError, StorageProvider};


/// Errors from [`EndpointBuilder::build`].
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no storage provider configured")]
    MissingStorage,

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

/// Errors running an endpoint.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),

    #[error("delivery has already been started for this endpoint")]
    DeliveryAlreadyStarted,

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("delivery task failed: {0}")]
    TaskFailed(String),
}

/// Assembles a [`WebhookEndpoint`].
#[derive(Debug)]
pub struct EndpointBuilder<S> {
    storage: Option<Arc<S>>,
    config: EndpointConfig,
}

impl<S: StorageProvider> Default for EndpointBuilder<S> {
    fn default() -> Self {
        EndpointBuilder {
            storage: None,
            config: EndpointConfig::default(),
        }
    }
}

impl<S: StorageProvider> EndpointBuilder<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn storage(self, storage: S) -> Self {
        self.shared_storage(Arc::new(storage))
    }

    /// Uses a provider the caller keeps a handle to.
    pub fn shared_storage(mut self, storage: Arc<S>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    /// # Errors
    ///
    /// `MissingStorage` if no provider was given; there is no implicit
    /// fallback. `InvalidConfig` if the configuration fails validation.
    pub fn build(self) -> Result<WebhookEndpoint<S>, BuildError> {
        let storage = self.storage.ok_or(BuildError::MissingStorage)?;
        self.config.validate()?;

        let wake = Arc::new(Notify::new());
        let (ping_tx, ping_rx) = mpsc::channel(self.config.ping_buffer);
        let state = AppState::new(
            Arc::clone(&storage),
            Arc::clone(&wake),
            ping_tx,
            self.config.ingest_mode,
        );

        Ok(WebhookEndpoint {
            storage,
            config: self.config,
            wake,
            state,
            shutdown: CancellationToken::new(),
            pings: Some(ping_rx),
            pump: None,
            controller: None,
        })
    }
}

/// A running (or ready to run) webhook endpoint.
///
/// Dropping the endpoint cancels its shutdown token; call
/// [`close`](Self::close) instead to wait for delivery to wind down.
pub struct WebhookEndpoint<S> {
    storage: Arc<S>,
    config: EndpointConfig,
    wake: Arc<Notify>,
    state: AppState<S>,
    shutdown: CancellationToken,
    pings: Option<mpsc::Receiver<Value>>,
    pump: Option<JoinHandle<()>>,
    controller: Option<JoinHandle<Result<(), DeliveryError>>>,
}

impl<S: StorageProvider> WebhookEndpoint<S> {
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// The token that stops the server and the delivery pipeline. Fatal
    /// delivery errors cancel it too.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The ingestion router, for embedding in a larger application or for
    /// serving manually.
    pub fn router(&self) -> Router {
        build_router(self.state.clone(), self.config.max_body_bytes)
    }

    /// Starts the pump and returns its stream for manual acknowledgment.
    ///
    /// Pings are discarded in this mode. Drop the stream before
    /// [`close`](Self::close), or buffered batches hold shutdown up for the
    /// grace period.
    pub fn batch_stream(&mut self) -> Result<BatchStream, EndpointError> {
        let stream = self.start_pump()?;
        self.pings = None;
        Ok(stream)
    }

    /// Starts the pump and a controller driving `consumer` with the
    /// configured delivery strategy.
    pub fn spawn_delivery<C: BatchConsumer>(&mut self, consumer: C) -> Result<(), EndpointError> {
        let stream = self.start_pump()?;
        let mut controller = Controller::new(
            consumer,
            self.config.strategy,
            stream,
            self.shutdown.clone(),
        );
        if let Some(pings) = self.pings.take() {
            controller = controller.with_pings(pings);
        }
        self.controller = Some(tokio::spawn(controller.run()));
        Ok(())
    }

    fn start_pump(&mut self) -> Result<BatchStream, EndpointError> {
        if self.pump.is_some() {
            return Err(EndpointError::DeliveryAlreadyStarted);
        }
        let (pump, stream) = Pump::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.wake),
            self.config.pump.clone(),
            self.shutdown.clone(),
        );
        self.pump = Some(tokio::spawn(pump.run()));
        Ok(stream)
    }

    /// Serves HTTP on `listener` until the shutdown token is cancelled, then
    /// closes the endpoint.
    ///
    /// In-flight requests finish before the server stops; new connections
    /// are refused.
    ///
    /// # Errors
    ///
    /// The fatal delivery error that stopped the endpoint, if any, otherwise
    /// any server I/O error.
    pub async fn serve(self, listener: TcpListener) -> Result<(), EndpointError> {
        let addr = listener.local_addr()?;
        info!(%addr, "Webhook endpoint listening");

        let shutdown = self.shutdown.clone();
        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;

        let closed = self.close().await;
        closed?;
        served?;
        Ok(())
    }

    /// Stops delivery and waits for the pump and controller to finish.
    ///
    /// The controller completes the batch it is dispatching; the pump then
    /// applies outstanding settlements, bounded by the shutdown grace period.
    pub async fn close(mut self) -> Result<(), EndpointError> {
        self.shutdown.cancel();
        let mut result = Ok(());

        if let Some(controller) = self.controller.take() {
            match controller.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => result = Err(EndpointError::Delivery(e)),
                Err(e) => {
                    error!(error = %e, "Delivery controller task failed");
                    result = Err(EndpointError::TaskFailed(e.to_string()));
                }
            }
        }

        if let Some(pump) = self.pump.take()
            && let Err(e) = pump.await
        {
            error!(error = %e, "Delivery pump task failed");
            if result.is_ok() {
                result = Err(EndpointError::TaskFailed(e.to_string()));
            }
        }

        info!("Webhook endpoint closed");
        result
    }
}

impl<S> Drop for WebhookEndpoint<S> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
