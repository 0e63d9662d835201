//! The consumer seam: application code that processes delivered batches.

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info};

use super::{DeliveryError, InFlightBatch};

/// Application-side processing of delivered batches.
///
/// The delivery controller owns acknowledgment: it releases the batch when
/// `on_batch` returns `Ok`, and applies the configured retry strategy when it
/// returns `Err`. Implementations only inspect the batch.
pub trait BatchConsumer: Send + Sync + 'static {
    /// Why processing a batch failed.
    type Error: fmt::Display + Send;

    /// Processes one batch.
    fn on_batch(
        &self,
        batch: &InFlightBatch,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Observes a non-array payload accepted by the ingestion endpoint.
    fn on_ping(&self, payload: &Value) -> impl Future<Output = ()> + Send {
        let _ = payload;
        async {}
    }

    /// Observes a fatal delivery error just before the pipeline stops.
    fn on_error(&self, error: &DeliveryError) -> impl Future<Output = ()> + Send {
        let _ = error;
        async {}
    }
}

impl<C: BatchConsumer> BatchConsumer for Arc<C> {
    type Error = C::Error;

    fn on_batch(
        &self,
        batch: &InFlightBatch,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        (**self).on_batch(batch)
    }

    fn on_ping(&self, payload: &Value) -> impl Future<Output = ()> + Send {
        (**self).on_ping(payload)
    }

    fn on_error(&self, error: &DeliveryError) -> impl Future<Output = ()> + Send {
        (**self).on_error(error)
    }
}

/// Logs every batch and ping, and accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingConsumer;

impl LoggingConsumer {
    pub fn new() -> Self {
        LoggingConsumer
    }
}

impl BatchConsumer for LoggingConsumer {
    type Error = Infallible;

    async fn on_batch(&self, batch: &InFlightBatch) -> Result<(), Infallible> {
        info!(
            batch_id = %batch.id(),
            events = batch.payload().len(),
            received_at = %batch.received_at(),
            "Processing batch"
        );
        Ok(())
    }

    async fn on_ping(&self, payload: &Value) {
        info!(payload = %payload, "Received ping");
    }

    async fn on_error(&self, err: &DeliveryError) {
        error!(batch_id = %err.batch_id(), error = %err, "Delivery halted");
    }
}
