//! Acknowledgment and retry control.
//!
//! The controller sits between the pump and a [`BatchConsumer`]. For each
//! batch it dispatches to the consumer and then settles the handle:
//!
//! | consumer result | strategy            | action                                   |
//! |-----------------|---------------------|------------------------------------------|
//! | `Ok`            | any                 | release; failure is `InconsistentState`  |
//! | `Err`           | `PullRedeliver`     | requeue, wait `redelivery_delay`         |
//! | `Err`           | `BoundedPushRetry`  | redispatch, up to `max_attempts` total   |
//! | `Err` (last)    | `BoundedPushRetry`  | retain in storage, `DispatchFailure`     |
//!
//! Both error variants are fatal: the consumer's `on_error` is called, the
//! shared shutdown token is cancelled, and the error is returned from
//! [`Controller::run`].

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::types::BatchId;

use super::consumer::BatchConsumer;
use super::handle::{InFlightBatch, ReleaseError};
use super::pump::BatchStream;

/// Default dispatch limit for [`DeliveryStrategy::BoundedPushRetry`].
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default wait after a failure under [`DeliveryStrategy::PullRedeliver`].
pub const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_secs(1);

/// What to do when the consumer fails a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStrategy {
    /// Return the batch to storage and let the pump deliver it again on a
    /// later cycle. Never escalates.
    PullRedeliver { redelivery_delay: Duration },

    /// Redispatch immediately. `max_attempts` is the total number of
    /// dispatches, so 1 means no retries.
    BoundedPushRetry { max_attempts: u32 },
}

impl Default for DeliveryStrategy {
    fn default() -> Self {
        DeliveryStrategy::BoundedPushRetry {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Fatal delivery errors. Either one stops the pipeline.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The consumer failed the batch on every permitted attempt. The record
    /// is left in storage.
    #[error("batch {batch_id} failed on all {attempts} dispatch attempts: {last_error}")]
    DispatchFailure {
        batch_id: BatchId,
        attempts: u32,
        last_error: String,
    },

    /// The consumer processed the batch but storage could not delete it, so
    /// it may be processed again after a restart.
    #[error("batch {batch_id} was processed but could not be released: {source}")]
    InconsistentState {
        batch_id: BatchId,
        #[source]
        source: ReleaseError,
    },
}

impl DeliveryError {
    pub fn batch_id(&self) -> &BatchId {
        match self {
            DeliveryError::DispatchFailure { batch_id, .. }
            | DeliveryError::InconsistentState { batch_id, .. } => batch_id,
        }
    }
}

/// Where a batch is in its dispatch lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Dispatched,
    Retrying,
    Released,
    Escalated,
}

/// Per-batch attempt bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    attempts: u32,
    state: DispatchState,
}

impl RetryState {
    /// State after the first dispatch.
    pub fn new() -> Self {
        RetryState {
            attempts: 1,
            state: DispatchState::Dispatched,
        }
    }

    /// Dispatches made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Records a failed dispatch. Escalates once `max_attempts` dispatches
    /// have all failed.
    pub fn fail(&mut self, max_attempts: u32) -> DispatchState {
        self.state = if self.attempts >= max_attempts {
            DispatchState::Escalated
        } else {
            DispatchState::Retrying
        };
        self.state
    }

    pub fn redispatch(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
        self.state = DispatchState::Dispatched;
    }

    pub fn release(&mut self) {
        self.state = DispatchState::Released;
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives a consumer from a batch stream.
pub struct Controller<C> {
    consumer: C,
    strategy: DeliveryStrategy,
    stream: BatchStream,
    pings: Option<mpsc::Receiver<Value>>,
    shutdown: CancellationToken,
}

impl<C: BatchConsumer> Controller<C> {
    pub fn new(
        consumer: C,
        strategy: DeliveryStrategy,
        stream: BatchStream,
        shutdown: CancellationToken,
    ) -> Self {
        Controller {
            consumer,
            strategy,
            stream,
            pings: None,
            shutdown,
        }
    }

    /// Forwards non-array payloads from the ingestion side to `on_ping`.
    pub fn with_pings(mut self, pings: mpsc::Receiver<Value>) -> Self {
        self.pings = Some(pings);
        self
    }

    /// Processes batches until shutdown, the stream ends, or a fatal error.
    ///
    /// A batch already being dispatched when shutdown is requested is
    /// finished first.
    pub async fn run(mut self) -> Result<(), DeliveryError> {
        info!(strategy = ?self.strategy, "Delivery controller started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested; delivery controller stopping");
                    break;
                }

                Some(ping) = next_ping(&mut self.pings) => {
                    self.consumer.on_ping(&ping).await;
                }

                batch = self.stream.recv() => {
                    let Some(batch) = batch else {
                        debug!("Batch stream ended");
                        break;
                    };
                    if let Err(e) = self.dispatch(batch).await {
                        error!(batch_id = %e.batch_id(), error = %e, "Fatal delivery error");
                        self.consumer.on_error(&e).await;
                        self.shutdown.cancel();
                        return Err(e);
                    }
                }
            }
        }

        Ok(())
    }

    #[instrument(skip(self, batch), fields(batch_id = %batch.id()))]
    async fn dispatch(&self, batch: InFlightBatch) -> Result<(), DeliveryError> {
        let mut retry = RetryState::new();

        loop {
            debug!(
                attempt = retry.attempts(),
                events = batch.payload().len(),
                "Dispatching batch"
            );

            let err = match self.consumer.on_batch(&batch).await {
                Ok(()) => return self.release(batch, &mut retry).await,
                Err(e) => e,
            };

            match self.strategy {
                DeliveryStrategy::PullRedeliver { redelivery_delay } => {
                    warn!(
                        batch_id = %batch.id(),
                        error = %err,
                        "Consumer failed batch; returning it to storage"
                    );
                    batch.requeue();
                    self.pause(redelivery_delay).await;
                    return Ok(());
                }
                DeliveryStrategy::BoundedPushRetry { max_attempts } => {
                    if retry.fail(max_attempts) == DispatchState::Escalated {
                        let attempts = retry.attempts();
                        let batch_id = batch.retain();
                        return Err(DeliveryError::DispatchFailure {
                            batch_id,
                            attempts,
                            last_error: err.to_string(),
                        });
                    }
                    warn!(
                        batch_id = %batch.id(),
                        attempt = retry.attempts(),
                        max_attempts,
                        error = %err,
                        "Consumer failed batch; retrying"
                    );
                    tokio::task::yield_now().await;
                    retry.redispatch();
                }
            }
        }
    }

    async fn release(
        &self,
        batch: InFlightBatch,
        retry: &mut RetryState,
    ) -> Result<(), DeliveryError> {
        let batch_id = batch.id().clone();
        match batch.release().await {
            Ok(()) => {
                retry.release();
                debug!(%batch_id, attempts = retry.attempts(), "Batch processed");
                Ok(())
            }
            Err(source) => Err(DeliveryError::InconsistentState { batch_id, source }),
        }
    }

    async fn pause(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn next_ping(pings: &mut Option<mpsc::Receiver<Value>>) -> Option<Value> {
    match pings {
        Some(rx) => {
            let ping = rx.recv().await;
            if ping.is_none() {
                *pings = None;
            }
            ping
        }
        None => std::future::pending().await,
    }
}
