//! The delivery pump.
//!
//! A single task that moves records from storage to the consumer, driven by
//! consumer demand:
//!
//! 1. Wait until the consumer has room for another batch (a free slot in the
//!    bounded stream channel).
//! 2. Retrieve one record. Only one retrieve is ever outstanding.
//! 3. If storage is empty, park until an ingest wakes the pump or the poll
//!    interval elapses. If storage fails, back off exponentially.
//! 4. Hand the record to the consumer wrapped in an [`InFlightBatch`].
//!
//! Settlements from outstanding handles are applied between steps, so every
//! storage call is made from this one task.
//!
//! # Shutdown
//!
//! On cancellation the pump stops retrieving and closes the stream. It keeps
//! applying settlements until every outstanding handle is gone or the grace
//! period elapses; releases arriving after that fail with
//! `ReleaseError::PipelineStopped`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::storage::StorageProvider;

use super::backoff::Backoff;
use super::handle::{Ack, InFlightBatch};

/// Default number of batches the pump may hand over ahead of the consumer.
pub const DEFAULT_DEMAND_WINDOW: usize = 1;

/// Default fallback interval for re-checking empty storage.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default time the pump waits for outstanding handles at shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Pump tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct PumpConfig {
    /// Capacity of the stream channel. With the default of 1, at most one
    /// batch is retrieved ahead of the consumer asking for it.
    pub demand_window: usize,

    /// How long to park on empty storage before checking again without a
    /// wake-up. Covers records stored by another process.
    pub poll_interval: Duration,

    /// Delays between consecutive failed retrieves.
    pub retrieve_backoff: Backoff,

    /// How long to keep serving settlements after shutdown.
    pub shutdown_grace: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        PumpConfig {
            demand_window: DEFAULT_DEMAND_WINDOW,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retrieve_backoff: Backoff::DEFAULT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// The consumer's end of the pump: a demand-driven stream of batches.
///
/// Each call to [`recv`](Self::recv) frees a slot, which is the demand signal
/// the pump waits for. Dropping the stream stops the pump; any batches still
/// buffered are requeued.
#[derive(Debug)]
pub struct BatchStream {
    rx: mpsc::Receiver<InFlightBatch>,
}

impl BatchStream {
    /// Waits for the next batch. Returns `None` once the pump has stopped and
    /// every buffered batch has been handed out.
    pub async fn recv(&mut self) -> Option<InFlightBatch> {
        self.rx.recv().await
    }

    /// Takes a batch if one is already buffered.
    pub fn try_recv(&mut self) -> Option<InFlightBatch> {
        self.rx.try_recv().ok()
    }
}

enum Flow {
    Continue,
    Stop,
}

/// The pump task. Create with [`Pump::new`] and drive with [`Pump::run`].
pub struct Pump<S> {
    storage: Arc<S>,
    wake: Arc<Notify>,
    config: PumpConfig,
    tx: Option<mpsc::Sender<InFlightBatch>>,
    acks_tx: Option<mpsc::UnboundedSender<Ack>>,
    acks_rx: mpsc::UnboundedReceiver<Ack>,
    shutdown: CancellationToken,
    consecutive_failures: u32,
}

impl<S: StorageProvider> Pump<S> {
    /// Creates a pump and the stream it feeds.
    ///
    /// `wake` is notified by the ingestion side after every successful store.
    pub fn new(
        storage: Arc<S>,
        wake: Arc<Notify>,
        config: PumpConfig,
        shutdown: CancellationToken,
    ) -> (Self, BatchStream) {
        let (tx, rx) = mpsc::channel(config.demand_window.max(1));
        let (acks_tx, acks_rx) = mpsc::unbounded_channel();
        let pump = Pump {
            storage,
            wake,
            config,
            tx: Some(tx),
            acks_tx: Some(acks_tx),
            acks_rx,
            shutdown,
            consecutive_failures: 0,
        };
        (pump, BatchStream { rx })
    }

    /// Runs until shutdown or until the stream is dropped.
    pub async fn run(mut self) {
        info!(
            demand_window = self.config.demand_window,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Delivery pump started"
        );

        loop {
            let Some(tx) = self.tx.clone() else { break };

            let permit = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                Some(ack) = self.acks_rx.recv() => {
                    Self::apply(&self.storage, ack).await;
                    continue;
                }

                permit = tx.reserve_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        debug!("Batch stream dropped");
                        break;
                    }
                },
            };

            if let Flow::Stop = self.fill(permit).await {
                break;
            }
        }

        self.drain().await;
        info!("Delivery pump stopped");
    }

    /// Retrieves records until one can be handed over through `permit`.
    async fn fill(&mut self, permit: mpsc::OwnedPermit<InFlightBatch>) -> Flow {
        loop {
            match self.storage.retrieve().await {
                Ok(Some(record)) => {
                    self.consecutive_failures = 0;
                    let Some(acks) = self.acks_tx.clone() else {
                        return Flow::Stop;
                    };
                    debug!(batch_id = %record.id, "Delivering batch");
                    permit.send(InFlightBatch::new(record, acks));
                    return Flow::Continue;
                }
                Ok(None) => {
                    self.consecutive_failures = 0;
                    let interval = self.config.poll_interval;
                    if let Flow::Stop = self.park(interval, true).await {
                        return Flow::Stop;
                    }
                }
                Err(e) => {
                    let delay = self
                        .config
                        .retrieve_backoff
                        .delay_for_attempt(self.consecutive_failures);
                    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                    warn!(
                        error = %e,
                        failures = self.consecutive_failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to retrieve batch"
                    );
                    if let Flow::Stop = self.park(delay, false).await {
                        return Flow::Stop;
                    }
                }
            }
        }
    }

    /// Waits for `timeout`, a wake-up (if `wakeable`), or a requeue that made
    /// a record available again. Settlements are applied while parked.
    async fn park(&mut self, timeout: Duration, wakeable: bool) -> Flow {
        let Some(tx) = self.tx.clone() else {
            return Flow::Stop;
        };
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => return Flow::Stop,

                _ = tx.closed() => {
                    debug!("Batch stream dropped while parked");
                    return Flow::Stop;
                }

                Some(ack) = self.acks_rx.recv() => {
                    if Self::apply(&self.storage, ack).await && wakeable {
                        return Flow::Continue;
                    }
                }

                _ = self.wake.notified(), if wakeable => return Flow::Continue,

                _ = &mut sleep => return Flow::Continue,
            }
        }
    }

    /// Closes the stream and serves settlements from outstanding handles.
    async fn drain(&mut self) {
        // Buffered batches are dropped with the channel once the consumer
        // side goes away, which requeues them through the ack channel.
        self.tx = None;
        self.acks_tx = None;

        let storage = Arc::clone(&self.storage);
        let acks_rx = &mut self.acks_rx;
        let settle = async {
            while let Some(ack) = acks_rx.recv().await {
                Self::apply(&storage, ack).await;
            }
        };

        if tokio::time::timeout(self.config.shutdown_grace, settle)
            .await
            .is_err()
        {
            warn!(
                grace_ms = self.config.shutdown_grace.as_millis() as u64,
                "Batches still outstanding after shutdown grace period"
            );
        }

        self.acks_rx.close();
        while let Ok(ack) = self.acks_rx.try_recv() {
            Self::apply(&self.storage, ack).await;
        }
    }

    /// Applies one settlement. Returns true if a record became available for
    /// retrieval again.
    async fn apply(storage: &S, ack: Ack) -> bool {
        match ack {
            Ack::Release { id, reply } => {
                let result = storage.release(&id).await;
                match &result {
                    Ok(()) => debug!(batch_id = %id, "Released batch"),
                    Err(e) => error!(batch_id = %id, error = %e, "Failed to release batch"),
                }
                // The handle's owner may have stopped waiting.
                let _ = reply.send(result);
                false
            }
            Ack::Requeue { id } => match storage.requeue(&id).await {
                Ok(()) => {
                    debug!(batch_id = %id, "Requeued batch");
                    true
                }
                Err(e) => {
                    error!(
                        batch_id = %id,
                        error = %e,
                        "Failed to requeue batch; it stays checked out until restart"
                    );
                    false
                }
            },
        }
    }
}
