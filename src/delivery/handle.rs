//! The in-flight batch handle given to consumers.
//!
//! A handle carries a checked-out record and a channel back to the pump that
//! delivered it. Settling the handle (release, requeue, or retain) sends the
//! outcome to the pump, which performs the storage call. Routing every
//! acknowledgment through the pump keeps storage deletes ordered with
//! retrieves and lets shutdown account for every outstanding handle.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::storage::StorageError;
use crate::types::{Batch, BatchId, StoredBatch};

/// Errors returned by [`InFlightBatch::release`].
#[derive(Debug, Error)]
pub enum ReleaseError {
    /// The storage provider failed to delete the record.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The pump stopped before it could process the release.
    #[error("delivery pipeline stopped before batch {0} could be released")]
    PipelineStopped(BatchId),
}

/// A settlement sent from a handle back to its pump.
#[derive(Debug)]
pub(crate) enum Ack {
    /// Delete the record and report the outcome.
    Release {
        id: BatchId,
        reply: oneshot::Sender<Result<(), StorageError>>,
    },

    /// Hand the record back so a later retrieve returns it again.
    Requeue { id: BatchId },
}

/// A stored batch handed to a consumer.
///
/// The consumer owns the handle exclusively. It must settle it exactly once:
///
/// - [`release`](Self::release) when processing succeeded,
/// - [`requeue`](Self::requeue) to have it delivered again later,
/// - [`retain`](Self::retain) to leave it in storage untouched.
///
/// Each of these consumes the handle, so double settlement is impossible.
/// Dropping an unsettled handle requeues it.
#[derive(Debug)]
pub struct InFlightBatch {
    record: StoredBatch,
    acks: mpsc::UnboundedSender<Ack>,
    settled: bool,
}

impl InFlightBatch {
    pub(crate) fn new(record: StoredBatch, acks: mpsc::UnboundedSender<Ack>) -> Self {
        InFlightBatch {
            record,
            acks,
            settled: false,
        }
    }

    /// The id assigned when the batch was stored.
    pub fn id(&self) -> &BatchId {
        &self.record.id
    }

    /// The batch exactly as it was received.
    pub fn payload(&self) -> &Batch {
        &self.record.payload
    }

    /// When the batch was stored.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.record.received_at
    }

    /// Acknowledges successful processing and deletes the stored record.
    ///
    /// Resolves once the storage provider has confirmed the deletion.
    ///
    /// # Errors
    ///
    /// - `ReleaseError::Storage` if the provider failed to delete the record.
    ///   The record is still in storage.
    /// - `ReleaseError::PipelineStopped` if the pump has already shut down.
    pub async fn release(mut self) -> Result<(), ReleaseError> {
        self.settled = true;
        let id = self.record.id.clone();
        let (reply, outcome) = oneshot::channel();

        self.acks
            .send(Ack::Release {
                id: id.clone(),
                reply,
            })
            .map_err(|_| ReleaseError::PipelineStopped(id.clone()))?;

        match outcome.await {
            Ok(result) => result.map_err(ReleaseError::Storage),
            Err(_) => Err(ReleaseError::PipelineStopped(id)),
        }
    }

    /// Gives the batch back to storage for redelivery on a later pump cycle.
    pub fn requeue(mut self) {
        self.settled = true;
        self.send_requeue();
    }

    /// Gives up the handle while leaving the record in storage, checked out.
    ///
    /// The record is not delivered again until the storage provider is
    /// reopened. This is how fatally failed batches are preserved for
    /// operator inspection.
    pub fn retain(mut self) -> BatchId {
        self.settled = true;
        self.record.id.clone()
    }

    fn send_requeue(&self) {
        let id = self.record.id.clone();
        if self.acks.send(Ack::Requeue { id }).is_err() {
            debug!(
                batch_id = %self.record.id,
                "Pump stopped; batch stays in storage until restart"
            );
        }
    }
}

impl Drop for InFlightBatch {
    fn drop(&mut self) {
        if !self.settled {
            debug!(batch_id = %self.record.id, "Unsettled batch handle dropped; requeueing");
            self.send_requeue();
        }
    }
}
