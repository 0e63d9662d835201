//! Durable batch storage.
//!
//! A [`StorageProvider`] maps opaque batch ids to batch payloads. The
//! ingestion handler writes through it and the delivery pump reads and deletes
//! through it. It is the only shared mutable resource in the pipeline.
//!
//! # Contract
//!
//! - `store` returns only once the record is durably committed.
//! - `retrieve` returns the oldest record that is neither released nor
//!   checked out, and checks it out. Selection is strict FIFO by arrival order
//!   for every provider.
//! - `release` deletes a record. Releasing an unknown id succeeds.
//! - `requeue` hands a checked-out record back so a later `retrieve` returns
//!   it again, at its original position.
//!
//! Checkouts live in process memory. Reopening a provider makes every
//! unreleased record eligible again, which is what gives at-least-once
//! delivery across crashes.
//!
//! # Providers
//!
//! - [`MemoryStorage`]: reference implementation, not durable.
//! - [`SpoolStorage`]: one file per batch in a spool directory.

use std::future::Future;
use std::sync::Arc;

use crate::types::{Batch, BatchId, StoredBatch};

#[cfg(test)]
pub(crate) mod conformance;
pub mod error;
pub mod memory;
pub mod spool;

pub use error::{Result, StorageError};
pub use memory::MemoryStorage;
pub use spool::SpoolStorage;

/// Durable mapping from batch ids to batch payloads.
///
/// Implementations must tolerate interleaved calls from the ingestion handler
/// and the delivery pump without corrupting the pending set. In particular a
/// record being released must never be handed out by a concurrent `retrieve`.
pub trait StorageProvider: Send + Sync + 'static {
    /// Persists a batch and returns its newly assigned id.
    fn store(&self, batch: &Batch) -> impl Future<Output = Result<BatchId>> + Send;

    /// Checks out the oldest pending record, or returns `None` if there is none.
    fn retrieve(&self) -> impl Future<Output = Result<Option<StoredBatch>>> + Send;

    /// Deletes the record with the given id. Idempotent.
    fn release(&self, id: &BatchId) -> impl Future<Output = Result<()>> + Send;

    /// Returns a checked-out record to the pending set. Idempotent.
    fn requeue(&self, id: &BatchId) -> impl Future<Output = Result<()>> + Send;
}

impl<S: StorageProvider> StorageProvider for Arc<S> {
    fn store(&self, batch: &Batch) -> impl Future<Output = Result<BatchId>> + Send {
        (**self).store(batch)
    }

    fn retrieve(&self) -> impl Future<Output = Result<Option<StoredBatch>>> + Send {
        (**self).retrieve()
    }

    fn release(&self, id: &BatchId) -> impl Future<Output = Result<()>> + Send {
        (**self).release(id)
    }

    fn requeue(&self, id: &BatchId) -> impl Future<Output = Result<()>> + Send {
        (**self).requeue(id)
    }
}
