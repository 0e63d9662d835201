//! In-memory storage provider.
//!
//! Reference implementation of the storage contract. Nothing survives a
//! restart, so it is only suitable for tests, demos, and deployments that
//! explicitly accept losing in-flight batches.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;

use crate::types::{Batch, BatchId, StoredBatch};

use super::{Result, StorageError, StorageProvider};

/// Non-durable storage backed by ordered maps.
///
/// Ids are zero-padded sequence numbers, so ordering the maps by id is the
/// same as ordering by arrival.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    next_seq: u64,
    pending: BTreeMap<BatchId, StoredBatch>,
    checked_out: BTreeMap<BatchId, StoredBatch>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unreleased records, checked out or not.
    pub fn len(&self) -> usize {
        self.lock()
            .map(|inner| inner.pending.len() + inner.checked_out.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of records waiting to be retrieved.
    pub fn pending_len(&self) -> usize {
        self.lock().map(|inner| inner.pending.len()).unwrap_or(0)
    }

    /// Returns true if a record with this id has not been released.
    pub fn contains(&self, id: &BatchId) -> bool {
        self.lock()
            .map(|inner| inner.pending.contains_key(id) || inner.checked_out.contains_key(id))
            .unwrap_or(false)
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| StorageError::Unavailable("memory storage lock poisoned".to_string()))
    }
}

impl StorageProvider for MemoryStorage {
    async fn store(&self, batch: &Batch) -> Result<BatchId> {
        let mut inner = self.lock()?;
        let id = BatchId::new(format!("{:020}", inner.next_seq));
        inner.next_seq += 1;

        let record = StoredBatch::new(id.clone(), batch.clone(), Utc::now());
        inner.pending.insert(id.clone(), record);
        Ok(id)
    }

    async fn retrieve(&self) -> Result<Option<StoredBatch>> {
        let mut inner = self.lock()?;
        let Some((id, record)) = inner.pending.pop_first() else {
            return Ok(None);
        };
        inner.checked_out.insert(id, record.clone());
        Ok(Some(record))
    }

    async fn release(&self, id: &BatchId) -> Result<()> {
        let mut inner = self.lock()?;
        inner.pending.remove(id);
        inner.checked_out.remove(id);
        Ok(())
    }

    async fn requeue(&self, id: &BatchId) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(record) = inner.checked_out.remove(id) {
            inner.pending.insert(id.clone(), record);
        }
        Ok(())
    }
}
