//! Shared test utilities: arbitrary generators, an instrumented storage
//! wrapper, and scripted consumers.

use std::convert::Infallible;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use proptest::prelude::*;
use serde_json::{Value, json};
use tokio::sync::Semaphore;

use crate::delivery::{BatchConsumer, DeliveryError, InFlightBatch};
use crate::storage::{Result, StorageError, StorageProvider};
use crate::types::{Batch, BatchId, StoredBatch};

pub fn arb_event() -> impl Strategy<Value = Value> {
    prop_oneof![
        ("[a-z_]{1,12}", any::<u32>()).prop_map(|(kind, n)| {
            json!({"msys": {"message_event": {"type": kind, "n": n}}})
        }),
        "[a-zA-Z0-9 ]{0,30}".prop_map(Value::String),
        any::<i64>().prop_map(|n| json!(n)),
        Just(Value::Null),
        Just(json!({})),
    ]
}

pub fn arb_batch() -> impl Strategy<Value = Batch> {
    prop::collection::vec(arb_event(), 0..6).prop_map(Batch::new)
}

/// Runs a future to completion on a fresh current-thread runtime.
///
/// For proptest bodies, which are synchronous.
pub fn block_on<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

// ─── Instrumented storage ───────────────────────────────────────────────────

/// Wraps a storage provider, counting calls and injecting failures.
#[derive(Debug)]
pub struct RecordingStorage<S> {
    inner: S,
    stores: AtomicUsize,
    retrieves: AtomicUsize,
    releases: AtomicUsize,
    requeues: AtomicUsize,
    retrieves_in_flight: AtomicUsize,
    max_retrieves_in_flight: AtomicUsize,
    fail_store: AtomicBool,
    fail_release: AtomicBool,
    failing_retrieves: AtomicUsize,
    retrieve_delay: Mutex<Duration>,
    store_gate: Option<Arc<Semaphore>>,
}

impl<S: StorageProvider> RecordingStorage<S> {
    pub fn new(inner: S) -> Self {
        RecordingStorage {
            inner,
            stores: AtomicUsize::new(0),
            retrieves: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            requeues: AtomicUsize::new(0),
            retrieves_in_flight: AtomicUsize::new(0),
            max_retrieves_in_flight: AtomicUsize::new(0),
            fail_store: AtomicBool::new(false),
            fail_release: AtomicBool::new(false),
            failing_retrieves: AtomicUsize::new(0),
            retrieve_delay: Mutex::new(Duration::ZERO),
            store_gate: None,
        }
    }

    /// Makes every store wait for a permit on the returned semaphore.
    pub fn gated(inner: S) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let mut storage = Self::new(inner);
        storage.store_gate = Some(Arc::clone(&gate));
        (storage, gate)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn stores(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }

    pub fn retrieves(&self) -> usize {
        self.retrieves.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn requeues(&self) -> usize {
        self.requeues.load(Ordering::SeqCst)
    }

    /// Highest number of retrieve calls ever observed running at once.
    pub fn max_retrieves_in_flight(&self) -> usize {
        self.max_retrieves_in_flight.load(Ordering::SeqCst)
    }

    pub fn fail_stores(&self, fail: bool) {
        self.fail_store.store(fail, Ordering::SeqCst);
    }

    pub fn fail_releases(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `n` retrieve calls fail.
    pub fn fail_next_retrieves(&self, n: usize) {
        self.failing_retrieves.store(n, Ordering::SeqCst);
    }

    pub fn slow_retrieves(&self, delay: Duration) {
        *self.retrieve_delay.lock().unwrap() = delay;
    }
}

impl<S: StorageProvider> StorageProvider for RecordingStorage<S> {
    async fn store(&self, batch: &Batch) -> Result<BatchId> {
        if let Some(gate) = &self.store_gate {
            gate.acquire()
                .await
                .map_err(|_| StorageError::Unavailable("gate closed".to_string()))?
                .forget();
        }
        self.stores.fetch_add(1, Ordering::SeqCst);
        if self.fail_store.load(Ordering::SeqCst) {
            return Err(StorageError::WriteFailed("injected store failure".to_string()));
        }
        self.inner.store(batch).await
    }

    async fn retrieve(&self) -> Result<Option<StoredBatch>> {
        self.retrieves.fetch_add(1, Ordering::SeqCst);
        let now = self.retrieves_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_retrieves_in_flight
            .fetch_max(now, Ordering::SeqCst);

        let delay = *self.retrieve_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let injected = self
            .failing_retrieves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let result = if injected {
            Err(StorageError::ReadFailed("injected retrieve failure".to_string()))
        } else {
            self.inner.retrieve().await
        };

        self.retrieves_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn release(&self, id: &BatchId) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(StorageError::DeleteFailed {
                id: id.clone(),
                reason: "injected release failure".to_string(),
            });
        }
        self.inner.release(id).await
    }

    async fn requeue(&self, id: &BatchId) -> Result<()> {
        self.requeues.fetch_add(1, Ordering::SeqCst);
        self.inner.requeue(id).await
    }
}

// ─── Scripted consumers ─────────────────────────────────────────────────────

/// A consumer whose `on_batch` fails a fixed number of times before
/// succeeding, recording everything it sees.
#[derive(Debug, Default)]
pub struct ScriptedConsumer {
    failures_left: AtomicUsize,
    calls: Mutex<Vec<BatchId>>,
    pings: Mutex<Vec<Value>>,
    errors: Mutex<Vec<String>>,
}

impl ScriptedConsumer {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn failing_first(n: usize) -> Self {
        ScriptedConsumer {
            failures_left: AtomicUsize::new(n),
            ..Self::default()
        }
    }

    pub fn always_failing() -> Self {
        Self::failing_first(usize::MAX)
    }

    /// Ids passed to `on_batch`, one entry per call.
    pub fn calls(&self) -> Vec<BatchId> {
        self.calls.lock().unwrap().clone()
    }

    pub fn pings(&self) -> Vec<Value> {
        self.pings.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

/// Failure reported by [`ScriptedConsumer`].
#[derive(Debug, thiserror::Error)]
#[error("scripted failure")]
pub struct ScriptedFailure;

impl BatchConsumer for ScriptedConsumer {
    type Error = ScriptedFailure;

    async fn on_batch(&self, batch: &InFlightBatch) -> std::result::Result<(), ScriptedFailure> {
        self.calls.lock().unwrap().push(batch.id().clone());
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed { Err(ScriptedFailure) } else { Ok(()) }
    }

    async fn on_ping(&self, payload: &Value) {
        self.pings.lock().unwrap().push(payload.clone());
    }

    async fn on_error(&self, error: &DeliveryError) {
        self.errors.lock().unwrap().push(error.to_string());
    }
}

/// Never fails; used where the consumer's behaviour is irrelevant.
#[derive(Debug, Default)]
pub struct NoopConsumer;

impl BatchConsumer for NoopConsumer {
    type Error = Infallible;

    async fn on_batch(&self, _batch: &InFlightBatch) -> std::result::Result<(), Infallible> {
        Ok(())
    }
}
