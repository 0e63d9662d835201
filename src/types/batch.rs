//! Batch payloads and stored batch records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::BatchId;

/// An ordered sequence of webhook event records received in one request.
///
/// The pipeline never looks inside the events; it only needs them to be
/// serializable so storage backends can persist them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Batch(pub Vec<Value>);

impl Batch {
    pub fn new(events: Vec<Value>) -> Self {
        Batch(events)
    }

    /// Interprets a parsed request body as a batch.
    ///
    /// Returns `None` for anything that is not a JSON array. Such payloads are
    /// pings, not batches.
    pub fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Array(events) => Some(Batch(events)),
            _ => None,
        }
    }

    pub fn events(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_events(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Batch {
    fn from(events: Vec<Value>) -> Self {
        Batch(events)
    }
}

/// A batch as held by a storage provider.
///
/// The record exists from the moment `store` returns successfully until
/// `release` for its id returns successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredBatch {
    /// Identifier assigned by the provider at store time.
    pub id: BatchId,

    /// The batch exactly as it was accepted.
    pub payload: Batch,

    /// When the provider accepted the batch.
    pub received_at: DateTime<Utc>,
}

impl StoredBatch {
    pub fn new(id: BatchId, payload: Batch, received_at: DateTime<Utc>) -> Self {
        StoredBatch {
            id,
            payload,
            received_at,
        }
    }
}
