//! Core domain types for the webhook endpoint.
//!
//! Batches flow through the pipeline as opaque JSON arrays; the only structure
//! the pipeline relies on is the batch id assigned at store time.

pub mod batch;
pub mod ids;

pub use batch::{Batch, StoredBatch};
pub use ids::BatchId;
