//! Webhook Endpoint - durable ingestion and demand-driven delivery of JSON
//! event batches.
//!
//! Batches arrive over HTTP, are stored through a [`storage::StorageProvider`]
//! before the sender is acknowledged, and are delivered to application code
//! one at a time as it asks for them. A batch leaves storage only when the
//! application releases it.

pub mod config;
pub mod delivery;
pub mod endpoint;
pub mod server;
pub mod storage;
pub mod types;

#[cfg(test)]
pub mod test_utils;
