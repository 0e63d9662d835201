//! Moving stored batches to the application.
//!
//! - [`Pump`] pulls records from storage one at a time as the consumer asks
//!   for them, and hands them out as [`InFlightBatch`] handles on a
//!   [`BatchStream`].
//! - [`Controller`] drives a [`BatchConsumer`] from that stream, releasing
//!   processed batches and retrying failed ones according to a
//!   [`DeliveryStrategy`].
//!
//! Applications that want to acknowledge batches themselves can read the
//! [`BatchStream`] directly instead of running a controller.

pub mod backoff;
pub mod consumer;
pub mod controller;
pub mod handle;
pub mod pump;

pub use backoff::Backoff;
pub use consumer::{BatchConsumer, LoggingConsumer};
pub use controller::{
    Controller, DEFAULT_MAX_ATTEMPTS, DEFAULT_REDELIVERY_DELAY, DeliveryError, DeliveryStrategy,
    DispatchState, RetryState,
};
pub use handle::{InFlightBatch, ReleaseError};
pub use pump::{BatchStream, Pump, PumpConfig};
