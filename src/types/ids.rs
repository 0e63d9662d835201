//! Newtype wrapper for batch identifiers.
//!
//! Batch ids are assigned by the storage provider at store time and are the
//! only handle used to release a stored batch. They are opaque to everything
//! else in the pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a stored batch.
///
/// Unique for the lifetime of the record it names. Providers may reuse an id
/// once its record has been released.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub String);

impl BatchId {
    pub fn new(s: impl Into<String>) -> Self {
        BatchId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for BatchId {
    fn from(s: String) -> Self {
        BatchId(s)
    }
}

impl From<&str> for BatchId {
    fn from(s: &str) -> Self {
        BatchId(s.to_string())
    }
}
