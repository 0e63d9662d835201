//! Storage error taxonomy.
//!
//! Every provider reports failures through [`StorageError`], regardless of
//! the medium underneath. The variant decides how the rest of the pipeline
//! reacts: write failures become 5xx responses during ingestion, read failures
//! make the delivery pump back off, and delete failures after a successful
//! verdict are escalated as inconsistent state.

use std::io;

use thiserror::Error;

use crate::types::BatchId;

/// Errors reported by a storage provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The durable medium could not be reached at all.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A record could not be read back.
    #[error("failed to read batch: {0}")]
    ReadFailed(String),

    /// A batch could not be durably written.
    #[error("failed to store batch: {0}")]
    WriteFailed(String),

    /// A record could not be deleted.
    #[error("failed to delete batch {id}: {reason}")]
    DeleteFailed { id: BatchId, reason: String },
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Which storage operation an IO error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StorageOp<'a> {
    Write,
    Read,
    Delete(&'a BatchId),
}

impl StorageError {
    /// Classifies an IO error from the given operation.
    ///
    /// Missing or inaccessible storage locations are reported as
    /// `Unavailable`; everything else maps to the operation's own variant.
    pub(crate) fn from_io(op: StorageOp<'_>, err: &io::Error) -> Self {
        if matches!(
            err.kind(),
            io::ErrorKind::PermissionDenied | io::ErrorKind::NotConnected
        ) {
            return StorageError::Unavailable(err.to_string());
        }

        match op {
            StorageOp::Write => StorageError::WriteFailed(err.to_string()),
            StorageOp::Read => StorageError::ReadFailed(err.to_string()),
            StorageOp::Delete(id) => StorageError::DeleteFailed {
                id: id.clone(),
                reason: err.to_string(),
            },
        }
    }

    /// Returns true if the medium itself could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}
