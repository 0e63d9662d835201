//! Filesystem spool storage provider.
//!
//! Each batch is one file in the spool directory:
//!
//! ```text
//! <id>.json          - stored record (id, received_at, payload)
//! <id>.json.tmp      - partially written record, never visible to retrieve
//! <id>.json.corrupt  - record that could not be decoded, kept for inspection
//! ```
//!
//! # Crash Safety
//!
//! - Records are written to a temp file, fsynced, renamed into place, and the
//!   directory is fsynced before `store` returns.
//! - Deletions fsync the directory before `release` returns.
//! - Leftover temp files are removed when the spool is opened.
//! - A record joins the index from the blocking write itself, so a `store`
//!   whose caller goes away mid-write still leaves a retrievable record.
//!
//! # Ordering
//!
//! Ids are 20-digit zero-padded numbers taken from a clock that never runs
//! backwards within a spool (`max(now_micros, last + 1)`). Lexical id order is
//! therefore arrival order, across restarts too. While a write is in progress,
//! records with later ids are held back from `retrieve`, so concurrent stores
//! are still handed out in id order.
//!
//! `.json` files with any other numeric name are quarantined on open.
//!
//! The spool assumes it is the only process using its directory.

use std::collections::{BTreeSet, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::types::{Batch, BatchId, StoredBatch};

use super::error::StorageOp;
use super::{Result, StorageError, StorageProvider};

const RECORD_EXT: &str = "json";
const TEMP_EXT: &str = "json.tmp";
const CORRUPT_EXT: &str = "json.corrupt";

/// Durable storage with one file per batch.
#[derive(Debug, Clone)]
pub struct SpoolStorage {
    dir: Arc<PathBuf>,
    index: Arc<Mutex<SpoolIndex>>,
}

/// In-memory view of the spool directory.
///
/// A record id is in at most one of `writing`, `pending` and `checked_out`.
/// Records are only added to `pending` after their file is durable.
#[derive(Debug, Default)]
struct SpoolIndex {
    pending: BTreeSet<BatchId>,
    checked_out: HashSet<BatchId>,
    /// Ids handed to stores whose write has not finished.
    writing: BTreeSet<BatchId>,
    last_seq: u64,
}

impl SpoolIndex {
    /// Allocates the next id and marks it as being written.
    fn next_id(&mut self) -> Result<BatchId> {
        let now = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
        let next = self.last_seq.checked_add(1).ok_or_else(|| {
            StorageError::WriteFailed("spool id sequence exhausted".to_string())
        })?;
        let seq = now.max(next);
        self.last_seq = seq;

        let id = BatchId::new(format!("{seq:020}"));
        self.writing.insert(id.clone());
        Ok(id)
    }

    fn finish_write(&mut self, id: &BatchId, durable: bool) {
        self.writing.remove(id);
        if durable {
            self.pending.insert(id.clone());
        }
    }

    /// Checks out the oldest pending id, unless an older write is still in
    /// progress.
    fn checkout(&mut self) -> Option<BatchId> {
        let first = self.pending.first()?;
        if self.writing.first().is_some_and(|writing| writing < first) {
            return None;
        }
        let id = self.pending.pop_first()?;
        self.checked_out.insert(id.clone());
        Some(id)
    }
}

/// An id between allocation and the end of its write.
///
/// Dropping it settles the id in the index: pending if committed, forgotten
/// otherwise. It travels into the blocking task, so the outcome is recorded
/// even when the `store` future is dropped.
struct PendingWrite {
    index: Arc<Mutex<SpoolIndex>>,
    id: BatchId,
    durable: bool,
}

impl PendingWrite {
    fn commit(mut self) {
        self.durable = true;
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        let mut index = self
            .index
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        index.finish_write(&self.id, self.durable);
    }
}

impl SpoolStorage {
    /// Opens (or creates) a spool directory.
    ///
    /// Every record already in the directory becomes pending again, in id
    /// order. Interrupted writes (`.json.tmp`) are discarded.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Unavailable` if the directory cannot be
    /// created or listed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| unavailable(&dir, &e))?;

        let mut index = SpoolIndex::default();
        let mut dir_changed = false;

        for entry in std::fs::read_dir(&dir).map_err(|e| unavailable(&dir, &e))? {
            let path = entry.map_err(|e| unavailable(&dir, &e))?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if name.ends_with(&format!(".{TEMP_EXT}")) {
                if std::fs::remove_file(&path).is_ok() {
                    dir_changed = true;
                }
                continue;
            }

            if let Some((id, seq)) = parse_record_name(name) {
                index.last_seq = index.last_seq.max(seq);
                index.pending.insert(id);
            } else if has_numeric_stem(name) {
                let to = dir.join(format!("{name}.corrupt"));
                match std::fs::rename(&path, &to) {
                    Ok(()) => {
                        warn!(file = name, "Quarantined spool record with a malformed id");
                        dir_changed = true;
                    }
                    Err(e) => warn!(file = name, error = %e, "Ignoring spool record with a malformed id"),
                }
            }
        }

        if dir_changed {
            fsync_dir(&dir).map_err(|e| unavailable(&dir, &e))?;
        }

        info!(
            spool_dir = %dir.display(),
            pending = index.pending.len(),
            "Opened spool storage"
        );

        Ok(SpoolStorage {
            dir: Arc::new(dir),
            index: Arc::new(Mutex::new(index)),
        })
    }

    /// Returns the spool directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of unreleased records, checked out or not.
    pub fn len(&self) -> usize {
        self.lock()
            .map(|index| index.pending.len() + index.checked_out.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record_path(&self, id: &BatchId) -> PathBuf {
        record_path(&self.dir, id)
    }

    fn lock(&self) -> Result<MutexGuard<'_, SpoolIndex>> {
        self.index
            .lock()
            .map_err(|_| StorageError::Unavailable("spool index lock poisoned".to_string()))
    }
}

impl StorageProvider for SpoolStorage {
    async fn store(&self, batch: &Batch) -> Result<BatchId> {
        let id = self.lock()?.next_id()?;
        let write = PendingWrite {
            index: Arc::clone(&self.index),
            id: id.clone(),
            durable: false,
        };
        let record = StoredBatch::new(id.clone(), batch.clone(), Utc::now());
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| StorageError::WriteFailed(format!("cannot encode batch: {e}")))?;

        let dir = Arc::clone(&self.dir);
        run_blocking(move || {
            write_record(&dir, &write.id, &bytes)?;
            write.commit();
            Ok::<(), io::Error>(())
        })
        .await?
        .map_err(|e| StorageError::from_io(StorageOp::Write, &e))?;

        debug!(batch_id = %id, events = batch.len(), "Spooled batch");
        Ok(id)
    }

    async fn retrieve(&self) -> Result<Option<StoredBatch>> {
        let Some(id) = self.lock()?.checkout() else {
            return Ok(None);
        };

        let path = self.record_path(&id);
        let read = run_blocking(move || std::fs::read(&path)).await;

        let decoded = match read {
            Ok(Ok(bytes)) => serde_json::from_slice::<StoredBatch>(&bytes)
                .map_err(|e| format!("cannot decode batch {id}: {e}")),
            Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => {
                self.lock()?.checked_out.remove(&id);
                return Err(StorageError::ReadFailed(format!(
                    "batch {id} vanished from the spool"
                )));
            }
            Ok(Err(e)) => {
                // Leave the record pending so the next retrieve tries again.
                let mut index = self.lock()?;
                index.checked_out.remove(&id);
                index.pending.insert(id.clone());
                return Err(StorageError::from_io(StorageOp::Read, &e));
            }
            Err(e) => {
                let mut index = self.lock()?;
                index.checked_out.remove(&id);
                index.pending.insert(id.clone());
                return Err(e);
            }
        };

        match decoded {
            Ok(record) if record.id == id => Ok(Some(record)),
            Ok(record) => {
                let reason = format!("record {id} claims to be batch {}", record.id);
                self.quarantine(&id).await;
                Err(StorageError::ReadFailed(reason))
            }
            Err(reason) => {
                self.quarantine(&id).await;
                Err(StorageError::ReadFailed(reason))
            }
        }
    }

    async fn release(&self, id: &BatchId) -> Result<()> {
        let (was_pending, was_checked_out) = {
            let mut index = self.lock()?;
            (index.pending.remove(id), index.checked_out.remove(id))
        };

        let dir = Arc::clone(&self.dir);
        let path = self.record_path(id);
        let removed = run_blocking(move || -> io::Result<()> {
            match std::fs::remove_file(&path) {
                Ok(()) => fsync_dir(&dir),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            }
        })
        .await
        .and_then(|r| r.map_err(|e| StorageError::from_io(StorageOp::Delete(id), &e)));

        if let Err(e) = removed {
            // The file is still there; put the index back the way it was.
            let mut index = self.lock()?;
            if was_pending {
                index.pending.insert(id.clone());
            }
            if was_checked_out {
                index.checked_out.insert(id.clone());
            }
            return Err(e);
        }

        debug!(batch_id = %id, "Released batch from spool");
        Ok(())
    }

    async fn requeue(&self, id: &BatchId) -> Result<()> {
        let mut index = self.lock()?;
        if index.checked_out.remove(id) {
            index.pending.insert(id.clone());
        }
        Ok(())
    }
}

impl SpoolStorage {
    /// Moves an undecodable record aside so it is never retrieved again.
    async fn quarantine(&self, id: &BatchId) {
        if let Ok(mut index) = self.lock() {
            index.checked_out.remove(id);
        }

        let dir = Arc::clone(&self.dir);
        let from = self.record_path(id);
        let to = self.dir.join(format!("{id}.{CORRUPT_EXT}"));
        let result = run_blocking(move || -> io::Result<()> {
            std::fs::rename(&from, &to)?;
            fsync_dir(&dir)
        })
        .await;

        match result {
            Ok(Ok(())) => error!(batch_id = %id, "Quarantined corrupt spool record"),
            Ok(Err(e)) => error!(batch_id = %id, error = %e, "Failed to quarantine corrupt record"),
            Err(e) => error!(batch_id = %id, error = %e, "Failed to quarantine corrupt record"),
        }
    }
}

/// Runs filesystem work off the async executor.
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Unavailable(format!("spool task failed: {e}")))
}

fn record_path(dir: &Path, id: &BatchId) -> PathBuf {
    dir.join(format!("{id}.{RECORD_EXT}"))
}

/// Width of every record id.
const ID_DIGITS: usize = 20;

/// Extracts the batch id and its sequence number from a record file name
/// (`<id>.json`).
///
/// Only the names `store` produces are accepted: exactly twenty digits that
/// fit a `u64`. Anything else would sort out of arrival order.
fn parse_record_name(name: &str) -> Option<(BatchId, u64)> {
    let stem = name.strip_suffix(&format!(".{RECORD_EXT}"))?;
    if stem.len() != ID_DIGITS || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let seq = stem.parse::<u64>().ok()?;
    Some((BatchId::new(stem), seq))
}

/// True for `<digits>.json`, whether or not the digits are a valid id.
fn has_numeric_stem(name: &str) -> bool {
    name.strip_suffix(&format!(".{RECORD_EXT}"))
        .is_some_and(|stem| !stem.is_empty() && stem.bytes().all(|b| b.is_ascii_digit()))
}

/// Writes a record with the write-to-temp-then-rename pattern.
///
/// 1. Write to `<id>.json.tmp`
/// 2. fsync the temp file
/// 3. Rename to `<id>.json`
/// 4. fsync the directory
fn write_record(dir: &Path, id: &BatchId, bytes: &[u8]) -> io::Result<()> {
    let final_path = record_path(dir, id);
    let temp_path = dir.join(format!("{id}.{TEMP_EXT}"));

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    if let Err(e) = std::fs::rename(&temp_path, &final_path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }

    fsync_dir(dir)
}

/// Syncs a directory so that created, renamed, and deleted entries survive a
/// power loss.
fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

fn unavailable(dir: &Path, err: &io::Error) -> StorageError {
    StorageError::Unavailable(format!("spool directory {}: {err}", dir.display()))
}
