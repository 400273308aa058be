//! Durable persistence of booking records behind a two-call interface.
//!
//! Every backend writes the full table on `save` and replaces the previous copy atomically
//! (temp file, fsync, rename), so a crash mid-save leaves the last good table in place.

pub(crate) mod csv;
mod memory;
mod snapshot;

pub use self::csv::CsvStore;
pub use memory::MemoryStore;
pub use snapshot::SnapshotStore;

use std::io;
use std::path::Path;

use async_trait::async_trait;

use crate::model::BookingRecord;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Every persisted record. A store that has never been written loads as empty.
    async fn load(&self) -> Result<Vec<BookingRecord>, StoreError>;

    /// Replace the persisted table with `records`.
    async fn save(&self, records: &[BookingRecord]) -> Result<(), StoreError>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    /// Whether people edit the persisted table by hand. Such a table is re-read before
    /// every save so their status edits reach the ledger instead of being overwritten.
    fn shared(&self) -> bool {
        false
    }
}

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    /// The backing table exists but can't be interpreted.
    Format { row: Option<usize>, reason: String },
}

impl StoreError {
    pub(crate) fn format(row: Option<usize>, reason: impl Into<String>) -> Self {
        StoreError::Format {
            row,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "store I/O error: {e}"),
            StoreError::Format { row: Some(row), reason } => {
                write!(f, "malformed store row {row}: {reason}")
            }
            StoreError::Format { row: None, reason } => write!(f, "malformed store: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            StoreError::Format { .. } => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e)
    }
}

/// Reject a persisted row whose range the ledger would never have accepted.
pub(crate) fn check_range(record: &BookingRecord, row: usize) -> Result<(), StoreError> {
    crate::ledger::validate_range(record.start, record.end)
        .map(|_| ())
        .map_err(|e| StoreError::format(Some(row), e.to_string()))
}

/// Write `bytes` to a sibling temp file, fsync, and rename it over `path`.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    use tokio::io::AsyncWriteExt;

    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty() {
            tokio::fs::create_dir_all(dir).await?;
        }
    let tmp_ext = match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    };
    let tmp_path = path.with_extension(tmp_ext);
    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp_path, path).await
}

/// Read a whole file, mapping "doesn't exist yet" to `None`.
pub(crate) async fn read_if_exists(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
