use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;

use crate::model::{BookingId, BookingRecord, BookingStatus};

use super::{RecordStore, StoreError};

/// Keeps the table in process memory. For embedding the ledger without a disk and for
/// exercising the flush path, including injected save failures and hand edits.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<BookingRecord>>,
    failing_saves: AtomicU32,
    saves: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<BookingRecord>) -> Self {
        Self {
            rows: Mutex::new(records),
            ..Self::default()
        }
    }

    /// The next `n` calls to `save` fail with an I/O error.
    pub fn fail_next_saves(&self, n: u32) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    /// Successful saves so far.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn rows(&self) -> Vec<BookingRecord> {
        self.rows.lock().map(|rows| rows.clone()).unwrap_or_default()
    }

    /// Change a row's status in place, the way staff edit a spreadsheet.
    /// Returns false if no row has that id.
    pub fn edit_status(&self, id: BookingId, status: BookingStatus) -> bool {
        let Ok(mut rows) = self.rows.lock() else {
            return false;
        };
        match rows.iter_mut().find(|r| r.id == id) {
            Some(row) => {
                row.status = status;
                true
            }
            None => false,
        }
    }
}

fn poisoned() -> StoreError {
    StoreError::Io(io::Error::other("memory store lock poisoned"))
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn load(&self) -> Result<Vec<BookingRecord>, StoreError> {
        Ok(self.rows.lock().map_err(|_| poisoned())?.clone())
    }

    async fn save(&self, records: &[BookingRecord]) -> Result<(), StoreError> {
        let injected = self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Io(io::Error::other("injected save failure")));
        }
        *self.rows.lock().map_err(|_| poisoned())? = records.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn shared(&self) -> bool {
        true
    }
}
