use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::ledger::Ledger;
use crate::model::{BookingId, BookingRecord, BookingStatus, RentalItem};
use crate::observability;
use crate::retry::RetryPolicy;
use crate::store::{RecordStore, StoreError};

#[derive(Debug, Clone)]
pub struct FlushConfig {
    /// Flush at least this often while there are unsaved mutations.
    pub interval: Duration,
    /// Flush early once this many mutations are unsaved.
    pub batch_size: u64,
    pub retry: RetryPolicy,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            batch_size: 50,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing changed since the last good flush.
    Clean,
    Saved { records: usize, seq: u64 },
}

/// Write-behind persistence: copies the ledger to the store on a timer or once enough
/// mutations pile up. Commands never wait on the store.
///
/// A shared store (the staff spreadsheet) is re-read before each save and on every tick.
/// Status edits made there since the last read or write are applied to the ledger as
/// status changes, so watchers hear about them and the save that follows keeps them.
///
/// When every retry of a save fails the coordinator goes degraded: it keeps serving from
/// memory, logs a warning and raises the `rentledger_store_degraded` gauge. The next
/// successful save clears it.
pub struct FlushCoordinator {
    ledger: Arc<Ledger>,
    store: Arc<dyn RecordStore>,
    config: FlushConfig,
    flushed_seq: AtomicU64,
    degraded: AtomicBool,
    /// Status of every row as last read from or written to the store. Held for the whole
    /// of a flush, which also keeps flushes from overlapping.
    synced: Mutex<HashMap<BookingId, BookingStatus>>,
}

fn statuses(records: &[BookingRecord]) -> HashMap<BookingId, BookingStatus> {
    records.iter().map(|r| (r.id, r.status)).collect()
}

impl FlushCoordinator {
    pub fn new(ledger: Arc<Ledger>, store: Arc<dyn RecordStore>, config: FlushConfig) -> Self {
        Self {
            flushed_seq: AtomicU64::new(ledger.mutation_seq()),
            ledger,
            store,
            config,
            degraded: AtomicBool::new(false),
            synced: Mutex::new(HashMap::new()),
        }
    }

    /// Register the catalog, load the persisted table and rebuild the ledger from it.
    /// Must finish before any command is served. A load that still fails after the retry
    /// policy is exhausted is returned to the caller, which should refuse to start.
    pub async fn bootstrap(&self, catalog: Vec<RentalItem>) -> Result<usize, StoreError> {
        for item in catalog {
            let id = item.id.clone();
            if let Err(e) = self.ledger.register_item(item) {
                warn!("catalog item {id} skipped: {e}");
            }
        }

        let records = self.load().await?;
        let synced = statuses(&records);
        let restored = self
            .ledger
            .restore(records)
            .await
            .map_err(|e| StoreError::format(None, e.to_string()))?;
        *self.synced.lock().await = synced;
        self.flushed_seq.store(self.ledger.mutation_seq(), Ordering::Release);
        info!(
            "restored {restored} records for {} items from {}",
            self.ledger.item_count(),
            self.store.describe()
        );
        Ok(restored)
    }

    async fn load(&self) -> Result<Vec<BookingRecord>, StoreError> {
        self.config
            .retry
            .retry_async(|attempt| async move {
                let result = self.store.load().await;
                if let Err(e) = &result {
                    warn!("load from {} failed (attempt {}): {e}", self.store.describe(), attempt + 1);
                }
                result
            })
            .await
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn mark_degraded(&self) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            metrics::gauge!(observability::STORE_DEGRADED).set(1.0);
        }
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            metrics::gauge!(observability::STORE_DEGRADED).set(0.0);
            info!("store {} reachable again; degraded mode cleared", self.store.describe());
        }
    }

    /// Mutations committed since the last good flush.
    pub fn pending(&self) -> u64 {
        self.ledger
            .mutation_seq()
            .saturating_sub(self.flushed_seq.load(Ordering::Acquire))
    }

    /// Re-read a shared table and push its status edits through the ledger.
    ///
    /// Returns true when the table no longer matches the ledger even after the edits: an
    /// edit was refused, or rows were added or removed by hand. The ledger wins those, so
    /// the table needs rewriting.
    async fn apply_table_edits(&self, synced: &mut HashMap<BookingId, BookingStatus>) -> Result<bool, StoreError> {
        let rows = self.load().await?;
        let mut stale = false;
        let mut seen = HashSet::with_capacity(rows.len());

        for row in rows {
            seen.insert(row.id);
            let Some(known) = synced.insert(row.id, row.status) else {
                warn!("{}: row {} was not written here and will be dropped", self.store.describe(), row.id);
                stale = true;
                continue;
            };
            match self.ledger.set_status(row.id, known, row.status).await {
                Ok(Some(record)) => {
                    metrics::counter!(observability::TABLE_EDITS_TOTAL).increment(1);
                    info!(
                        "booking {} for {} on {} marked {} in {}",
                        record.id,
                        record.requester,
                        record.item_id,
                        record.status,
                        self.store.describe()
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("table edit {known} -> {} on booking {} not applied: {e}", row.status, row.id);
                    stale = true;
                }
            }
        }

        if synced.keys().any(|id| !seen.contains(id)) {
            warn!("{}: rows removed by hand will be written back", self.store.describe());
            stale = true;
        }
        Ok(stale)
    }

    /// Persist the current ledger if anything changed since the last good flush, after
    /// folding in edits made to a shared table.
    pub async fn flush(&self) -> Result<FlushOutcome, StoreError> {
        let mut synced = self.synced.lock().await;

        let mut stale = false;
        if self.store.shared() {
            match self.apply_table_edits(&mut synced).await {
                Ok(differs) => stale = differs,
                Err(e) => {
                    self.mark_degraded();
                    warn!("{} could not be re-read, not overwriting it: {e}", self.store.describe());
                    return Err(e);
                }
            }
        }
        if self.pending() == 0 && !stale {
            if self.store.shared() {
                self.mark_healthy();
            }
            return Ok(FlushOutcome::Clean);
        }

        let started = Instant::now();
        let snapshot = self.ledger.snapshot().await;
        let records = &snapshot.records;
        let result = self
            .config
            .retry
            .retry_async(|attempt| async move {
                let result = self.store.save(records).await;
                if let Err(e) = &result {
                    metrics::counter!(observability::FLUSH_FAILURES_TOTAL).increment(1);
                    debug!("save to {} failed (attempt {}): {e}", self.store.describe(), attempt + 1);
                }
                result
            })
            .await;
        metrics::histogram!(observability::FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                self.flushed_seq.fetch_max(snapshot.seq, Ordering::AcqRel);
                *synced = statuses(records);
                metrics::histogram!(observability::FLUSH_RECORDS).record(records.len() as f64);
                self.mark_healthy();
                debug!("flushed {} records at seq {}", records.len(), snapshot.seq);
                Ok(FlushOutcome::Saved {
                    records: records.len(),
                    seq: snapshot.seq,
                })
            }
            Err(e) => {
                self.mark_degraded();
                warn!(
                    "store {} unavailable after {} attempts, serving from memory with {} unsaved mutations: {e}",
                    self.store.describe(),
                    self.config.retry.max_attempts,
                    self.pending()
                );
                Err(e)
            }
        }
    }

    /// Flush on the interval or when the batch threshold is reached, until `shutdown`
    /// flips to true (or its sender is dropped). Every tick also picks up table edits,
    /// even when the ledger is clean. Ends with a final flush.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<FlushOutcome, StoreError> {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.flush().await;
                }
                _ = self.ledger.changed() => {
                    if self.pending() >= self.config.batch_size {
                        let _ = self.flush().await;
                        ticker.reset();
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await
    }

    /// Final flush before the process exits.
    pub async fn shutdown(&self) -> Result<FlushOutcome, StoreError> {
        let outcome = self.flush().await;
        match &outcome {
            Ok(FlushOutcome::Saved { records, .. }) => info!("final flush wrote {records} records"),
            Ok(FlushOutcome::Clean) => info!("final flush: nothing to write"),
            Err(e) => warn!("final flush failed, {} mutations lost: {e}", self.pending()),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LedgerEvent;
    use crate::notify::NotifyHub;
    use crate::store::{CsvStore, MemoryStore};

    const HOUR: i64 = 3_600_000;

    fn quick_config(batch_size: u64) -> FlushConfig {
        FlushConfig {
            interval: Duration::from_secs(3600),
            batch_size,
            retry: RetryPolicy::new(3, 1, 2),
        }
    }

    fn setup(store: Arc<MemoryStore>, config: FlushConfig) -> (Arc<Ledger>, Arc<FlushCoordinator>) {
        let ledger = Arc::new(Ledger::new(Arc::new(NotifyHub::new())));
        let coordinator = Arc::new(FlushCoordinator::new(ledger.clone(), store, config));
        (ledger, coordinator)
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn bootstrap_restores_rows() {
        let store = Arc::new(MemoryStore::new());
        let (ledger, coordinator) = setup(store.clone(), quick_config(50));
        coordinator.bootstrap(vec![RentalItem::new("Tent-A", 1)]).await.unwrap();
        let booked = ledger.create_booking("Tent-A", "alice", 0, HOUR, None).await.unwrap();
        coordinator.flush().await.unwrap();

        let (fresh, fresh_coordinator) = setup(store, quick_config(50));
        let restored = fresh_coordinator
            .bootstrap(vec![RentalItem::new("Tent-A", 1)])
            .await
            .unwrap();
        assert_eq!(restored, 1);
        assert_eq!(fresh.get_booking(booked.id).await, Some(booked));
        assert_eq!(fresh.query_availability("Tent-A", 0, HOUR).await.unwrap(), 0);
        assert_eq!(fresh_coordinator.pending(), 0);
    }

    #[tokio::test]
    async fn bootstrap_fails_on_unreadable_store() {
        let path = std::env::temp_dir().join("rentledger_test_flush_bad.csv");
        std::fs::write(&path, "bookingId,itemId\nnot,enough\n").unwrap();
        let ledger = Arc::new(Ledger::new(Arc::new(NotifyHub::new())));
        let coordinator = FlushCoordinator::new(ledger, Arc::new(CsvStore::new(&path)), quick_config(50));
        assert!(coordinator.bootstrap(vec![]).await.is_err());
    }

    #[tokio::test]
    async fn flush_skips_when_clean() {
        let store = Arc::new(MemoryStore::new());
        let (_ledger, coordinator) = setup(store.clone(), quick_config(50));
        assert_eq!(coordinator.flush().await.unwrap(), FlushOutcome::Clean);
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn flush_writes_full_table() {
        let store = Arc::new(MemoryStore::new());
        let (ledger, coordinator) = setup(store.clone(), quick_config(50));
        coordinator.bootstrap(vec![RentalItem::new("Tent-A", 2)]).await.unwrap();
        let a = ledger.create_booking("Tent-A", "alice", 0, HOUR, None).await.unwrap();
        ledger.create_booking("Tent-A", "bob", 0, HOUR, None).await.unwrap();
        ledger.cancel_booking(a.id, "alice", false).await.unwrap();
        assert_eq!(coordinator.pending(), 3);

        let outcome = coordinator.flush().await.unwrap();
        assert_eq!(outcome, FlushOutcome::Saved { records: 2, seq: 3 });
        assert_eq!(coordinator.pending(), 0);
        let rows = store.rows();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.id == a.id && r.status == BookingStatus::Cancelled));

        assert_eq!(coordinator.flush().await.unwrap(), FlushOutcome::Clean);
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let store = Arc::new(MemoryStore::new());
        let (ledger, coordinator) = setup(store.clone(), quick_config(50));
        coordinator.bootstrap(vec![RentalItem::new("Tent-A", 1)]).await.unwrap();
        ledger.create_booking("Tent-A", "alice", 0, HOUR, None).await.unwrap();

        store.fail_next_saves(2);
        assert!(matches!(coordinator.flush().await, Ok(FlushOutcome::Saved { .. })));
        assert!(!coordinator.is_degraded());
        assert_eq!(store.rows().len(), 1);
    }

    #[tokio::test]
    async fn degraded_after_retries_then_recovers() {
        let store = Arc::new(MemoryStore::new());
        let (ledger, coordinator) = setup(store.clone(), quick_config(50));
        coordinator.bootstrap(vec![RentalItem::new("Tent-A", 1)]).await.unwrap();
        ledger.create_booking("Tent-A", "alice", 0, HOUR, None).await.unwrap();

        store.fail_next_saves(3);
        assert!(coordinator.flush().await.is_err());
        assert!(coordinator.is_degraded());
        assert_eq!(coordinator.pending(), 1);

        // Still serving from memory.
        ledger.create_booking("Tent-A", "bob", HOUR, 2 * HOUR, None).await.unwrap();

        assert!(matches!(coordinator.flush().await, Ok(FlushOutcome::Saved { records: 2, .. })));
        assert!(!coordinator.is_degraded());
        assert_eq!(coordinator.pending(), 0);
    }

    #[tokio::test]
    async fn table_edit_reaches_ledger_before_save() {
        let store = Arc::new(MemoryStore::new());
        let (ledger, coordinator) = setup(store.clone(), quick_config(50));
        coordinator
            .bootstrap(vec![RentalItem::new("Tent-A", 1), RentalItem::new("Kayak", 1)])
            .await
            .unwrap();
        let alice = ledger.create_booking("Tent-A", "alice", 0, HOUR, None).await.unwrap();
        coordinator.flush().await.unwrap();

        let mut rx = ledger.notify.subscribe("Tent-A");
        assert!(store.edit_status(alice.id, BookingStatus::Cancelled));
        ledger.create_booking("Kayak", "bob", 0, HOUR, None).await.unwrap();
        assert!(matches!(coordinator.flush().await, Ok(FlushOutcome::Saved { records: 2, .. })));

        let saved = store.rows();
        assert!(saved.iter().any(|r| r.id == alice.id && r.status == BookingStatus::Cancelled));
        assert_eq!(ledger.get_booking(alice.id).await.unwrap().status, BookingStatus::Cancelled);
        assert_eq!(ledger.query_availability("Tent-A", 0, HOUR).await.unwrap(), 1);
        match rx.recv().await.unwrap() {
            LedgerEvent::BookingCancelled { record } => assert_eq!(record.id, alice.id),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn table_edit_picked_up_while_clean() {
        let store = Arc::new(MemoryStore::new());
        let (ledger, coordinator) = setup(store.clone(), quick_config(50));
        coordinator.bootstrap(vec![RentalItem::new("Tent-A", 1)]).await.unwrap();
        let alice = ledger.create_booking("Tent-A", "alice", 0, HOUR, None).await.unwrap();
        coordinator.flush().await.unwrap();
        assert_eq!(coordinator.flush().await.unwrap(), FlushOutcome::Clean);

        let mut rx = ledger.notify.subscribe("Tent-A");
        store.edit_status(alice.id, BookingStatus::Issued);
        assert!(matches!(coordinator.flush().await, Ok(FlushOutcome::Saved { .. })));

        match rx.recv().await.unwrap() {
            LedgerEvent::StatusChanged { record } => {
                assert_eq!(record.status, BookingStatus::Issued);
                assert_eq!(record.requester, "alice");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.rows()[0].status, BookingStatus::Issued);
        assert_eq!(coordinator.flush().await.unwrap(), FlushOutcome::Clean);
    }

    #[tokio::test]
    async fn refused_table_edit_is_written_over() {
        let store = Arc::new(MemoryStore::new());
        let (ledger, coordinator) = setup(store.clone(), quick_config(50));
        coordinator.bootstrap(vec![RentalItem::new("Tent-A", 1)]).await.unwrap();
        let alice = ledger.create_booking("Tent-A", "alice", 0, HOUR, None).await.unwrap();
        coordinator.flush().await.unwrap();

        // The requester cancels from chat while staff mark the row issued.
        ledger.cancel_booking(alice.id, "alice", false).await.unwrap();
        store.edit_status(alice.id, BookingStatus::Issued);
        coordinator.flush().await.unwrap();

        assert_eq!(ledger.get_booking(alice.id).await.unwrap().status, BookingStatus::Cancelled);
        assert_eq!(store.rows()[0].status, BookingStatus::Cancelled);
    }

    #[tokio::test]
    async fn refused_edit_rewrites_table_even_when_clean() {
        let store = Arc::new(MemoryStore::new());
        let (ledger, coordinator) = setup(store.clone(), quick_config(50));
        coordinator.bootstrap(vec![RentalItem::new("Tent-A", 1)]).await.unwrap();
        let alice = ledger.create_booking("Tent-A", "alice", 0, HOUR, None).await.unwrap();
        ledger.cancel_booking(alice.id, "alice", false).await.unwrap();
        let bob = ledger.create_booking("Tent-A", "bob", 0, HOUR, None).await.unwrap();
        coordinator.flush().await.unwrap();

        // Reinstating alice would double-book the tent.
        store.edit_status(alice.id, BookingStatus::Confirmed);
        assert!(matches!(coordinator.flush().await, Ok(FlushOutcome::Saved { .. })));
        let rows = store.rows();
        assert!(rows.iter().any(|r| r.id == alice.id && r.status == BookingStatus::Cancelled));
        assert!(rows.iter().any(|r| r.id == bob.id && r.status == BookingStatus::Confirmed));
    }

    #[tokio::test]
    async fn spreadsheet_edit_survives_flush() {
        let path = std::env::temp_dir().join(format!("rentledger_test_flush_edit_{}.csv", ulid::Ulid::new()));
        let ledger = Arc::new(Ledger::new(Arc::new(NotifyHub::new())));
        let coordinator = FlushCoordinator::new(ledger.clone(), Arc::new(CsvStore::new(&path)), quick_config(50));
        coordinator
            .bootstrap(vec![RentalItem::new("Tent-A", 1), RentalItem::new("Kayak", 1)])
            .await
            .unwrap();
        let alice = ledger.create_booking("Tent-A", "alice", 0, HOUR, None).await.unwrap();
        coordinator.flush().await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace(",Confirmed,", ",delivered,")).unwrap();
        ledger.create_booking("Kayak", "bob", 0, HOUR, None).await.unwrap();
        coordinator.flush().await.unwrap();

        let reloaded = CsvStore::new(&path).load().await.unwrap();
        let row = reloaded.iter().find(|r| r.id == alice.id).unwrap();
        assert_eq!(row.status, BookingStatus::Delivered);
        assert_eq!(reloaded.len(), 2);
        // Delivered still holds the tent.
        assert_eq!(ledger.query_availability("Tent-A", 0, HOUR).await.unwrap(), 0);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn unreadable_table_is_not_overwritten() {
        let path = std::env::temp_dir().join(format!("rentledger_test_flush_typo_{}.csv", ulid::Ulid::new()));
        let ledger = Arc::new(Ledger::new(Arc::new(NotifyHub::new())));
        let coordinator = FlushCoordinator::new(ledger.clone(), Arc::new(CsvStore::new(&path)), quick_config(50));
        coordinator.bootstrap(vec![RentalItem::new("Tent-A", 2)]).await.unwrap();
        ledger.create_booking("Tent-A", "alice", 0, HOUR, None).await.unwrap();
        coordinator.flush().await.unwrap();

        let typo = std::fs::read_to_string(&path).unwrap().replace(",Confirmed,", ",confrimed,");
        std::fs::write(&path, &typo).unwrap();
        ledger.create_booking("Tent-A", "bob", 0, HOUR, None).await.unwrap();

        assert!(coordinator.flush().await.is_err());
        assert!(coordinator.is_degraded());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), typo);

        std::fs::write(&path, typo.replace(",confrimed,", ",Confirmed,")).unwrap();
        assert!(matches!(coordinator.flush().await, Ok(FlushOutcome::Saved { records: 2, .. })));
        assert!(!coordinator.is_degraded());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn batch_threshold_triggers_flush() {
        let store = Arc::new(MemoryStore::new());
        let (ledger, coordinator) = setup(store.clone(), quick_config(2));
        coordinator.bootstrap(vec![RentalItem::new("Kayak", 5)]).await.unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(coordinator.clone().run(rx));

        ledger.create_booking("Kayak", "alice", 0, HOUR, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.save_count(), 0);

        ledger.create_booking("Kayak", "bob", 0, HOUR, None).await.unwrap();
        wait_for(|| store.save_count() == 1).await;
        assert_eq!(store.rows().len(), 2);

        tx.send(true).unwrap();
        assert_eq!(task.await.unwrap().unwrap(), FlushOutcome::Clean);
    }

    #[tokio::test]
    async fn interval_triggers_flush() {
        let store = Arc::new(MemoryStore::new());
        let config = FlushConfig {
            interval: Duration::from_millis(20),
            ..quick_config(1_000)
        };
        let (ledger, coordinator) = setup(store.clone(), config);
        coordinator.bootstrap(vec![RentalItem::new("Kayak", 5)]).await.unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(coordinator.clone().run(rx));

        ledger.create_booking("Kayak", "alice", 0, HOUR, None).await.unwrap();
        wait_for(|| store.save_count() == 1).await;

        drop(tx);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_performs_final_flush() {
        let store = Arc::new(MemoryStore::new());
        let (ledger, coordinator) = setup(store.clone(), quick_config(1_000));
        coordinator.bootstrap(vec![RentalItem::new("Kayak", 5)]).await.unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(coordinator.clone().run(rx));

        ledger.create_booking("Kayak", "alice", 0, HOUR, None).await.unwrap();
        tx.send(true).unwrap();
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, FlushOutcome::Saved { records: 1, seq: 1 });
        assert_eq!(store.rows().len(), 1);
    }
}
