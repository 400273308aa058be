mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{coverage, free_windows, peak_concurrency, remaining_units};
pub use error::LedgerError;
pub(crate) use conflict::validate_range;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Notify, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;

pub type SharedItemState = Arc<RwLock<ItemState>>;

/// Point-in-time copy of every record, tagged with the mutation sequence it reflects.
#[derive(Debug, Clone)]
pub struct LedgerSnapshot {
    pub records: Vec<BookingRecord>,
    pub seq: u64,
}

/// The authoritative in-memory booking state.
///
/// Lifecycle: construct, register the catalog, `restore` persisted rows, then serve.
/// Mutations serialize per item on that item's write lock; reads share it.
pub struct Ledger {
    items: DashMap<ItemId, SharedItemState>,
    /// Reverse lookup: booking id → item id. Kept after cancellation so ids are never reissued.
    booking_to_item: DashMap<BookingId, ItemId>,
    pub notify: Arc<NotifyHub>,
    /// Mutations hold this shared; `snapshot` holds it exclusively while copying.
    snapshot_gate: RwLock<()>,
    mutations: AtomicU64,
    changed: Notify,
}

impl Ledger {
    pub fn new(notify: Arc<NotifyHub>) -> Self {
        Self {
            items: DashMap::new(),
            booking_to_item: DashMap::new(),
            notify,
            snapshot_gate: RwLock::new(()),
            mutations: AtomicU64::new(0),
            changed: Notify::new(),
        }
    }

    pub fn get_item(&self, id: &str) -> Option<SharedItemState> {
        self.items.get(id).map(|e| e.value().clone())
    }

    pub fn item_for_booking(&self, id: &BookingId) -> Option<ItemId> {
        self.booking_to_item.get(id).map(|e| e.value().clone())
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Number of committed mutations since construction. Restores don't count.
    pub fn mutation_seq(&self) -> u64 {
        self.mutations.load(Ordering::Acquire)
    }

    /// Resolves after the next committed mutation (or immediately if one landed
    /// since the last call).
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    /// Claim a fresh booking id for `item_id`. Ids are never handed out twice.
    pub(super) fn reserve_booking_id(&self, item_id: &str) -> BookingId {
        loop {
            let id = Ulid::new();
            if let Entry::Vacant(slot) = self.booking_to_item.entry(id) {
                slot.insert(item_id.to_string());
                return id;
            }
        }
    }

    /// Bump the sequence, wake the flusher, fan the event out. Caller still holds the gate.
    pub(super) fn commit(&self, event: LedgerEvent) {
        self.mutations.fetch_add(1, Ordering::AcqRel);
        self.changed.notify_one();
        match &event {
            LedgerEvent::BookingConfirmed { .. } => {
                metrics::counter!(crate::observability::BOOKINGS_CONFIRMED_TOTAL).increment(1);
            }
            LedgerEvent::BookingCancelled { .. } => {
                metrics::counter!(crate::observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
            }
            LedgerEvent::StatusChanged { .. } => {
                metrics::counter!(crate::observability::STATUS_CHANGES_TOTAL).increment(1);
            }
        }
        self.notify.send(&event.record().item_id, &event);
    }

    /// Rebuild in-memory state from persisted rows. Run before serving commands.
    ///
    /// Rows are authoritative: duplicates resolve last-row-wins, rows for items missing
    /// from the catalog get a zero-unit placeholder item, and confirmed rows that exceed
    /// an item's units are kept (and reported) rather than dropped.
    ///
    /// Every row must carry a valid booking range. One that doesn't rejects the whole
    /// batch before anything is applied.
    pub async fn restore(&self, records: Vec<BookingRecord>) -> Result<usize, LedgerError> {
        for record in &records {
            validate_range(record.start, record.end)?;
        }
        let count = records.len();
        for record in records {
            let item = match self.get_item(&record.item_id) {
                Some(item) => item,
                None => {
                    warn!(
                        "booking {} references unknown item {}; adding it with 0 units",
                        record.id, record.item_id
                    );
                    let placeholder = Arc::new(RwLock::new(ItemState::new(RentalItem::new(
                        record.item_id.clone(),
                        0,
                    ))));
                    self.items
                        .entry(record.item_id.clone())
                        .or_insert(placeholder)
                        .value()
                        .clone()
                }
            };

            // A later row may move an id to another item.
            if let Some(previous) = self.item_for_booking(&record.id)
                && previous != record.item_id
                && let Some(old) = self.get_item(&previous)
            {
                let mut guard = old.write().await;
                guard.remove_active(record.id);
                guard.records.remove(&record.id);
            }

            self.booking_to_item.insert(record.id, record.item_id.clone());
            item.write().await.apply(record);
        }

        for entry in self.items.iter() {
            let item = entry.value().clone();
            if let Ok(guard) = item.try_read() {
                let all = Span::new(Ms::MIN, Ms::MAX);
                let peak = availability::peak_concurrency(&availability::clamped_overlaps(&guard, all));
                if peak > guard.item.units {
                    warn!(
                        "item {} restored with {peak} concurrent bookings over {} units",
                        guard.item.id, guard.item.units
                    );
                }
            }
        }
        Ok(count)
    }

    /// Copy every record under the exclusive gate. In-flight mutations finish first;
    /// new ones wait only for the copy.
    pub async fn snapshot(&self) -> LedgerSnapshot {
        let _gate = self.snapshot_gate.write().await;
        let seq = self.mutation_seq();
        let items: Vec<SharedItemState> = self.items.iter().map(|e| e.value().clone()).collect();

        let mut records = Vec::new();
        for item in items {
            let guard = item.read().await;
            records.extend(guard.records.values().cloned());
        }
        records.sort_by(|a, b| {
            a.item_id
                .cmp(&b.item_id)
                .then(a.start.cmp(&b.start))
                .then(a.id.cmp(&b.id))
        });
        LedgerSnapshot { records, seq }
    }
}
