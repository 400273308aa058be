use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use tracing::debug;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_capacity, validate_range};
use super::{Ledger, LedgerError};

impl Ledger {
    pub fn register_item(&self, item: RentalItem) -> Result<(), LedgerError> {
        if item.id.is_empty() || item.id.len() > MAX_ITEM_ID_LEN {
            return Err(LedgerError::LimitExceeded("item id length"));
        }
        if let Some(ref d) = item.description
            && d.len() > MAX_DESCRIPTION_LEN {
                return Err(LedgerError::LimitExceeded("item description too long"));
            }
        if self.items.len() >= MAX_ITEMS {
            return Err(LedgerError::LimitExceeded("too many items"));
        }
        match self.items.entry(item.id.clone()) {
            Entry::Occupied(_) => Err(LedgerError::AlreadyExists(item.id)),
            Entry::Vacant(slot) => {
                debug!("registered item {} with {} units", item.id, item.units);
                slot.insert(Arc::new(RwLock::new(ItemState::new(item))));
                Ok(())
            }
        }
    }

    /// Book one unit of `item_id` over `[start, end)`.
    ///
    /// Validation and insertion happen under the item's write lock with no await in
    /// between, so concurrent callers see either nothing or the confirmed record.
    pub async fn create_booking(
        &self,
        item_id: &str,
        requester: &str,
        start: Ms,
        end: Ms,
        note: Option<String>,
    ) -> Result<BookingRecord, LedgerError> {
        let span = validate_range(start, end)?;
        if requester.len() > MAX_REQUESTER_LEN {
            return Err(LedgerError::LimitExceeded("requester too long"));
        }
        if let Some(ref n) = note
            && n.len() > MAX_NOTE_LEN {
                return Err(LedgerError::LimitExceeded("note too long"));
            }

        let _gate = self.snapshot_gate.read().await;
        let item = self
            .get_item(item_id)
            .ok_or_else(|| LedgerError::UnknownItem(item_id.to_string()))?;
        let mut guard = item.write().await;
        if guard.records.len() >= MAX_BOOKINGS_PER_ITEM {
            return Err(LedgerError::LimitExceeded("too many bookings on item"));
        }

        check_capacity(&guard, span)?;

        let mut record = BookingRecord {
            id: self.reserve_booking_id(item_id),
            item_id: guard.item.id.clone(),
            requester: requester.to_string(),
            start: span.start,
            end: span.end,
            status: BookingStatus::Pending,
            note,
        };
        record.status = BookingStatus::Confirmed;
        guard.apply(record.clone());
        drop(guard);

        self.commit(LedgerEvent::BookingConfirmed {
            record: record.clone(),
        });
        Ok(record)
    }

    /// Cancel a booking. Only its requester may cancel unless `override_owner` is set.
    /// Cancelling twice reports `NotFound`.
    pub async fn cancel_booking(
        &self,
        id: BookingId,
        requester: &str,
        override_owner: bool,
    ) -> Result<BookingRecord, LedgerError> {
        let _gate = self.snapshot_gate.read().await;
        let item_id = self.item_for_booking(&id).ok_or(LedgerError::NotFound(id))?;
        let item = self.get_item(&item_id).ok_or(LedgerError::NotFound(id))?;
        let mut guard = item.write().await;

        let record = guard.records.get(&id).ok_or(LedgerError::NotFound(id))?;
        if record.status == BookingStatus::Cancelled {
            return Err(LedgerError::NotFound(id));
        }
        if record.requester != requester && !override_owner {
            return Err(LedgerError::NotOwner(id));
        }

        let cancelled = guard.cancel(id).ok_or(LedgerError::NotFound(id))?;
        drop(guard);

        self.commit(LedgerEvent::BookingCancelled {
            record: cancelled.clone(),
        });
        Ok(cancelled)
    }

    /// Move a booking from `from` to `to`, as staff do by editing the shared table.
    ///
    /// Fails with `StatusMoved` if the booking is no longer in `from`. Moving back onto the
    /// timeline (out of Pending or Cancelled) is capacity-checked like a new booking.
    /// Returns `None` when `from == to`.
    pub async fn set_status(
        &self,
        id: BookingId,
        from: BookingStatus,
        to: BookingStatus,
    ) -> Result<Option<BookingRecord>, LedgerError> {
        if from == to {
            return Ok(None);
        }
        let _gate = self.snapshot_gate.read().await;
        let item_id = self.item_for_booking(&id).ok_or(LedgerError::NotFound(id))?;
        let item = self.get_item(&item_id).ok_or(LedgerError::NotFound(id))?;
        let mut guard = item.write().await;

        let current = guard.records.get(&id).ok_or(LedgerError::NotFound(id))?;
        if current.status != from {
            return Err(LedgerError::StatusMoved {
                id,
                current: current.status,
            });
        }
        let mut record = current.clone();
        record.status = to;
        if to.holds_unit() && !from.holds_unit() {
            check_capacity(&guard, record.span())?;
        }
        guard.apply(record.clone());
        drop(guard);

        let event = match to {
            BookingStatus::Confirmed => LedgerEvent::BookingConfirmed { record: record.clone() },
            BookingStatus::Cancelled => LedgerEvent::BookingCancelled { record: record.clone() },
            _ => LedgerEvent::StatusChanged { record: record.clone() },
        };
        self.commit(event);
        Ok(Some(record))
    }
}
