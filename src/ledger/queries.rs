use crate::model::*;

use super::availability::{free_windows, remaining_units};
use super::conflict::validate_window;
use super::{Ledger, LedgerError, SharedItemState};

impl Ledger {
    /// Units of `item_id` free for the whole of `[start, end)`.
    pub async fn query_availability(&self, item_id: &str, start: Ms, end: Ms) -> Result<u32, LedgerError> {
        let window = validate_window(start, end)?;
        let item = self
            .get_item(item_id)
            .ok_or_else(|| LedgerError::UnknownItem(item_id.to_string()))?;
        let guard = item.read().await;
        Ok(remaining_units(&guard, window))
    }

    /// Sub-windows of `[start, end)` in which at least one unit of `item_id` is free.
    pub async fn free_windows(&self, item_id: &str, start: Ms, end: Ms) -> Result<Vec<Span>, LedgerError> {
        let window = validate_window(start, end)?;
        let item = self
            .get_item(item_id)
            .ok_or_else(|| LedgerError::UnknownItem(item_id.to_string()))?;
        let guard = item.read().await;
        Ok(free_windows(&guard, window))
    }

    /// Free units and free sub-windows of `[start, end)`, read under one lock so the two
    /// always describe the same state.
    pub async fn availability(&self, item_id: &str, start: Ms, end: Ms) -> Result<(u32, Vec<Span>), LedgerError> {
        let window = validate_window(start, end)?;
        let item = self
            .get_item(item_id)
            .ok_or_else(|| LedgerError::UnknownItem(item_id.to_string()))?;
        let guard = item.read().await;
        Ok((remaining_units(&guard, window), free_windows(&guard, window)))
    }

    pub async fn get_booking(&self, id: BookingId) -> Option<BookingRecord> {
        let item_id = self.item_for_booking(&id)?;
        let item = self.get_item(&item_id)?;
        let guard = item.read().await;
        guard.records.get(&id).cloned()
    }

    /// Every record on an item, cancelled included, ordered by start.
    pub async fn bookings_on(&self, item_id: &str) -> Result<Vec<BookingRecord>, LedgerError> {
        let item = self
            .get_item(item_id)
            .ok_or_else(|| LedgerError::UnknownItem(item_id.to_string()))?;
        let guard = item.read().await;
        let mut records: Vec<BookingRecord> = guard.records.values().cloned().collect();
        records.sort_by_key(|r| (r.start, r.id));
        Ok(records)
    }

    /// Every record made by `requester` across all items, ordered by start.
    pub async fn bookings_for(&self, requester: &str) -> Vec<BookingRecord> {
        let mut records = Vec::new();
        for item in self.all_items() {
            let guard = item.read().await;
            records.extend(
                guard
                    .records
                    .values()
                    .filter(|r| r.requester == requester)
                    .cloned(),
            );
        }
        records.sort_by_key(|r| (r.start, r.id));
        records
    }

    pub async fn list_items(&self) -> Vec<ItemInfo> {
        let mut infos = Vec::with_capacity(self.items.len());
        for item in self.all_items() {
            infos.push(item.read().await.info());
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Clone out the item handles so no map guard is held across an await.
    fn all_items(&self) -> Vec<SharedItemState> {
        self.items.iter().map(|e| e.value().clone()).collect()
    }
}
