use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub type BookingId = Ulid;
pub type ItemId = String;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end.saturating_sub(self.start)
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Intersection with `window`. Caller guarantees the two overlap.
    pub fn clamp_to(&self, window: &Span) -> Span {
        Span::new(self.start.max(window.start), self.end.min(window.end))
    }
}

/// Lifecycle of a booking. `Issued` and `Delivered` are set by staff in the shared table
/// once the item has been handed over or dropped off.
///
/// New variants go at the end: the snapshot codec stores the variant index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Issued,
    Delivered,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "Pending",
            BookingStatus::Confirmed => "Confirmed",
            BookingStatus::Cancelled => "Cancelled",
            BookingStatus::Issued => "Issued",
            BookingStatus::Delivered => "Delivered",
        }
    }

    /// Lenient parse for hand-edited tables: case-insensitive, accepts "canceled".
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "cancelled" | "canceled" => Some(BookingStatus::Cancelled),
            "issued" => Some(BookingStatus::Issued),
            "delivered" => Some(BookingStatus::Delivered),
            _ => None,
        }
    }

    /// Whether a booking in this status takes a unit for its span.
    pub fn holds_unit(&self) -> bool {
        matches!(
            self,
            BookingStatus::Confirmed | BookingStatus::Issued | BookingStatus::Delivered
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bookable resource with a finite number of interchangeable units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RentalItem {
    pub id: ItemId,
    pub description: Option<String>,
    pub units: u32,
}

impl RentalItem {
    pub fn new(id: impl Into<ItemId>, units: u32) -> Self {
        Self {
            id: id.into(),
            description: None,
            units,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// One reservation and its lifecycle status. This is also the persisted row format,
/// so every field is always serialized (the snapshot codec is not self-describing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRecord {
    #[serde(rename = "bookingId")]
    pub id: BookingId,
    pub item_id: ItemId,
    pub requester: String,
    pub start: Ms,
    pub end: Ms,
    pub status: BookingStatus,
    pub note: Option<String>,
}

impl BookingRecord {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }

    pub fn holds_unit(&self) -> bool {
        self.status.holds_unit()
    }
}

/// A confirmed booking's footprint on its item's timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSpan {
    pub id: BookingId,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct ItemState {
    pub item: RentalItem,
    /// Bookings holding a unit, sorted by `span.start`.
    pub active: Vec<ActiveSpan>,
    /// Widest span ever inserted into `active`. Never shrinks.
    longest: Ms,
    /// Every record ever made against this item, cancelled ones included.
    pub records: HashMap<BookingId, BookingRecord>,
}

impl ItemState {
    pub fn new(item: RentalItem) -> Self {
        Self {
            item,
            active: Vec::new(),
            longest: 0,
            records: HashMap::new(),
        }
    }

    /// Insert a span maintaining sort order by span.start.
    pub fn insert_active(&mut self, active: ActiveSpan) {
        let pos = self
            .active
            .binary_search_by_key(&active.span.start, |a| a.span.start)
            .unwrap_or_else(|e| e);
        self.longest = self.longest.max(active.span.duration_ms());
        self.active.insert(pos, active);
    }

    pub fn remove_active(&mut self, id: BookingId) -> Option<ActiveSpan> {
        let pos = self.active.iter().position(|a| a.id == id)?;
        Some(self.active.remove(pos))
    }

    /// Active spans overlapping `query`.
    ///
    /// Anything starting at or after `query.end` can't overlap, and nothing starting at or
    /// before `query.start - longest` can reach into the window, so both bounds are binary
    /// searches and only the k candidates in between are scanned.
    pub fn overlapping(&self, query: Span) -> impl Iterator<Item = &ActiveSpan> {
        let floor = query.start.saturating_sub(self.longest);
        let left = self.active.partition_point(|a| a.span.start <= floor);
        let right = self.active.partition_point(|a| a.span.start < query.end);
        self.active[left..right]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }

    /// Record a booking. Ones holding a unit also land on the timeline.
    pub fn apply(&mut self, record: BookingRecord) {
        if let Some(previous) = self.records.get(&record.id)
            && previous.holds_unit()
        {
            self.remove_active(record.id);
        }
        if record.holds_unit() {
            self.insert_active(ActiveSpan {
                id: record.id,
                span: record.span(),
            });
        }
        self.records.insert(record.id, record);
    }

    /// Transition a confirmed booking to Cancelled, freeing its span.
    pub fn cancel(&mut self, id: BookingId) -> Option<BookingRecord> {
        let record = self.records.get_mut(&id)?;
        if record.status == BookingStatus::Cancelled {
            return None;
        }
        record.status = BookingStatus::Cancelled;
        let cancelled = record.clone();
        self.remove_active(id);
        Some(cancelled)
    }

    pub fn info(&self) -> ItemInfo {
        ItemInfo {
            id: self.item.id.clone(),
            description: self.item.description.clone(),
            units: self.item.units,
            active_bookings: self.active.len(),
        }
    }
}

/// Committed ledger changes, broadcast per item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    BookingConfirmed { record: BookingRecord },
    BookingCancelled { record: BookingRecord },
    /// Any other move, such as staff marking a booking issued.
    StatusChanged { record: BookingRecord },
}

impl LedgerEvent {
    pub fn record(&self) -> &BookingRecord {
        match self {
            LedgerEvent::BookingConfirmed { record }
            | LedgerEvent::BookingCancelled { record }
            | LedgerEvent::StatusChanged { record } => record,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemInfo {
    pub id: ItemId,
    pub description: Option<String>,
    pub units: u32,
    pub active_bookings: usize,
}
