use crate::model::{BookingId, BookingStatus, ItemId, Ms};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    InvalidRange { start: Ms, end: Ms },
    Conflict {
        item: ItemId,
        units: u32,
        /// Set when a single booking is the sole blocker (one-unit items).
        blocking: Option<BookingId>,
    },
    UnknownItem(ItemId),
    NotFound(BookingId),
    NotOwner(BookingId),
    AlreadyExists(ItemId),
    LimitExceeded(&'static str),
    /// A status change was based on a status the booking no longer has.
    StatusMoved { id: BookingId, current: BookingStatus },
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::InvalidRange { start, end } => {
                write!(f, "invalid range [{start}, {end}): end must be after start")
            }
            LedgerError::Conflict {
                item,
                units,
                blocking: Some(id),
            } => write!(f, "{item} ({units} unit) is taken by booking {id}"),
            LedgerError::Conflict { item, units, blocking: None } => {
                write!(f, "{item} has all {units} units booked in that window")
            }
            LedgerError::UnknownItem(id) => write!(f, "unknown item: {id}"),
            LedgerError::NotFound(id) => write!(f, "booking not found: {id}"),
            LedgerError::NotOwner(id) => write!(f, "booking {id} belongs to another requester"),
            LedgerError::AlreadyExists(id) => write!(f, "item already exists: {id}"),
            LedgerError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            LedgerError::StatusMoved { id, current } => {
                write!(f, "booking {id} has meanwhile become {current}")
            }
        }
    }
}

impl std::error::Error for LedgerError {}
