use crate::limits::*;
use crate::model::*;

use super::availability::{clamped_overlaps, peak_concurrency};
use super::LedgerError;

/// Validate a booking range and turn it into a span.
pub(crate) fn validate_range(start: Ms, end: Ms) -> Result<Span, LedgerError> {
    if end <= start {
        return Err(LedgerError::InvalidRange { start, end });
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(LedgerError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(LedgerError::LimitExceeded("booking too long"));
    }
    Ok(span)
}

/// Validate an availability query window.
pub(crate) fn validate_window(start: Ms, end: Ms) -> Result<Span, LedgerError> {
    if end <= start {
        return Err(LedgerError::InvalidRange { start, end });
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(LedgerError::LimitExceeded("timestamp out of range"));
    }
    if end - start > MAX_QUERY_WINDOW_MS {
        return Err(LedgerError::LimitExceeded("query window too wide"));
    }
    Ok(Span::new(start, end))
}

/// Fails with `Conflict` if one more booking over `span` would push the item past its units.
pub(crate) fn check_capacity(state: &ItemState, span: Span) -> Result<(), LedgerError> {
    let units = state.item.units;
    let conflict = |blocking| LedgerError::Conflict {
        item: state.item.id.clone(),
        units,
        blocking,
    };

    if units == 0 {
        return Err(conflict(None));
    }
    if units == 1 {
        // Fast path: any overlapping confirmed booking is the blocker
        if let Some(hit) = state.overlapping(span).next() {
            return Err(conflict(Some(hit.id)));
        }
        return Ok(());
    }

    let overlaps = clamped_overlaps(state, span);
    if overlaps.len() < units as usize {
        return Ok(());
    }
    if peak_concurrency(&overlaps) >= units {
        return Err(conflict(None));
    }
    Ok(())
}
