use crate::model::Ms;

pub const MAX_ITEMS: usize = 10_000;
pub const MAX_BOOKINGS_PER_ITEM: usize = 100_000;

pub const MAX_ITEM_ID_LEN: usize = 128;
pub const MAX_DESCRIPTION_LEN: usize = 1024;
pub const MAX_REQUESTER_LEN: usize = 256;
pub const MAX_NOTE_LEN: usize = 1024;

/// 1970-01-01.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2200-01-01.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// A single booking may not run longer than a year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;
/// Availability queries are capped at two years.
pub const MAX_QUERY_WINDOW_MS: Ms = 2 * 366 * 24 * 3_600_000;

/// Longest accepted command line on the socket.
pub const MAX_LINE_LEN: usize = 16 * 1024;
/// Cap on rows returned by a single `list` command.
pub const MAX_LIST_RESULTS: usize = 1_000;
