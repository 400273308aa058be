use crate::model::*;

/// Spans holding a unit on `state` that overlap `window`, clamped to it.
pub fn clamped_overlaps(state: &ItemState, window: Span) -> Vec<Span> {
    state
        .overlapping(window)
        .map(|a| a.span.clamp_to(&window))
        .collect()
}

/// How many of `spans` cover each stretch of time: `(at, level)` pairs sorted by `at`,
/// where `level` holds from `at` until the next pair. The last pair always has level 0.
///
/// All edges at one instant are folded into a single step, so touching spans never stack.
pub fn coverage(spans: &[Span]) -> Vec<(Ms, u32)> {
    let mut edges: Vec<(Ms, bool)> = spans
        .iter()
        .flat_map(|s| [(s.start, true), (s.end, false)])
        .collect();
    edges.sort_unstable_by_key(|&(at, _)| at);

    let mut steps: Vec<(Ms, u32)> = Vec::new();
    let mut level: u32 = 0;
    for (at, opens) in edges {
        // An end is never seen before its own start, so this can't underflow.
        level = if opens { level + 1 } else { level.saturating_sub(1) };
        match steps.last_mut() {
            Some(last) if last.0 == at => last.1 = level,
            _ => steps.push((at, level)),
        }
    }
    steps
}

/// Largest number of spans covering any single instant.
pub fn peak_concurrency(spans: &[Span]) -> u32 {
    coverage(spans).iter().map(|&(_, level)| level).max().unwrap_or(0)
}

/// Units still free for the whole of `window`.
pub fn remaining_units(state: &ItemState, window: Span) -> u32 {
    let peak = peak_concurrency(&clamped_overlaps(state, window));
    state.item.units.saturating_sub(peak)
}

/// Sub-windows of `window` in which at least one unit is free, in order and disjoint.
pub fn free_windows(state: &ItemState, window: Span) -> Vec<Span> {
    let units = state.item.units;
    if units == 0 {
        return Vec::new();
    }

    let mut free = Vec::new();
    let mut open = Some(window.start);
    for (at, level) in coverage(&clamped_overlaps(state, window)) {
        match (open, level < units) {
            (None, true) => open = Some(at),
            (Some(start), false) => {
                if at > start {
                    free.push(Span::new(start, at));
                }
                open = None;
            }
            _ => {}
        }
    }
    if let Some(start) = open
        && start < window.end
    {
        free.push(Span::new(start, window.end));
    }
    free
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const H: Ms = 3_600_000;

    fn item_with(units: u32, spans: &[(Ms, Ms)]) -> ItemState {
        let mut st = ItemState::new(RentalItem::new("kayak", units));
        for &(start, end) in spans {
            st.insert_active(ActiveSpan {
                id: Ulid::new(),
                span: Span::new(start, end),
            });
        }
        st
    }

    #[test]
    fn peak_of_nothing_is_zero() {
        assert_eq!(peak_concurrency(&[]), 0);
    }

    #[test]
    fn peak_touching_spans_do_not_stack() {
        let spans = [Span::new(0, 10), Span::new(10, 20), Span::new(20, 30)];
        assert_eq!(peak_concurrency(&spans), 1);
    }

    #[test]
    fn peak_counts_nested_overlap() {
        let spans = [Span::new(0, 100), Span::new(10, 50), Span::new(20, 30), Span::new(60, 70)];
        assert_eq!(peak_concurrency(&spans), 3);
    }

    #[test]
    fn remaining_units_ignores_bookings_outside_window() {
        let st = item_with(3, &[(0, H), (0, H), (2 * H, 3 * H)]);
        assert_eq!(remaining_units(&st, Span::new(0, H)), 1);
        assert_eq!(remaining_units(&st, Span::new(H, 2 * H)), 3);
        assert_eq!(remaining_units(&st, Span::new(0, 3 * H)), 1);
    }

    #[test]
    fn remaining_units_saturates_at_zero() {
        // Restored data may exceed capacity; never underflow.
        let st = item_with(1, &[(0, H), (0, H)]);
        assert_eq!(remaining_units(&st, Span::new(0, H)), 0);
    }

    #[test]
    fn free_windows_single_unit() {
        let st = item_with(1, &[(2 * H, 3 * H), (5 * H, 6 * H)]);
        let free = free_windows(&st, Span::new(0, 8 * H));
        assert_eq!(
            free,
            vec![Span::new(0, 2 * H), Span::new(3 * H, 5 * H), Span::new(6 * H, 8 * H)]
        );
    }

    #[test]
    fn free_windows_multi_unit_only_removes_saturated() {
        let st = item_with(2, &[(0, 4 * H), (H, 2 * H), (3 * H, 5 * H)]);
        let free = free_windows(&st, Span::new(0, 6 * H));
        assert_eq!(
            free,
            vec![Span::new(0, H), Span::new(2 * H, 3 * H), Span::new(4 * H, 6 * H)]
        );
    }

    #[test]
    fn free_windows_zero_units_is_empty() {
        let st = item_with(0, &[]);
        assert!(free_windows(&st, Span::new(0, H)).is_empty());
    }

    #[test]
    fn coverage_of_nothing_is_empty() {
        assert!(coverage(&[]).is_empty());
    }

    #[test]
    fn coverage_folds_edges_at_one_instant() {
        let steps = coverage(&[Span::new(0, 10), Span::new(10, 20), Span::new(0, 20)]);
        assert_eq!(steps, vec![(0, 2), (10, 2), (20, 0)]);
    }

    #[test]
    fn coverage_ignores_input_order() {
        let steps = coverage(&[Span::new(35, 50), Span::new(0, 30), Span::new(10, 40)]);
        assert_eq!(steps, vec![(0, 1), (10, 2), (30, 1), (35, 2), (40, 1), (50, 0)]);
    }

    #[test]
    fn free_windows_fully_booked_window() {
        let st = item_with(1, &[(0, 10 * H)]);
        assert!(free_windows(&st, Span::new(H, 2 * H)).is_empty());
    }

    #[test]
    fn free_windows_back_to_back_bookings_leave_no_gap() {
        let st = item_with(1, &[(H, 2 * H), (2 * H, 3 * H)]);
        assert_eq!(
            free_windows(&st, Span::new(0, 4 * H)),
            vec![Span::new(0, H), Span::new(3 * H, 4 * H)]
        );
    }
}
