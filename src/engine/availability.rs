use crate::model::*;

// ── Free-range computation ────────────────────────────────────────

/// Sub-ranges of `slot` not covered by any active booking. Empty means the
/// slot is fully consumed. Cancelled bookings are ignored.
pub fn free_ranges<'a>(slot: &TimeRange, bookings: impl IntoIterator<Item = &'a Booking>) -> Vec<TimeRange> {
    let mut taken: Vec<TimeRange> = bookings
        .into_iter()
        .filter(|b| b.is_active() && b.range.overlaps(slot))
        .map(|b| b.range)
        .collect();
    taken.sort_by_key(|r| r.start());
    subtract_intervals(&[*slot], &merge_overlapping(&taken))
}

/// Merge sorted overlapping/adjacent ranges of one date into disjoint ranges.
pub fn merge_overlapping(sorted: &[TimeRange]) -> Vec<TimeRange> {
    let mut merged: Vec<TimeRange> = Vec::new();
    for &range in sorted {
        if let Some(last) = merged.last_mut()
            && range.start() <= last.end() {
                if range.end() > last.end() {
                    *last = TimeRange::within(last.date(), last.start(), range.end());
                }
                continue;
            }
        merged.push(range);
    }
    merged
}

/// `base` minus `to_remove`; both sorted by start and on the same date.
pub fn subtract_intervals(base: &[TimeRange], to_remove: &[TimeRange]) -> Vec<TimeRange> {
    let mut result = Vec::new();
    let mut ri = 0;

    for b in base {
        let mut current_start = b.start();
        let current_end = b.end();

        while ri < to_remove.len() && to_remove[ri].end() <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start() < current_end {
            let r = &to_remove[j];
            if r.start() > current_start {
                result.push(TimeRange::within(b.date(), current_start, r.start()));
            }
            current_start = current_start.max(r.end());
            j += 1;
        }

        if current_start < current_end {
            result.push(TimeRange::within(b.date(), current_start, current_end));
        }
    }

    result
}
