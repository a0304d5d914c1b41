use crate::model::*;

// ── Interval algebra ───────────────────────────────────────────────

/// Open windows minus closures. Both inputs may be unsorted; the result is
/// sorted and disjoint. A closure covering a whole window removes it.
pub fn free_windows(mut open: Vec<Span>, mut closed: Vec<Span>) -> Vec<Span> {
    open.sort_by_key(|s| s.start);
    let mut free = merge_overlapping(&open);

    if !closed.is_empty() {
        closed.sort_by_key(|s| s.start);
        free = subtract_intervals(&free, &merge_overlapping(&closed));
    }
    free
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

/// +1 at every start, -1 at every end. Ends sort before starts at the same
/// instant, so touching half-open intervals never count as concurrent.
fn sweep_events(allocs: &[Span]) -> Vec<(Ms, i32)> {
    let mut events: Vec<(Ms, i32)> = Vec::with_capacity(allocs.len() * 2);
    for a in allocs {
        events.push((a.start, 1));
        events.push((a.end, -1));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
    events
}

/// Largest number of allocations covering a single instant.
pub fn peak_concurrency(allocs: &[Span]) -> u32 {
    let mut count: u32 = 0;
    let mut peak: u32 = 0;
    for (_, delta) in sweep_events(allocs) {
        if delta > 0 {
            count += 1;
            peak = peak.max(count);
        } else {
            count -= 1;
        }
    }
    peak
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let remove = vec![Span::new(200, 300)];
        assert_eq!(subtract_intervals(&base, &remove), base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![Span::new(100, 200)];
        let remove = vec![Span::new(50, 250)];
        assert!(subtract_intervals(&base, &remove).is_empty());
    }

    #[test]
    fn subtract_partial_edges() {
        let base = vec![Span::new(100, 200)];
        assert_eq!(subtract_intervals(&base, &[Span::new(50, 150)]), vec![Span::new(150, 200)]);
        assert_eq!(subtract_intervals(&base, &[Span::new(150, 250)]), vec![Span::new(100, 150)]);
    }

    #[test]
    fn subtract_multiple_punches() {
        let base = vec![Span::new(0, 1000)];
        let remove = vec![Span::new(100, 200), Span::new(400, 500), Span::new(800, 900)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![
                Span::new(0, 100),
                Span::new(200, 400),
                Span::new(500, 800),
                Span::new(900, 1000),
            ]
        );
    }

    // ── merge_overlapping ────────────────────────────────

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![Span::new(100, 300), Span::new(200, 400), Span::new(500, 600)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(100, 400), Span::new(500, 600)]);
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(100, 200), Span::new(200, 300)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(100, 300)]);
    }

    // ── free_windows ────────────────────────────────

    #[test]
    fn lunch_break_splits_day() {
        let free = free_windows(
            vec![Span::new(13 * H, 17 * H), Span::new(9 * H, 12 * H + 30 * M)],
            vec![Span::new(12 * H, 13 * H)],
        );
        assert_eq!(free, vec![Span::new(9 * H, 12 * H), Span::new(13 * H, 17 * H)]);
    }

    #[test]
    fn break_covering_window_removes_it() {
        let free = free_windows(
            vec![Span::new(9 * H, 10 * H), Span::new(14 * H, 16 * H)],
            vec![Span::new(8 * H, 11 * H)],
        );
        assert_eq!(free, vec![Span::new(14 * H, 16 * H)]);
    }

    #[test]
    fn overlapping_breaks_merge() {
        let free = free_windows(
            vec![Span::new(9 * H, 17 * H)],
            vec![Span::new(12 * H, 13 * H), Span::new(11 * H, 12 * H + 30 * M)],
        );
        assert_eq!(free, vec![Span::new(9 * H, 11 * H), Span::new(13 * H, 17 * H)]);
    }

    // ── peak_concurrency ────────────────────────────

    #[test]
    fn peak_counts_simultaneous_only() {
        // Three bookings in a row touching end-to-start never coexist.
        let chain = vec![Span::new(0, 10), Span::new(10, 20), Span::new(20, 30)];
        assert_eq!(peak_concurrency(&chain), 1);

        let stacked = vec![Span::new(0, 100), Span::new(10, 20), Span::new(15, 50), Span::new(60, 70)];
        assert_eq!(peak_concurrency(&stacked), 3);
        assert_eq!(peak_concurrency(&[]), 0);
    }
}
