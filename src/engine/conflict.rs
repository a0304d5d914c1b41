use ulid::Ulid;

use crate::model::*;

use super::availability::peak_concurrency;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Why a reservation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Capacity 1 and this booking is in the way.
    Overlap { booking_id: Ulid },
    /// Peak simultaneous occupancy inside the candidate.
    AtCapacity { occupancy: u32, capacity: u32 },
    /// The scope lock could not be taken in time.
    LockTimeout,
}

impl Rejection {
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::Overlap { .. } => "overlap",
            Rejection::AtCapacity { .. } => "capacity",
            Rejection::LockTimeout => "lock_timeout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    Reject(Rejection),
}

/// Test a buffer-expanded candidate against the active bookings of one scope.
/// `exclude` skips the booking being rescheduled.
///
/// An agent's bucket mixes services, so every booking carries the capacity of
/// its own service. The limit inside the candidate is the smallest capacity
/// among the candidate and the bookings it overlaps: a capacity-1 booking
/// keeps the resource exclusive no matter which service arrives next.
pub fn check_capacity(
    scope: &ScopeState,
    candidate: &Span,
    capacity: u32,
    exclude: Option<Ulid>,
) -> Admission {
    let others: Vec<&ScopeEntry> = scope
        .overlapping(candidate)
        .filter(|e| Some(e.booking_id) != exclude)
        .collect();
    let Some(first) = others.first() else {
        return Admission::Admit;
    };

    let limit = others.iter().map(|e| e.capacity).fold(capacity, u32::min);
    if limit <= 1 {
        let blocker = others.iter().find(|e| e.capacity <= 1).unwrap_or(first);
        return Admission::Reject(Rejection::Overlap {
            booking_id: blocker.booking_id,
        });
    }

    // Only the part inside the candidate matters for the peak.
    let clamped: Vec<Span> = others
        .iter()
        .map(|e| Span::new(e.occupied.start.max(candidate.start), e.occupied.end.min(candidate.end)))
        .collect();
    let occupancy = peak_concurrency(&clamped);
    if occupancy >= limit {
        Admission::Reject(Rejection::AtCapacity { occupancy, capacity: limit })
    } else {
        Admission::Admit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: Ms = MINUTE_MS;

    fn scope_with(spans: &[(Ms, Ms)]) -> (ScopeState, Vec<Ulid>) {
        let entries: Vec<(Ms, Ms, u32)> = spans.iter().map(|&(s, e)| (s, e, 3)).collect();
        mixed_scope(&entries)
    }

    fn mixed_scope(entries: &[(Ms, Ms, u32)]) -> (ScopeState, Vec<Ulid>) {
        let mut s = ScopeState::new(ResourceScope::SpecificAgent(1));
        let mut ids = Vec::new();
        for &(start, end, capacity) in entries {
            let id = Ulid::new();
            s.insert_entry(ScopeEntry {
                booking_id: id,
                occupied: Span::new(start, end),
                capacity,
            });
            ids.push(id);
        }
        (s, ids)
    }

    #[test]
    fn capacity_one_rejects_overlap_with_id() {
        let (scope, ids) = scope_with(&[(0, 40 * M)]);
        assert_eq!(
            check_capacity(&scope, &Span::new(30 * M, 70 * M), 1, None),
            Admission::Reject(Rejection::Overlap { booking_id: ids[0] })
        );
    }

    #[test]
    fn touching_intervals_do_not_conflict() {
        let (scope, _) = scope_with(&[(0, 40 * M)]);
        assert_eq!(check_capacity(&scope, &Span::new(40 * M, 80 * M), 1, None), Admission::Admit);
        assert_eq!(check_capacity(&scope, &Span::new(-40 * M, 0), 1, None), Admission::Admit);
    }

    #[test]
    fn exclude_skips_own_booking() {
        let (scope, ids) = scope_with(&[(0, 40 * M)]);
        assert_eq!(
            check_capacity(&scope, &Span::new(10 * M, 50 * M), 1, Some(ids[0])),
            Admission::Admit
        );
    }

    #[test]
    fn capacity_three_counts_peak() {
        let (scope, _) = scope_with(&[(0, 60 * M), (0, 60 * M), (0, 60 * M)]);
        assert_eq!(
            check_capacity(&scope, &Span::new(0, 60 * M), 3, None),
            Admission::Reject(Rejection::AtCapacity { occupancy: 3, capacity: 3 })
        );
        assert_eq!(
            check_capacity(&scope, &Span::new(60 * M, 120 * M), 3, None),
            Admission::Admit
        );
    }

    #[test]
    fn capacity_two_sequential_bookings_leave_room() {
        // Two bookings inside the candidate that never coexist: peak is 1.
        let (scope, _) = scope_with(&[(0, 30 * M), (30 * M, 60 * M)]);
        assert_eq!(check_capacity(&scope, &Span::new(0, 60 * M), 2, None), Admission::Admit);
    }

    #[test]
    fn exclusive_booking_blocks_group_service() {
        let (scope, ids) = mixed_scope(&[(0, 40 * M, 1)]);
        assert_eq!(
            check_capacity(&scope, &Span::new(0, 60 * M), 3, None),
            Admission::Reject(Rejection::Overlap { booking_id: ids[0] })
        );
        assert_eq!(check_capacity(&scope, &Span::new(40 * M, 100 * M), 3, None), Admission::Admit);
    }

    #[test]
    fn smallest_overlapping_capacity_wins() {
        // A capacity-2 booking next to two capacity-8 ones: the stack is full
        // for anything that overlaps the capacity-2 booking.
        let (scope, _) = mixed_scope(&[(0, 60 * M, 8), (0, 60 * M, 2)]);
        assert_eq!(
            check_capacity(&scope, &Span::new(0, 60 * M), 8, None),
            Admission::Reject(Rejection::AtCapacity { occupancy: 2, capacity: 2 })
        );
        let (scope, _) = mixed_scope(&[(0, 60 * M, 8), (0, 60 * M, 8)]);
        assert_eq!(check_capacity(&scope, &Span::new(0, 60 * M), 8, None), Admission::Admit);
    }

    #[test]
    fn rejection_reasons() {
        assert_eq!(Rejection::Overlap { booking_id: Ulid::nil() }.reason(), "overlap");
        assert_eq!(Rejection::AtCapacity { occupancy: 1, capacity: 1 }.reason(), "capacity");
        assert_eq!(Rejection::LockTimeout.reason(), "lock_timeout");
    }
}
