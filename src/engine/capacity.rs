use ulid::Ulid;

use crate::model::*;

// ── Capacity accounting ───────────────────────────────────────────
//
// Interval-level check: an existing assignment whose window touches the
// proposed window at all counts with its full allocation, even if the two only
// share a single day. There is no per-day sweep.

/// Sum of allocations over the ledger's assignments that overlap `window`,
/// skipping `exclude` (the assignment being replaced on update).
pub fn total_allocated(ledger: &EngineerLedger, window: &DateSpan, exclude: Option<Ulid>) -> Percent {
    sum_allocations(ledger.overlapping(window), exclude)
}

/// Same as [`total_allocated`] over an arbitrary, unsorted set of assignments.
pub fn sum_overlapping<'a>(
    assignments: impl IntoIterator<Item = &'a Assignment>,
    window: &DateSpan,
    exclude: Option<Ulid>,
) -> Percent {
    sum_allocations(
        assignments.into_iter().filter(|a| a.span.overlaps(window)),
        exclude,
    )
}

fn sum_allocations<'a>(
    assignments: impl Iterator<Item = &'a Assignment>,
    exclude: Option<Ulid>,
) -> Percent {
    assignments
        .filter(|a| Some(a.id) != exclude)
        .map(|a| a.allocation)
        .sum()
}

/// Decide whether `requested` more percent fits under `max_capacity` given
/// what is already committed. Performs no mutation.
///
/// A zero request is always admitted, even for an engineer who is already over
/// capacity (e.g. after their capacity was lowered).
pub fn admission(max_capacity: Percent, total_allocated: Percent, requested: Percent) -> Admission {
    let available = i64::from(max_capacity) - i64::from(total_allocated);
    let admitted = requested == 0 || i64::from(requested) <= available;
    Admission {
        admitted,
        available,
        requested,
        total_allocated,
    }
}

/// [`total_allocated`] followed by [`admission`] against the ledger's engineer.
pub fn check(
    ledger: &EngineerLedger,
    window: &DateSpan,
    requested: Percent,
    exclude: Option<Ulid>,
) -> Admission {
    let total = total_allocated(ledger, window, exclude);
    admission(ledger.engineer.max_capacity, total, requested)
}
