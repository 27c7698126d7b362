use std::collections::{BTreeMap, HashMap};

use crate::limits::SLOT_MINUTES;
use crate::model::{Min, Slot, SlotId, Span};

use super::Rejection;

/// Start time → slot id. Recurring slots go in first, dated slots overwrite
/// them at the same start.
fn override_map(dated: &[Slot], recurring: &[Slot]) -> BTreeMap<Min, SlotId> {
    let mut by_start = BTreeMap::new();
    for slot in recurring {
        by_start.insert(slot.span.start, slot.id);
    }
    for slot in dated {
        by_start.insert(slot.span.start, slot.id);
    }
    by_start
}

/// A recurring and a dated slot with the identical span is corrupt data,
/// not an override.
fn find_conflict(dated: &[Slot], recurring: &[Slot]) -> Option<Rejection> {
    let recurring_by_span: HashMap<Span, SlotId> =
        recurring.iter().map(|s| (s.span, s.id)).collect();
    dated.iter().find_map(|d| {
        recurring_by_span.get(&d.span).map(|&r| Rejection::Conflict {
            span: d.span,
            recurring: r,
            dated: d.id,
        })
    })
}

/// Ids of the slots covering `[from, to)` one increment at a time, dated
/// slots taking precedence over recurring ones.
///
/// Fails on the first uncovered increment, or when a recurring and a dated
/// slot share a span. `from == to` yields an empty list. Input order does
/// not matter.
pub fn check_continuity(
    dated: &[Slot],
    recurring: &[Slot],
    from: Min,
    to: Min,
) -> Result<Vec<SlotId>, Rejection> {
    if let Some(conflict) = find_conflict(dated, recurring) {
        return Err(conflict);
    }
    let by_start = override_map(dated, recurring);

    let mut ids = Vec::with_capacity(to.saturating_sub(from).div_ceil(SLOT_MINUTES) as usize);
    let mut current = from;
    while current < to {
        let Some(&id) = by_start.get(&current) else {
            return Err(Rejection::Gap { at: current });
        };
        ids.push(id);
        current += SLOT_MINUTES;
    }
    Ok(ids)
}

/// Like [`check_continuity`] but skips uncovered increments and ignores
/// conflicts. For reading back slots that are already known to be valid.
pub fn covering_ids(dated: &[Slot], recurring: &[Slot], from: Min, to: Min) -> Vec<SlotId> {
    let by_start = override_map(dated, recurring);
    (from..to)
        .step_by(SLOT_MINUTES as usize)
        .filter_map(|t| by_start.get(&t).copied())
        .collect()
}
