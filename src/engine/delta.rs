use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::model::{EventWindow, Min, Slot, SlotId};

use super::Rejection;
use super::merge::Availability;

/// What moving an event from one window to another does to its links.
///
/// `for_delete` refers to occurrences on `old_date`; `for_create` and
/// `for_update` to occurrences on `new_date`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeltaPlan {
    pub old_date: NaiveDate,
    pub new_date: NaiveDate,
    pub for_create: Vec<SlotId>,
    pub for_delete: Vec<SlotId>,
    pub for_update: Vec<SlotId>,
}

impl DeltaPlan {
    pub fn is_noop(&self) -> bool {
        self.for_create.is_empty() && self.for_delete.is_empty() && self.for_update.is_empty()
    }
}

/// Ids of held slots starting in `[from, to)`, by start time.
fn held_within(held: &BTreeMap<Min, SlotId>, from: Min, to: Min) -> Vec<SlotId> {
    if from >= to {
        return Vec::new();
    }
    held.range(from..to).map(|(_, id)| *id).collect()
}

/// Split the move from `old` to `new` into slots to claim, release, and keep.
///
/// `new_day` is the worker's availability on `new.date`; `held` are the
/// slots the event is linked to on `old.date`. Each boundary is compared on
/// `(date, time)`: a start moving earlier or an end moving later needs
/// fresh coverage, checked for continuity; a start moving later or an end
/// moving earlier releases held slots. The overlap survives as updates,
/// but only when the date is unchanged.
///
/// A gap in the new coverage rejects the whole plan.
pub fn plan_delta(
    old: EventWindow,
    new: EventWindow,
    new_day: &Availability,
    held: &[Slot],
) -> Result<DeltaPlan, Rejection> {
    let held: BTreeMap<Min, SlotId> = held.iter().map(|s| (s.span.start, s.id)).collect();
    let mut plan = DeltaPlan {
        old_date: old.date,
        new_date: new.date,
        for_create: Vec::new(),
        for_delete: Vec::new(),
        for_update: Vec::new(),
    };

    let (old_start, old_end) = (old.start_key(), old.end_key());
    let (new_start, new_end) = (new.start_key(), new.end_key());

    if new_start < old_start {
        let (_, check_to) = old_start.min(new_end);
        plan.for_create
            .extend(new_day.check(new.span.start, check_to)?);
    } else if old_start < new_start {
        let (_, get_to) = old_end.min(new_start);
        plan.for_delete
            .extend(held_within(&held, old.span.start, get_to));
    }

    if new_end > old_end {
        let (_, check_from) = old_end.max(new_start);
        plan.for_create
            .extend(new_day.check(check_from, new.span.end)?);
    } else if old_end > new_end {
        let (_, get_from) = new_end.max(old_start);
        plan.for_delete
            .extend(held_within(&held, get_from, old.span.end));
    }

    if new.date == old.date {
        let from = old.span.start.max(new.span.start);
        let to = old.span.end.min(new.span.end);
        plan.for_update.extend(held_within(&held, from, to));
    }

    Ok(plan)
}
