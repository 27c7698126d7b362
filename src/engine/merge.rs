use chrono::{Datelike, NaiveDate};

use crate::model::{Min, Slot, SlotId, WorkerId};
use crate::store::ScheduleStore;

use super::continuity::{check_continuity, covering_ids};
use super::{EngineError, Rejection};

/// A worker's slots for one date, kept apart by kind so override precedence
/// is applied explicitly. Both lists are sorted by start time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Availability {
    pub recurring: Vec<Slot>,
    pub dated: Vec<Slot>,
}

impl Availability {
    /// Continuity over `[from, to)`. Only slots starting in that range take
    /// part, so a conflict elsewhere on the day does not reject it.
    pub fn check(&self, from: Min, to: Min) -> Result<Vec<SlotId>, Rejection> {
        let part = self.starting_within(from, to);
        check_continuity(&part.dated, &part.recurring, from, to)
    }

    /// The slots starting in `[from, to)`.
    pub fn starting_within(&self, from: Min, to: Min) -> Availability {
        let within = |slots: &[Slot]| -> Vec<Slot> {
            slots
                .iter()
                .filter(|s| s.span.start >= from && s.span.start < to)
                .cloned()
                .collect()
        };
        Availability {
            recurring: within(&self.recurring),
            dated: within(&self.dated),
        }
    }

    pub fn covering(&self, from: Min, to: Min) -> Vec<SlotId> {
        covering_ids(&self.dated, &self.recurring, from, to)
    }

    pub fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.dated
            .iter()
            .chain(&self.recurring)
            .find(|s| s.id == id)
    }
}

/// Fetch the recurring slots for `date`'s weekday and the slots pinned to
/// `date`, both restricted to starts in `[from, to)`.
pub async fn merge_availability<S: ScheduleStore + ?Sized>(
    store: &S,
    worker_id: WorkerId,
    date: NaiveDate,
    from: Min,
    to: Min,
) -> Result<Availability, EngineError> {
    let mut recurring = store
        .recurring_slots(worker_id, date.weekday(), from, to)
        .await?;
    let mut dated = store.date_slots(worker_id, date, from, to).await?;
    recurring.sort_by_key(|s| s.span.start);
    dated.sort_by_key(|s| s.span.start);
    Ok(Availability { recurring, dated })
}
