//! Storage seam for slots, events, and schedule links.
//!
//! [`ScheduleStore`] is what the availability core reads and writes;
//! [`CatalogStore`] covers the record keeping around it. [`Ledger`] implements
//! both over in-memory state backed by the write-ahead log.

mod ledger;

pub use ledger::Ledger;

use async_trait::async_trait;
use chrono::{NaiveDate, Weekday};

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// `(slot, date)` already carries a link.
    LinkTaken { slot_id: SlotId, date: NaiveDate },
    /// The worker already has a slot with this anchor and start.
    DuplicateSlot {
        worker_id: WorkerId,
        anchor: SlotAnchor,
        from: Min,
    },
    NotFound(Entity),
    LimitExceeded(&'static str),
    /// The backing log or state is unusable.
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::LinkTaken { slot_id, date } => {
                write!(f, "slot {slot_id} is already booked on {date}")
            }
            StoreError::DuplicateSlot {
                worker_id,
                anchor,
                from,
            } => write!(
                f,
                "worker {worker_id} already has a {anchor:?} slot at {}",
                format_hhmm(*from)
            ),
            StoreError::NotFound(entity) => write!(f, "not found: {entity}"),
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Slot and schedule-link access used by the availability core.
///
/// Range queries select slots whose start lies in `[from, to)`. Link
/// creation is insert-or-fail on `(slot_id, date)` and all-or-nothing for
/// the batch.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn recurring_slots(
        &self,
        worker_id: WorkerId,
        day: Weekday,
        from: Min,
        to: Min,
    ) -> Result<Vec<Slot>, StoreError>;

    async fn date_slots(
        &self,
        worker_id: WorkerId,
        date: NaiveDate,
        from: Min,
        to: Min,
    ) -> Result<Vec<Slot>, StoreError>;

    /// Unknown ids are skipped.
    async fn slots_by_ids(&self, ids: &[SlotId]) -> Result<Vec<Slot>, StoreError>;

    async fn create_links(&self, links: &[ScheduleLink]) -> Result<(), StoreError>;

    /// Rewrite existing links (matched by id).
    async fn update_links(&self, links: &[ScheduleLink]) -> Result<(), StoreError>;

    async fn delete_links(&self, links: &[ScheduleLink]) -> Result<(), StoreError>;

    async fn links_by_slot(&self, slot_id: SlotId) -> Result<Vec<ScheduleLink>, StoreError>;

    async fn links_by_event(&self, event_id: EventId) -> Result<Vec<ScheduleLink>, StoreError>;
}

/// Slot, event, and worker bookkeeping.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Create a slot and assign its id.
    async fn insert_slot(
        &self,
        worker_id: WorkerId,
        anchor: SlotAnchor,
        from: Min,
    ) -> Result<Slot, StoreError>;

    /// Remove a slot together with any links on it.
    async fn remove_slot(&self, id: SlotId) -> Result<Slot, StoreError>;

    /// Remove a worker with all of its slots, events, and links.
    /// Returns how many slots went with it.
    async fn remove_worker(&self, worker_id: WorkerId) -> Result<usize, StoreError>;

    async fn event(&self, id: EventId) -> Result<Option<Event>, StoreError>;

    /// Record a new event and assign its id.
    async fn insert_event(&self, draft: NewEvent) -> Result<Event, StoreError>;

    /// Overwrite an existing event. The worker may not change.
    async fn save_event(&self, event: &Event) -> Result<(), StoreError>;

    /// Remove an event together with any links it still holds.
    async fn remove_event(&self, id: EventId) -> Result<Event, StoreError>;
}
