use chrono::NaiveDate;

use crate::limits::MINUTES_PER_DAY;
use crate::model::*;
use crate::observability::{self, outcome_label};
use crate::store::{CatalogStore, ScheduleStore};

use super::{
    DeltaPlan, EngineError, Rejection, Scheduler, merge_availability, plan_delta, validate_range,
    validate_window,
};

impl<S: ScheduleStore + CatalogStore> Scheduler<S> {
    /// Ids of the slots covering `[from, to)` on `date`, in time order.
    ///
    /// Nothing is written: these are the slots `create_event` would link.
    pub async fn check_and_reserve(
        &self,
        worker_id: WorkerId,
        date: NaiveDate,
        from: Min,
        to: Min,
    ) -> Result<Vec<SlotId>, EngineError> {
        validate_window(Span::new(from, to))?;
        let lock = self.worker_lock(worker_id);
        let _serial = lock.lock().await;
        self.reserve_locked(worker_id, date, from, to, None).await
    }

    /// Caller holds the worker lock.
    pub(super) async fn reserve_locked(
        &self,
        worker_id: WorkerId,
        date: NaiveDate,
        from: Min,
        to: Min,
        owner: Option<EventId>,
    ) -> Result<Vec<SlotId>, EngineError> {
        let result = async {
            let day = merge_availability(&*self.store, worker_id, date, from, to).await?;
            let ids = day.check(from, to)?;
            self.ensure_unbooked(&ids, date, owner).await?;
            Ok::<_, EngineError>(ids)
        }
        .await;
        metrics::counter!(observability::RESERVATIONS_TOTAL, "outcome" => outcome_label(&result))
            .increment(1);
        if let Err(e) = &result {
            tracing::debug!("worker {worker_id}: {date} [{from}, {to}) refused: {e}");
        }
        result
    }

    /// Fail if any of `ids` is already linked on `date` to an event other
    /// than `owner`. Advisory: `create_links` rechecks on write.
    async fn ensure_unbooked(
        &self,
        ids: &[SlotId],
        date: NaiveDate,
        owner: Option<EventId>,
    ) -> Result<(), EngineError> {
        for &slot_id in ids {
            let links = self.store.links_by_slot(slot_id).await?;
            if links
                .iter()
                .any(|l| l.date == date && Some(l.event_id) != owner)
            {
                return Err(Rejection::AlreadyBooked { slot_id, date }.into());
            }
        }
        Ok(())
    }

    /// Work out which links moving `event_id` from `old` to `new` creates,
    /// releases, and keeps. Nothing is written.
    pub async fn plan_update(
        &self,
        event_id: EventId,
        worker_id: WorkerId,
        old: EventWindow,
        new: EventWindow,
    ) -> Result<DeltaPlan, EngineError> {
        validate_window(new.span)?;
        let lock = self.worker_lock(worker_id);
        let _serial = lock.lock().await;
        self.plan_locked(event_id, worker_id, old, new).await
    }

    pub(super) async fn plan_locked(
        &self,
        event_id: EventId,
        worker_id: WorkerId,
        old: EventWindow,
        new: EventWindow,
    ) -> Result<DeltaPlan, EngineError> {
        let result = async {
            let new_day =
                merge_availability(&*self.store, worker_id, new.date, 0, MINUTES_PER_DAY).await?;
            let held = self.held_slots(event_id, old.date).await?;
            let plan = plan_delta(old, new, &new_day, &held)?;
            self.ensure_unbooked(&plan.for_create, plan.new_date, Some(event_id))
                .await?;
            Ok::<_, EngineError>(plan)
        }
        .await;
        metrics::counter!(observability::PLANS_TOTAL, "outcome" => outcome_label(&result))
            .increment(1);
        if let Ok(plan) = &result {
            tracing::debug!(
                "event {event_id}: {old} -> {new}: create {:?}, delete {:?}, update {:?}",
                plan.for_create,
                plan.for_delete,
                plan.for_update
            );
        }
        result
    }

    /// Slots `event_id` is linked to on `date`.
    async fn held_slots(&self, event_id: EventId, date: NaiveDate) -> Result<Vec<Slot>, EngineError> {
        let ids: Vec<SlotId> = self
            .store
            .links_by_event(event_id)
            .await?
            .into_iter()
            .filter(|l| l.date == date)
            .map(|l| l.slot_id)
            .collect();
        Ok(self.store.slots_by_ids(&ids).await?)
    }

    /// The worker's effective slots on `date` starting in `[from, to)` that
    /// nobody has booked yet.
    pub async fn open_slots(
        &self,
        worker_id: WorkerId,
        date: NaiveDate,
        from: Min,
        to: Min,
    ) -> Result<Vec<Slot>, EngineError> {
        validate_range(from, to)?;
        let day = merge_availability(&*self.store, worker_id, date, from, to).await?;
        let mut open = Vec::new();
        for id in day.covering(from, to) {
            let Some(slot) = day.slot(id) else { continue };
            let booked = self
                .store
                .links_by_slot(id)
                .await?
                .iter()
                .any(|l| l.date == date);
            if !booked {
                open.push(slot.clone());
            }
        }
        Ok(open)
    }

    /// The event and the slots it currently holds, in time order.
    pub async fn event_slots(&self, event_id: EventId) -> Result<(Event, Vec<Slot>), EngineError> {
        let event = self
            .store
            .event(event_id)
            .await?
            .ok_or(EngineError::NotFound(Entity::Event(event_id)))?;
        let ids: Vec<SlotId> = self
            .store
            .links_by_event(event_id)
            .await?
            .iter()
            .map(|l| l.slot_id)
            .collect();
        let slots = self.store.slots_by_ids(&ids).await?;
        Ok((event, slots))
    }
}
