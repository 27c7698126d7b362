use std::collections::HashSet;

use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::store::{CatalogStore, ScheduleStore};

use super::{
    DeltaPlan, EngineError, EventUpdate, Rejection, Scheduler, validate_text, validate_window,
};

impl<S: ScheduleStore + CatalogStore> Scheduler<S> {
    // ── Availability ─────────────────────────────────────────

    /// Toggle a slot on.
    pub async fn add_slot(
        &self,
        worker_id: WorkerId,
        anchor: SlotAnchor,
        from: Min,
    ) -> Result<Slot, EngineError> {
        if from % SLOT_MINUTES != 0 || from > MINUTES_PER_DAY - SLOT_MINUTES {
            return Err(Rejection::InvalidWindow(
                "slot must start on a 30-minute boundary no later than 23:30",
            )
            .into());
        }
        let lock = self.worker_lock(worker_id);
        let _serial = lock.lock().await;
        let slot = self.store.insert_slot(worker_id, anchor, from).await?;
        info!(
            "worker {worker_id}: slot {} on {:?} {}",
            slot.id, anchor, slot.span
        );
        Ok(slot)
    }

    /// Toggle a slot off. Refused while any event still holds it.
    pub async fn remove_slot(&self, slot_id: SlotId) -> Result<Slot, EngineError> {
        let slot = self
            .store
            .slots_by_ids(&[slot_id])
            .await?
            .into_iter()
            .next()
            .ok_or(EngineError::NotFound(Entity::Slot(slot_id)))?;
        let lock = self.worker_lock(slot.worker_id);
        let _serial = lock.lock().await;

        let bookings = self.store.links_by_slot(slot_id).await?.len();
        if bookings > 0 {
            return Err(Rejection::SlotInUse { slot_id, bookings }.into());
        }
        let removed = self.store.remove_slot(slot_id).await?;
        info!("worker {}: slot {slot_id} removed", removed.worker_id);
        Ok(removed)
    }

    /// Remove a worker with all slots, events, and links. Returns how many
    /// slots went.
    pub async fn remove_worker(&self, worker_id: WorkerId) -> Result<usize, EngineError> {
        let lock = self.worker_lock(worker_id);
        let _serial = lock.lock().await;
        let slots = self.store.remove_worker(worker_id).await?;
        info!("worker {worker_id} removed with {slots} slots");
        Ok(slots)
    }

    // ── Events ───────────────────────────────────────────────

    /// Book a new event: check continuity, record the event, link its slots.
    pub async fn create_event(&self, draft: NewEvent) -> Result<Event, EngineError> {
        validate_window(draft.span)?;
        validate_text(&draft.title, draft.location.as_deref())?;
        let lock = self.worker_lock(draft.worker_id);
        let _serial = lock.lock().await;

        let (date, span) = (draft.date, draft.span);
        let ids = self
            .reserve_locked(draft.worker_id, date, span.start, span.end, None)
            .await?;
        let event = self.store.insert_event(draft).await?;
        let links: Vec<ScheduleLink> = ids
            .iter()
            .map(|&slot_id| ScheduleLink::new(slot_id, event.id, date))
            .collect();

        if let Err(e) = self.store.create_links(&links).await {
            if let Err(undo) = self.store.remove_event(event.id).await {
                warn!("event {}: rollback after failed booking failed: {undo}", event.id);
            }
            return Err(e.into());
        }
        info!(
            "event {} booked: worker {} patient {} on {} ({} slots)",
            event.id,
            event.worker_id,
            event.patient_id,
            event.window(),
            links.len()
        );
        Ok(event)
    }

    /// Change an event's window and/or details. The links move by the delta
    /// plan between the old and the new window.
    pub async fn update_event(
        &self,
        event_id: EventId,
        update: &EventUpdate,
    ) -> Result<(Event, DeltaPlan), EngineError> {
        let worker_id = self.event_or_not_found(event_id).await?.worker_id;
        let lock = self.worker_lock(worker_id);
        let _serial = lock.lock().await;

        // Re-read under the lock.
        let current = self.event_or_not_found(event_id).await?;
        let updated = update.apply_to(&current);
        validate_window(updated.span)?;
        validate_text(&updated.title, updated.location.as_deref())?;

        let plan = self
            .plan_locked(event_id, worker_id, current.window(), updated.window())
            .await?;
        let created = self.claim(event_id, &plan).await?;
        if let Err(e) = self.store.save_event(&updated).await {
            if let Err(undo) = self.store.delete_links(&created).await {
                warn!("event {event_id}: rollback after failed save failed: {undo}");
            }
            return Err(e.into());
        }
        self.release(event_id, &plan, &created).await?;

        info!(
            "event {event_id} moved {} -> {}: +{} -{} ={}",
            current.window(),
            updated.window(),
            plan.for_create.len(),
            plan.for_delete.len(),
            plan.for_update.len()
        );
        Ok((updated, plan))
    }

    /// Cancel an event: drop its links, then the event.
    pub async fn delete_event(&self, event_id: EventId) -> Result<Event, EngineError> {
        let worker_id = self.event_or_not_found(event_id).await?.worker_id;
        let lock = self.worker_lock(worker_id);
        let _serial = lock.lock().await;

        let links = self.store.links_by_event(event_id).await?;
        self.store.delete_links(&links).await?;
        let event = self.store.remove_event(event_id).await?;
        info!("event {event_id} cancelled, {} slots released", links.len());
        Ok(event)
    }

    /// Execute a plan from [`Scheduler::plan_update`]: create, then delete,
    /// then update.
    ///
    /// A rejected create leaves everything untouched. Failures after that
    /// are logged, the remaining steps still run, and the first failure is
    /// returned.
    pub async fn apply_plan(&self, event_id: EventId, plan: &DeltaPlan) -> Result<(), EngineError> {
        let worker_id = self.event_or_not_found(event_id).await?.worker_id;
        let lock = self.worker_lock(worker_id);
        let _serial = lock.lock().await;

        let created = self.claim(event_id, plan).await?;
        self.release(event_id, plan, &created).await
    }

    async fn event_or_not_found(&self, event_id: EventId) -> Result<Event, EngineError> {
        self.store
            .event(event_id)
            .await?
            .ok_or(EngineError::NotFound(Entity::Event(event_id)))
    }

    /// Link the plan's new slots. All or nothing.
    async fn claim(
        &self,
        event_id: EventId,
        plan: &DeltaPlan,
    ) -> Result<Vec<ScheduleLink>, EngineError> {
        if plan.for_create.len() > MAX_SLOTS_PER_EVENT {
            return Err(EngineError::LimitExceeded("too many slots for one event"));
        }
        let links: Vec<ScheduleLink> = plan
            .for_create
            .iter()
            .map(|&slot_id| ScheduleLink::new(slot_id, event_id, plan.new_date))
            .collect();
        self.store.create_links(&links).await?;
        Ok(links)
    }

    /// Delete released links and relabel kept ones, skipping the links
    /// `claim` just made.
    async fn release(
        &self,
        event_id: EventId,
        plan: &DeltaPlan,
        created: &[ScheduleLink],
    ) -> Result<(), EngineError> {
        let created: HashSet<Ulid> = created.iter().map(|l| l.id).collect();
        let held: Vec<ScheduleLink> = self
            .store
            .links_by_event(event_id)
            .await?
            .into_iter()
            .filter(|l| l.date == plan.old_date && !created.contains(&l.id))
            .collect();
        let mut first_failure: Option<EngineError> = None;

        let released: Vec<ScheduleLink> = held
            .iter()
            .filter(|l| plan.for_delete.contains(&l.slot_id))
            .cloned()
            .collect();
        if let Err(e) = self.store.delete_links(&released).await {
            warn!("event {event_id}: releasing {} links failed: {e}", released.len());
            first_failure.get_or_insert(e.into());
        }

        let relabelled: Vec<ScheduleLink> = held
            .iter()
            .filter(|l| plan.for_update.contains(&l.slot_id))
            .map(|l| ScheduleLink {
                date: plan.new_date,
                ..l.clone()
            })
            .collect();
        if let Err(e) = self.store.update_links(&relabelled).await {
            warn!("event {event_id}: relabelling {} links failed: {e}", relabelled.len());
            first_failure.get_or_insert(e.into());
        }

        first_failure.map_or(Ok(()), Err)
    }
}
