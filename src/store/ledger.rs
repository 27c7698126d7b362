use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{NaiveDate, Weekday};
use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

use super::{CatalogStore, ScheduleStore, StoreError};

pub type SharedWorkerState = Arc<RwLock<WorkerState>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        change: Change,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        changes: Vec<Change>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = Vec<(Change, oneshot::Sender<io::Result<()>>)>;

/// Owns the WAL. Blocks for one append, drains whatever else is already
/// queued, then commits the whole batch with a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut batch: Pending = Vec::new();
    while let Some(cmd) = rx.recv().await {
        let mut next = Some(cmd);
        while let Some(cmd) = next.take() {
            match cmd {
                WalCommand::Append { change, response } => {
                    batch.push((change, response));
                    next = rx.try_recv().ok();
                }
                control => {
                    // Appends queued before a control command land first.
                    commit_batch(&mut wal, &mut batch);
                    handle_control(&mut wal, control);
                }
            }
        }
        commit_batch(&mut wal, &mut batch);
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Pending) {
    if batch.is_empty() {
        return;
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let appended = batch
        .iter()
        .try_for_each(|(change, _)| wal.append_buffered(change));
    // Flush even when an append failed so its partial bytes don't leak into
    // the next batch; those callers are told this batch failed.
    let flushed = wal.flush_sync();
    let result = appended.and(flushed);

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("wal commit of {} changes failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { changes, response } => {
            let _ = response.send(wal.compact(&changes));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Slots, events, and schedule links for every worker, persisted through
/// the write-ahead log.
///
/// Each worker's state sits behind its own lock; mutations hold it across
/// WAL append + apply. Batches touching several workers lock them in id
/// order. `gate` is held shared by every mutation and exclusively by
/// compaction, so a compacted log never misses an in-flight change.
pub struct Ledger {
    workers: DashMap<WorkerId, SharedWorkerState>,
    /// Reverse lookups: entity id → owning worker.
    slot_owner: DashMap<SlotId, WorkerId>,
    event_owner: DashMap<EventId, WorkerId>,
    next_slot_id: AtomicU64,
    next_event_id: AtomicU64,
    gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl Ledger {
    /// Replay the log at `wal_path` and start its writer task.
    /// Must be called inside a tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let changes = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let ledger = Self {
            workers: DashMap::new(),
            slot_owner: DashMap::new(),
            event_owner: DashMap::new(),
            next_slot_id: AtomicU64::new(1),
            next_event_id: AtomicU64::new(1),
            gate: RwLock::new(()),
            wal_tx,
        };

        // Replay into plain state first; nothing else can observe it yet.
        let mut restored: HashMap<WorkerId, WorkerState> = HashMap::new();
        for change in &changes {
            match change {
                Change::IdsReserved {
                    next_slot_id,
                    next_event_id,
                } => {
                    ledger.next_slot_id.fetch_max(*next_slot_id, Ordering::SeqCst);
                    ledger.next_event_id.fetch_max(*next_event_id, Ordering::SeqCst);
                }
                Change::WorkerRemoved { id } => {
                    if let Some(ws) = restored.remove(id) {
                        ledger.forget(&ws);
                    }
                }
                other => {
                    if let Some(worker_id) = other.worker_id() {
                        let ws = restored
                            .entry(worker_id)
                            .or_insert_with(|| WorkerState::new(worker_id));
                        ledger.apply_to_worker(ws, other);
                    }
                }
            }
        }

        let worker_count = restored.len();
        for (id, ws) in restored {
            ledger.workers.insert(id, Arc::new(RwLock::new(ws)));
        }
        tracing::info!(
            "ledger {}: replayed {} changes, {} workers, {} slots, {} events",
            wal_path.display(),
            changes.len(),
            worker_count,
            ledger.slot_owner.len(),
            ledger.event_owner.len()
        );
        Ok(ledger)
    }

    /// Apply a change to one worker's state and keep the indexes in step.
    fn apply_to_worker(&self, ws: &mut WorkerState, change: &Change) {
        match change {
            Change::SlotAdded { slot } => {
                self.next_slot_id.fetch_max(slot.id + 1, Ordering::SeqCst);
                self.slot_owner.insert(slot.id, ws.id);
                ws.insert_slot(slot.clone());
            }
            Change::SlotRemoved { id, .. } => {
                ws.remove_slot(*id);
                self.slot_owner.remove(id);
            }
            Change::EventSaved { event } => {
                self.next_event_id.fetch_max(event.id + 1, Ordering::SeqCst);
                self.event_owner.insert(event.id, ws.id);
                ws.events.insert(event.id, event.clone());
            }
            Change::EventRemoved { id, .. } => {
                ws.remove_event(*id);
                self.event_owner.remove(id);
            }
            Change::LinksCreated { links, .. } => {
                for link in links {
                    ws.insert_link(link.clone());
                }
            }
            Change::LinksUpdated { links, .. } => {
                for link in links {
                    ws.remove_link(link.id);
                    ws.insert_link(link.clone());
                }
            }
            Change::LinksDeleted { ids, .. } => {
                for id in ids {
                    ws.remove_link(*id);
                }
            }
            // Handled at the map level.
            Change::WorkerRemoved { .. } | Change::IdsReserved { .. } => {}
        }
    }

    /// Drop a removed worker's entries from the reverse indexes.
    fn forget(&self, ws: &WorkerState) {
        for slot in &ws.slots {
            self.slot_owner.remove(&slot.id);
        }
        for id in ws.events.keys() {
            self.event_owner.remove(id);
        }
    }

    async fn wal_append(&self, change: &Change) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                change: change.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(format!("WAL: {e}")))
    }

    /// WAL-append then apply.
    async fn persist_and_apply(
        &self,
        ws: &mut WorkerState,
        change: &Change,
    ) -> Result<(), StoreError> {
        self.wal_append(change).await?;
        self.apply_to_worker(ws, change);
        Ok(())
    }

    fn worker(&self, id: WorkerId) -> Option<SharedWorkerState> {
        self.workers.get(&id).map(|e| e.value().clone())
    }

    /// Workers exist implicitly from their first slot or event.
    fn worker_or_create(&self, id: WorkerId) -> SharedWorkerState {
        self.workers
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(WorkerState::new(id))))
            .value()
            .clone()
    }

    fn slot_worker(&self, slot_id: SlotId) -> Result<SharedWorkerState, StoreError> {
        self.slot_owner
            .get(&slot_id)
            .map(|e| *e.value())
            .and_then(|wid| self.worker(wid))
            .ok_or(StoreError::NotFound(Entity::Slot(slot_id)))
    }

    fn event_worker(&self, event_id: EventId) -> Option<SharedWorkerState> {
        self.event_owner
            .get(&event_id)
            .map(|e| *e.value())
            .and_then(|wid| self.worker(wid))
    }

    /// Split links by the worker owning their slot, in worker id order.
    fn group_by_worker(
        &self,
        links: &[ScheduleLink],
    ) -> Result<BTreeMap<WorkerId, Vec<ScheduleLink>>, StoreError> {
        let mut grouped: BTreeMap<WorkerId, Vec<ScheduleLink>> = BTreeMap::new();
        for link in links {
            let owner = self
                .slot_owner
                .get(&link.slot_id)
                .map(|e| *e.value())
                .ok_or(StoreError::NotFound(Entity::Slot(link.slot_id)))?;
            grouped.entry(owner).or_default().push(link.clone());
        }
        Ok(grouped)
    }

    /// Write-lock the workers owning `grouped`, in worker id order.
    async fn lock_workers(
        &self,
        grouped: &BTreeMap<WorkerId, Vec<ScheduleLink>>,
    ) -> Result<Vec<OwnedRwLockWriteGuard<WorkerState>>, StoreError> {
        let mut guards = Vec::with_capacity(grouped.len());
        for &id in grouped.keys() {
            let ws = self
                .worker(id)
                .ok_or(StoreError::NotFound(Entity::Worker(id)))?;
            guards.push(ws.write_owned().await);
        }
        Ok(guards)
    }

    /// Rewrite the WAL with just the changes needed to rebuild current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _exclusive = self.gate.write().await;

        let mut changes = vec![Change::IdsReserved {
            next_slot_id: self.next_slot_id.load(Ordering::SeqCst),
            next_event_id: self.next_event_id.load(Ordering::SeqCst),
        }];
        let mut ids: Vec<WorkerId> = self.workers.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        for id in ids {
            let Some(ws) = self.worker(id) else { continue };
            let guard = ws.read().await;
            changes.extend(guard.slots.iter().map(|slot| Change::SlotAdded { slot: slot.clone() }));

            let mut events: Vec<&Event> = guard.events.values().collect();
            events.sort_by_key(|e| e.id);
            changes.extend(events.into_iter().map(|e| Change::EventSaved { event: e.clone() }));

            if !guard.links.is_empty() {
                let mut links: Vec<ScheduleLink> = guard.links.values().cloned().collect();
                links.sort_by_key(|l| l.id);
                changes.push(Change::LinksCreated {
                    worker_id: guard.id,
                    links,
                });
            }
        }

        let count = changes.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                changes,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(format!("WAL compaction: {e}")))?;
        tracing::info!("ledger compacted to {count} changes");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl ScheduleStore for Ledger {
    async fn recurring_slots(
        &self,
        worker_id: WorkerId,
        day: Weekday,
        from: Min,
        to: Min,
    ) -> Result<Vec<Slot>, StoreError> {
        let Some(ws) = self.worker(worker_id) else {
            return Ok(Vec::new());
        };
        let guard = ws.read().await;
        Ok(guard
            .starting_within(from, to)
            .filter(|s| s.is_recurring() && s.day == day)
            .cloned()
            .collect())
    }

    async fn date_slots(
        &self,
        worker_id: WorkerId,
        date: NaiveDate,
        from: Min,
        to: Min,
    ) -> Result<Vec<Slot>, StoreError> {
        let Some(ws) = self.worker(worker_id) else {
            return Ok(Vec::new());
        };
        let guard = ws.read().await;
        Ok(guard
            .starting_within(from, to)
            .filter(|s| s.date == Some(date))
            .cloned()
            .collect())
    }

    async fn slots_by_ids(&self, ids: &[SlotId]) -> Result<Vec<Slot>, StoreError> {
        if ids.len() > MAX_IDS_PER_QUERY {
            return Err(StoreError::LimitExceeded("too many slot ids"));
        }
        let mut by_worker: BTreeMap<WorkerId, Vec<SlotId>> = BTreeMap::new();
        for id in ids {
            if let Some(owner) = self.slot_owner.get(id) {
                by_worker.entry(*owner.value()).or_default().push(*id);
            }
        }

        let mut found: HashMap<SlotId, Slot> = HashMap::with_capacity(ids.len());
        for (worker_id, wanted) in by_worker {
            let Some(ws) = self.worker(worker_id) else { continue };
            let guard = ws.read().await;
            for id in wanted {
                if let Some(slot) = guard.slot(id) {
                    found.insert(id, slot.clone());
                }
            }
        }
        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    async fn create_links(&self, links: &[ScheduleLink]) -> Result<(), StoreError> {
        if links.is_empty() {
            return Ok(());
        }
        let _shared = self.gate.read().await;
        let grouped = self.group_by_worker(links)?;
        let mut guards = self.lock_workers(&grouped).await?;

        // Phase 1: validate everything against current state and the batch itself.
        let mut seen = HashSet::new();
        for (guard, batch) in guards.iter().zip(grouped.values()) {
            for link in batch {
                if guard.slot(link.slot_id).is_none() {
                    return Err(StoreError::NotFound(Entity::Slot(link.slot_id)));
                }
                if !guard.events.contains_key(&link.event_id) {
                    return Err(StoreError::NotFound(Entity::Event(link.event_id)));
                }
                if !seen.insert(link.key()) || guard.occupancy.contains_key(&link.key()) {
                    return Err(StoreError::LinkTaken {
                        slot_id: link.slot_id,
                        date: link.date,
                    });
                }
            }
        }

        // Phase 2: commit, one record per worker.
        for (guard, (worker_id, batch)) in guards.iter_mut().zip(grouped) {
            let change = Change::LinksCreated {
                worker_id,
                links: batch,
            };
            self.persist_and_apply(guard, &change).await?;
        }
        Ok(())
    }

    async fn update_links(&self, links: &[ScheduleLink]) -> Result<(), StoreError> {
        if links.is_empty() {
            return Ok(());
        }
        let _shared = self.gate.read().await;
        let grouped = self.group_by_worker(links)?;
        let mut guards = self.lock_workers(&grouped).await?;

        for (guard, batch) in guards.iter().zip(grouped.values()) {
            for link in batch {
                if !guard.links.contains_key(&link.id) {
                    return Err(StoreError::NotFound(Entity::Link(link.id)));
                }
                if guard.slot(link.slot_id).is_none() {
                    return Err(StoreError::NotFound(Entity::Slot(link.slot_id)));
                }
                if let Some(holder) = guard.occupancy.get(&link.key())
                    && *holder != link.id
                {
                    return Err(StoreError::LinkTaken {
                        slot_id: link.slot_id,
                        date: link.date,
                    });
                }
            }
        }

        for (guard, (worker_id, batch)) in guards.iter_mut().zip(grouped) {
            let change = Change::LinksUpdated {
                worker_id,
                links: batch,
            };
            self.persist_and_apply(guard, &change).await?;
        }
        Ok(())
    }

    async fn delete_links(&self, links: &[ScheduleLink]) -> Result<(), StoreError> {
        if links.is_empty() {
            return Ok(());
        }
        let _shared = self.gate.read().await;
        let grouped = self.group_by_worker(links)?;
        let mut guards = self.lock_workers(&grouped).await?;

        for (guard, batch) in guards.iter().zip(grouped.values()) {
            if let Some(missing) = batch.iter().find(|l| !guard.links.contains_key(&l.id)) {
                return Err(StoreError::NotFound(Entity::Link(missing.id)));
            }
        }

        for (guard, (worker_id, batch)) in guards.iter_mut().zip(grouped) {
            let change = Change::LinksDeleted {
                worker_id,
                ids: batch.iter().map(|l| l.id).collect(),
            };
            self.persist_and_apply(guard, &change).await?;
        }
        Ok(())
    }

    async fn links_by_slot(&self, slot_id: SlotId) -> Result<Vec<ScheduleLink>, StoreError> {
        let Ok(ws) = self.slot_worker(slot_id) else {
            return Ok(Vec::new());
        };
        let guard = ws.read().await;
        let mut links: Vec<ScheduleLink> = guard
            .links
            .values()
            .filter(|l| l.slot_id == slot_id)
            .cloned()
            .collect();
        links.sort_by_key(|l| l.date);
        Ok(links)
    }

    async fn links_by_event(&self, event_id: EventId) -> Result<Vec<ScheduleLink>, StoreError> {
        let Some(ws) = self.event_worker(event_id) else {
            return Ok(Vec::new());
        };
        let guard = ws.read().await;
        let mut links: Vec<ScheduleLink> = guard
            .links
            .values()
            .filter(|l| l.event_id == event_id)
            .cloned()
            .collect();
        links.sort_by_key(|l| (l.date, guard.slot(l.slot_id).map(|s| s.span.start)));
        Ok(links)
    }
}

#[async_trait]
impl CatalogStore for Ledger {
    async fn insert_slot(
        &self,
        worker_id: WorkerId,
        anchor: SlotAnchor,
        from: Min,
    ) -> Result<Slot, StoreError> {
        let _shared = self.gate.read().await;
        let ws = self.worker_or_create(worker_id);
        let mut guard = ws.write().await;
        if guard.slots.len() >= MAX_SLOTS_PER_WORKER {
            return Err(StoreError::LimitExceeded("too many slots for worker"));
        }
        if guard.find_slot(anchor, from).is_some() {
            return Err(StoreError::DuplicateSlot {
                worker_id,
                anchor,
                from,
            });
        }

        let id = self.next_slot_id.fetch_add(1, Ordering::SeqCst);
        let slot = Slot::new(id, worker_id, anchor, from);
        let change = Change::SlotAdded { slot: slot.clone() };
        self.persist_and_apply(&mut guard, &change).await?;
        Ok(slot)
    }

    async fn remove_slot(&self, id: SlotId) -> Result<Slot, StoreError> {
        let _shared = self.gate.read().await;
        let ws = self.slot_worker(id)?;
        let mut guard = ws.write().await;
        let slot = guard
            .slot(id)
            .cloned()
            .ok_or(StoreError::NotFound(Entity::Slot(id)))?;
        let change = Change::SlotRemoved {
            id,
            worker_id: slot.worker_id,
        };
        self.persist_and_apply(&mut guard, &change).await?;
        Ok(slot)
    }

    async fn remove_worker(&self, worker_id: WorkerId) -> Result<usize, StoreError> {
        let _shared = self.gate.read().await;
        let ws = self
            .worker(worker_id)
            .ok_or(StoreError::NotFound(Entity::Worker(worker_id)))?;
        let guard = ws.write().await;
        self.wal_append(&Change::WorkerRemoved { id: worker_id })
            .await?;
        self.forget(&guard);
        self.workers.remove(&worker_id);
        Ok(guard.slots.len())
    }

    async fn event(&self, id: EventId) -> Result<Option<Event>, StoreError> {
        let Some(ws) = self.event_worker(id) else {
            return Ok(None);
        };
        let guard = ws.read().await;
        Ok(guard.events.get(&id).cloned())
    }

    async fn insert_event(&self, draft: NewEvent) -> Result<Event, StoreError> {
        let _shared = self.gate.read().await;
        let ws = self.worker_or_create(draft.worker_id);
        let mut guard = ws.write().await;
        if guard.events.len() >= MAX_EVENTS_PER_WORKER {
            return Err(StoreError::LimitExceeded("too many events for worker"));
        }
        let id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        let event = draft.into_event(id);
        let change = Change::EventSaved {
            event: event.clone(),
        };
        self.persist_and_apply(&mut guard, &change).await?;
        Ok(event)
    }

    async fn save_event(&self, event: &Event) -> Result<(), StoreError> {
        let _shared = self.gate.read().await;
        let ws = self
            .worker(event.worker_id)
            .ok_or(StoreError::NotFound(Entity::Event(event.id)))?;
        let mut guard = ws.write().await;
        if !guard.events.contains_key(&event.id) {
            return Err(StoreError::NotFound(Entity::Event(event.id)));
        }
        let change = Change::EventSaved {
            event: event.clone(),
        };
        self.persist_and_apply(&mut guard, &change).await
    }

    async fn remove_event(&self, id: EventId) -> Result<Event, StoreError> {
        let _shared = self.gate.read().await;
        let ws = self
            .event_worker(id)
            .ok_or(StoreError::NotFound(Entity::Event(id)))?;
        let mut guard = ws.write().await;
        let event = guard
            .events
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(Entity::Event(id)))?;
        let change = Change::EventRemoved {
            id,
            worker_id: event.worker_id,
        };
        self.persist_and_apply(&mut guard, &change).await?;
        Ok(event)
    }
}
