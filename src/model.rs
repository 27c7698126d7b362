use std::collections::HashMap;
use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::{MINUTES_PER_DAY, SLOT_MINUTES};

/// Minutes since midnight.
pub type Min = u32;

pub type SlotId = u64;
pub type EventId = u64;
pub type WorkerId = u64;
pub type PatientId = u64;

/// Half-open interval `[start, end)` within one day.
///
/// Plain data: ordering and alignment are checked where windows enter the
/// scheduler, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Min,
    pub end: Min,
}

impl Span {
    pub fn new(start: Min, end: Min) -> Self {
        Self { start, end }
    }

    /// The slot-sized span starting at `start`.
    pub fn slot(start: Min) -> Self {
        Self::new(start, start + SLOT_MINUTES)
    }

    /// Both ends fall on slot boundaries.
    pub fn is_aligned(&self) -> bool {
        self.start % SLOT_MINUTES == 0 && self.end % SLOT_MINUTES == 0
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", format_hhmm(self.start), format_hhmm(self.end))
    }
}

/// Parse `HH:MM` into minutes. `24:00` is accepted as the end of the day.
pub fn parse_hhmm(s: &str) -> Option<Min> {
    let s = s.trim();
    if s == "24:00" {
        return Some(MINUTES_PER_DAY);
    }
    let t = NaiveTime::parse_from_str(s, "%H:%M").ok()?;
    Some(t.num_seconds_from_midnight() / 60)
}

pub fn format_hhmm(m: Min) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

/// What a slot is pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotAnchor {
    /// Every week on this day.
    Weekly(Weekday),
    /// One calendar date; overrides the weekly pattern at the same start time.
    On(NaiveDate),
}

impl SlotAnchor {
    pub fn day(&self) -> Weekday {
        match self {
            SlotAnchor::Weekly(day) => *day,
            SlotAnchor::On(date) => date.weekday(),
        }
    }

    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            SlotAnchor::Weekly(_) => None,
            SlotAnchor::On(date) => Some(*date),
        }
    }
}

/// One 30-minute unit of a worker's availability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    pub worker_id: WorkerId,
    /// Always set; derived from `date` for date-specific slots.
    pub day: Weekday,
    /// `None` means the slot recurs every `day`.
    pub date: Option<NaiveDate>,
    pub span: Span,
}

impl Slot {
    pub fn new(id: SlotId, worker_id: WorkerId, anchor: SlotAnchor, from: Min) -> Self {
        Self {
            id,
            worker_id,
            day: anchor.day(),
            date: anchor.date(),
            span: Span::slot(from),
        }
    }

    pub fn anchor(&self) -> SlotAnchor {
        match self.date {
            Some(date) => SlotAnchor::On(date),
            None => SlotAnchor::Weekly(self.day),
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.date.is_none()
    }
}

/// A booked appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub worker_id: WorkerId,
    pub patient_id: PatientId,
    pub date: NaiveDate,
    pub span: Span,
    pub title: String,
    pub location: Option<String>,
}

impl Event {
    pub fn window(&self) -> EventWindow {
        EventWindow::new(self.date, self.span)
    }
}

/// An event before the ledger has assigned it an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub worker_id: WorkerId,
    pub patient_id: PatientId,
    pub date: NaiveDate,
    pub span: Span,
    pub title: String,
    pub location: Option<String>,
}

impl NewEvent {
    pub fn window(&self) -> EventWindow {
        EventWindow::new(self.date, self.span)
    }

    pub fn into_event(self, id: EventId) -> Event {
        Event {
            id,
            worker_id: self.worker_id,
            patient_id: self.patient_id,
            date: self.date,
            span: self.span,
            title: self.title,
            location: self.location,
        }
    }
}

/// Where an event sits in time: a date plus a time-of-day span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventWindow {
    pub date: NaiveDate,
    pub span: Span,
}

impl EventWindow {
    pub fn new(date: NaiveDate, span: Span) -> Self {
        Self { date, span }
    }

    /// `(date, from)`; tuples order date first, then time.
    pub fn start_key(&self) -> (NaiveDate, Min) {
        (self.date, self.span.start)
    }

    pub fn end_key(&self) -> (NaiveDate, Min) {
        (self.date, self.span.end)
    }
}

impl fmt::Display for EventWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.date, self.span)
    }
}

/// Binds one occurrence of a slot (the slot on `date`) to an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleLink {
    pub id: Ulid,
    pub slot_id: SlotId,
    pub event_id: EventId,
    pub date: NaiveDate,
}

impl ScheduleLink {
    pub fn new(slot_id: SlotId, event_id: EventId, date: NaiveDate) -> Self {
        Self {
            id: Ulid::new(),
            slot_id,
            event_id,
            date,
        }
    }

    pub fn key(&self) -> (SlotId, NaiveDate) {
        (self.slot_id, self.date)
    }
}

/// Something a lookup can fail to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Slot(SlotId),
    Event(EventId),
    Worker(WorkerId),
    Link(Ulid),
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Slot(id) => write!(f, "slot {id}"),
            Entity::Event(id) => write!(f, "event {id}"),
            Entity::Worker(id) => write!(f, "worker {id}"),
            Entity::Link(id) => write!(f, "schedule link {id}"),
        }
    }
}

/// Everything the ledger knows about one worker.
#[derive(Debug, Clone)]
pub struct WorkerState {
    pub id: WorkerId,
    /// Recurring and dated slots together, sorted by `span.start`.
    pub slots: Vec<Slot>,
    pub events: HashMap<EventId, Event>,
    pub links: HashMap<Ulid, ScheduleLink>,
    /// `(slot, date)` → link id. One booking per slot occurrence.
    pub occupancy: HashMap<(SlotId, NaiveDate), Ulid>,
}

impl WorkerState {
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            slots: Vec::new(),
            events: HashMap::new(),
            links: HashMap::new(),
            occupancy: HashMap::new(),
        }
    }

    /// Insert a slot keeping `slots` sorted by start time.
    pub fn insert_slot(&mut self, slot: Slot) {
        let pos = self
            .slots
            .partition_point(|s| s.span.start <= slot.span.start);
        self.slots.insert(pos, slot);
    }

    /// Remove a slot and every link that booked it.
    pub fn remove_slot(&mut self, id: SlotId) -> Option<Slot> {
        let pos = self.slots.iter().position(|s| s.id == id)?;
        let slot = self.slots.remove(pos);
        let booked: Vec<Ulid> = self
            .links
            .values()
            .filter(|l| l.slot_id == id)
            .map(|l| l.id)
            .collect();
        for link_id in booked {
            self.remove_link(link_id);
        }
        Some(slot)
    }

    pub fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub fn find_slot(&self, anchor: SlotAnchor, from: Min) -> Option<&Slot> {
        self.starting_within(from, from + 1)
            .find(|s| s.anchor() == anchor)
    }

    /// Slots whose start lies in `[from, to)`.
    pub fn starting_within(&self, from: Min, to: Min) -> impl Iterator<Item = &Slot> {
        let lo = self.slots.partition_point(|s| s.span.start < from);
        let hi = self.slots.partition_point(|s| s.span.start < to).max(lo);
        self.slots[lo..hi].iter()
    }

    pub fn insert_link(&mut self, link: ScheduleLink) {
        self.occupancy.insert(link.key(), link.id);
        self.links.insert(link.id, link);
    }

    pub fn remove_link(&mut self, id: Ulid) -> Option<ScheduleLink> {
        let link = self.links.remove(&id)?;
        if self.occupancy.get(&link.key()) == Some(&id) {
            self.occupancy.remove(&link.key());
        }
        Some(link)
    }

    /// Remove an event together with its links.
    pub fn remove_event(&mut self, id: EventId) -> Option<Event> {
        let event = self.events.remove(&id)?;
        let held: Vec<Ulid> = self
            .links
            .values()
            .filter(|l| l.event_id == id)
            .map(|l| l.id)
            .collect();
        for link_id in held {
            self.remove_link(link_id);
        }
        Some(event)
    }
}

/// Change records, flat and unnested. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    SlotAdded {
        slot: Slot,
    },
    SlotRemoved {
        id: SlotId,
        worker_id: WorkerId,
    },
    WorkerRemoved {
        id: WorkerId,
    },
    EventSaved {
        event: Event,
    },
    EventRemoved {
        id: EventId,
        worker_id: WorkerId,
    },
    LinksCreated {
        worker_id: WorkerId,
        links: Vec<ScheduleLink>,
    },
    LinksUpdated {
        worker_id: WorkerId,
        links: Vec<ScheduleLink>,
    },
    LinksDeleted {
        worker_id: WorkerId,
        ids: Vec<Ulid>,
    },
    /// Written first by compaction so id counters survive deleted rows.
    IdsReserved {
        next_slot_id: SlotId,
        next_event_id: EventId,
    },
}

impl Change {
    /// The worker whose state this change touches.
    pub fn worker_id(&self) -> Option<WorkerId> {
        match self {
            Change::SlotAdded { slot } => Some(slot.worker_id),
            Change::EventSaved { event } => Some(event.worker_id),
            Change::SlotRemoved { worker_id, .. }
            | Change::EventRemoved { worker_id, .. }
            | Change::LinksCreated { worker_id, .. }
            | Change::LinksUpdated { worker_id, .. }
            | Change::LinksDeleted { worker_id, .. } => Some(*worker_id),
            Change::WorkerRemoved { id } => Some(*id),
            Change::IdsReserved { .. } => None,
        }
    }
}
