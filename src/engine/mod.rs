mod continuity;
mod delta;
mod error;
mod merge;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use continuity::{check_continuity, covering_ids};
pub use delta::{DeltaPlan, plan_delta};
pub use error::{EngineError, Rejection};
pub use merge::{Availability, merge_availability};

use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::limits::*;
use crate::model::*;
use crate::store::{CatalogStore, ScheduleStore};

/// Field changes for an existing event; `None` keeps the current value.
/// `location: Some(None)` clears the location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventUpdate {
    pub date: Option<NaiveDate>,
    pub from: Option<Min>,
    pub to: Option<Min>,
    pub title: Option<String>,
    pub location: Option<Option<String>>,
}

impl EventUpdate {
    pub fn apply_to(&self, event: &Event) -> Event {
        Event {
            date: self.date.unwrap_or(event.date),
            span: Span::new(
                self.from.unwrap_or(event.span.start),
                self.to.unwrap_or(event.span.end),
            ),
            title: self.title.clone().unwrap_or_else(|| event.title.clone()),
            location: match &self.location {
                Some(location) => location.clone(),
                None => event.location.clone(),
            },
            ..event.clone()
        }
    }
}

/// Books events against worker availability.
///
/// Check-then-link for one worker runs under that worker's mutex, so two
/// requests for the same worker cannot interleave. The store's
/// insert-or-fail on `(slot, date)` backs this up at write time.
pub struct Scheduler<S> {
    store: Arc<S>,
    worker_locks: DashMap<WorkerId, Arc<Mutex<()>>>,
}

impl<S: ScheduleStore + CatalogStore> Scheduler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            worker_locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn worker_lock(&self, worker_id: WorkerId) -> Arc<Mutex<()>> {
        self.worker_locks
            .entry(worker_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }
}

/// Reject windows the slot walk cannot represent: empty or reversed,
/// past midnight, or off the 30-minute grid.
pub fn validate_window(span: Span) -> Result<(), Rejection> {
    if span.start >= span.end {
        return Err(Rejection::InvalidWindow("event must end after it starts"));
    }
    if span.end > MINUTES_PER_DAY {
        return Err(Rejection::InvalidWindow("event must end by 24:00"));
    }
    if !span.is_aligned() {
        return Err(Rejection::InvalidWindow(
            "event must start and end on a 30-minute boundary",
        ));
    }
    Ok(())
}

/// Like [`validate_window`] but an empty range is allowed.
fn validate_range(from: Min, to: Min) -> Result<(), Rejection> {
    if from > to {
        return Err(Rejection::InvalidWindow("range ends before it starts"));
    }
    if to > MINUTES_PER_DAY {
        return Err(Rejection::InvalidWindow("range must end by 24:00"));
    }
    if !Span::new(from, to).is_aligned() {
        return Err(Rejection::InvalidWindow(
            "range must start and end on a 30-minute boundary",
        ));
    }
    Ok(())
}

fn validate_text(title: &str, location: Option<&str>) -> Result<(), EngineError> {
    if title.len() > MAX_TITLE_LEN {
        return Err(EngineError::LimitExceeded("title too long"));
    }
    if location.is_some_and(|l| l.len() > MAX_LOCATION_LEN) {
        return Err(EngineError::LimitExceeded("location too long"));
    }
    Ok(())
}
