use chrono::NaiveDate;

use crate::model::{Entity, Min, SlotId, Span, format_hhmm};
use crate::store::StoreError;

/// Why a request does not fit the worker's schedule. Expected outcomes,
/// not faults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// No slot covers the increment starting at `at`.
    Gap { at: Min },
    /// A recurring and a dated slot claim the exact same span.
    Conflict {
        span: Span,
        recurring: SlotId,
        dated: SlotId,
    },
    /// The slot occurrence already belongs to another event.
    AlreadyBooked { slot_id: SlotId, date: NaiveDate },
    /// The slot still carries bookings and cannot be toggled off.
    SlotInUse { slot_id: SlotId, bookings: usize },
    InvalidWindow(&'static str),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::Gap { at } => write!(f, "no available slot at {}", format_hhmm(*at)),
            Rejection::Conflict {
                span,
                recurring,
                dated,
            } => write!(
                f,
                "recurring slot {recurring} and dated slot {dated} both cover {span}"
            ),
            Rejection::AlreadyBooked { slot_id, date } => {
                write!(f, "slot {slot_id} is already booked on {date}")
            }
            Rejection::SlotInUse { slot_id, bookings } => {
                write!(f, "slot {slot_id} still has {bookings} booking(s)")
            }
            Rejection::InvalidWindow(msg) => write!(f, "invalid window: {msg}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotAcceptable(Rejection),
    /// The store failed; surfaced verbatim.
    Repository(String),
    NotFound(Entity),
    AlreadyExists(String),
    LimitExceeded(&'static str),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotAcceptable(why) => write!(f, "not acceptable: {why}"),
            EngineError::Repository(e) => write!(f, "repository error: {e}"),
            EngineError::NotFound(entity) => write!(f, "not found: {entity}"),
            EngineError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Short outcome label used in replies and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotAcceptable(_) => "not_acceptable",
            EngineError::Repository(_) => "error",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::LimitExceeded(_) => "limit_exceeded",
        }
    }
}

impl From<Rejection> for EngineError {
    fn from(why: Rejection) -> Self {
        EngineError::NotAcceptable(why)
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::LinkTaken { slot_id, date } => {
                EngineError::NotAcceptable(Rejection::AlreadyBooked { slot_id, date })
            }
            dup @ StoreError::DuplicateSlot { .. } => EngineError::AlreadyExists(dup.to_string()),
            StoreError::NotFound(entity) => EngineError::NotFound(entity),
            StoreError::LimitExceeded(msg) => EngineError::LimitExceeded(msg),
            StoreError::Unavailable(msg) => EngineError::Repository(msg),
        }
    }
}
