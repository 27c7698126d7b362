use crate::model::Min;

/// Length of one availability slot.
pub const SLOT_MINUTES: Min = 30;
pub const MINUTES_PER_DAY: Min = 24 * 60;

pub const MAX_SLOTS_PER_WORKER: usize = 50_000;
/// One full day of contiguous slots.
pub const MAX_SLOTS_PER_EVENT: usize = (MINUTES_PER_DAY / SLOT_MINUTES) as usize;
pub const MAX_EVENTS_PER_WORKER: usize = 100_000;
pub const MAX_IDS_PER_QUERY: usize = 1024;

pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_LOCATION_LEN: usize = 512;
