use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Weekday;

use super::*;
use crate::store::{Ledger, StoreError};

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("carewindow_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn scheduler(name: &str) -> Scheduler<Ledger> {
    Scheduler::new(Arc::new(Ledger::open(test_wal_path(name)).unwrap()))
}

/// Monday.
fn dec29() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 12, 29).unwrap()
}

fn hm(h: Min, m: Min) -> Min {
    h * 60 + m
}

fn visit(worker_id: WorkerId, date: NaiveDate, from: Min, to: Min) -> NewEvent {
    NewEvent {
        worker_id,
        patient_id: 42,
        date,
        span: Span::new(from, to),
        title: "wound care".into(),
        location: None,
    }
}

/// Recurring Monday slots for worker 1 at each start; returns their ids.
async fn weekly_slots<S: ScheduleStore + CatalogStore>(
    s: &Scheduler<S>,
    starts: &[Min],
) -> Vec<SlotId> {
    let mut ids = Vec::new();
    for &from in starts {
        ids.push(
            s.add_slot(1, SlotAnchor::Weekly(Weekday::Mon), from)
                .await
                .unwrap()
                .id,
        );
    }
    ids
}

fn rejection<T: std::fmt::Debug>(result: Result<T, EngineError>) -> Rejection {
    match result {
        Err(EngineError::NotAcceptable(why)) => why,
        other => panic!("expected NotAcceptable, got {other:?}"),
    }
}

// ── Booking checks ───────────────────────────────────────

#[tokio::test]
async fn pure_creation_returns_recurring_ids() {
    let s = scheduler("pure_creation.wal");
    let ids = weekly_slots(&s, &[hm(9, 0), hm(9, 30)]).await;
    assert_eq!(ids, vec![1, 2]);

    let reserved = s
        .check_and_reserve(1, dec29(), hm(9, 0), hm(10, 0))
        .await
        .unwrap();
    assert_eq!(reserved, vec![1, 2]);
}

#[tokio::test]
async fn gap_rejects_booking() {
    let s = scheduler("gap.wal");
    let ids = weekly_slots(&s, &[hm(9, 0), hm(9, 30)]).await;
    s.remove_slot(ids[1]).await.unwrap();

    let why = rejection(s.check_and_reserve(1, dec29(), hm(9, 0), hm(10, 0)).await);
    assert_eq!(why, Rejection::Gap { at: hm(9, 30) });
}

#[tokio::test]
async fn dated_slot_fills_in_for_the_day() {
    let s = scheduler("override.wal");
    let recurring = weekly_slots(&s, &[hm(9, 0)]).await;
    let dated = s
        .add_slot(1, SlotAnchor::On(dec29()), hm(9, 30))
        .await
        .unwrap();

    let reserved = s
        .check_and_reserve(1, dec29(), hm(9, 0), hm(10, 0))
        .await
        .unwrap();
    assert_eq!(reserved, vec![recurring[0], dated.id]);

    // The following Monday only has the recurring slot.
    let next_week = dec29() + chrono::Duration::days(7);
    assert!(s
        .check_and_reserve(1, next_week, hm(9, 0), hm(10, 0))
        .await
        .is_err());
}

#[tokio::test]
async fn duplicated_span_is_a_conflict() {
    let s = scheduler("conflict.wal");
    weekly_slots(&s, &[hm(9, 0), hm(9, 30)]).await;
    s.add_slot(1, SlotAnchor::On(dec29()), hm(9, 30))
        .await
        .unwrap();

    let why = rejection(s.check_and_reserve(1, dec29(), hm(9, 0), hm(10, 0)).await);
    assert!(matches!(why, Rejection::Conflict { .. }));
}

#[tokio::test]
async fn invalid_windows_are_rejected_before_lookup() {
    let s = scheduler("invalid_windows.wal");
    weekly_slots(&s, &[hm(9, 0), hm(9, 30)]).await;

    for (from, to) in [
        (hm(9, 0), hm(9, 0)),
        (hm(10, 0), hm(9, 0)),
        (hm(9, 15), hm(10, 0)),
        (hm(23, 30), hm(24, 30)),
    ] {
        let why = rejection(s.check_and_reserve(1, dec29(), from, to).await);
        assert!(matches!(why, Rejection::InvalidWindow(_)), "{from}-{to}: {why:?}");
    }
}

#[tokio::test]
async fn unknown_worker_has_no_availability() {
    let s = scheduler("unknown_worker.wal");
    let why = rejection(s.check_and_reserve(99, dec29(), hm(9, 0), hm(9, 30)).await);
    assert_eq!(why, Rejection::Gap { at: hm(9, 0) });
}

// ── Event lifecycle ──────────────────────────────────────

#[tokio::test]
async fn create_event_links_its_slots() {
    let s = scheduler("create_event.wal");
    let ids = weekly_slots(&s, &[hm(9, 0), hm(9, 30), hm(10, 0)]).await;

    let event = s
        .create_event(visit(1, dec29(), hm(9, 0), hm(10, 0)))
        .await
        .unwrap();
    let (stored, held) = s.event_slots(event.id).await.unwrap();
    assert_eq!(stored, event);
    assert_eq!(held.iter().map(|s| s.id).collect::<Vec<_>>(), ids[..2]);

    let open = s
        .open_slots(1, dec29(), 0, MINUTES_PER_DAY)
        .await
        .unwrap();
    assert_eq!(open.iter().map(|s| s.id).collect::<Vec<_>>(), vec![ids[2]]);

    // Next week is untouched.
    let next_week = dec29() + chrono::Duration::days(7);
    assert_eq!(
        s.open_slots(1, next_week, 0, MINUTES_PER_DAY)
            .await
            .unwrap()
            .len(),
        3
    );
}

#[tokio::test]
async fn booked_slots_cannot_be_booked_again() {
    let s = scheduler("double_booking.wal");
    weekly_slots(&s, &[hm(9, 0), hm(9, 30), hm(10, 0)]).await;
    s.create_event(visit(1, dec29(), hm(9, 0), hm(10, 0)))
        .await
        .unwrap();

    let why = rejection(
        s.create_event(visit(1, dec29(), hm(9, 30), hm(10, 30)))
            .await,
    );
    assert!(matches!(why, Rejection::AlreadyBooked { date, .. } if date == dec29()));
    let why = rejection(s.check_and_reserve(1, dec29(), hm(9, 30), hm(10, 0)).await);
    assert!(matches!(why, Rejection::AlreadyBooked { .. }));

    // Adjacent window is still free.
    s.create_event(visit(1, dec29(), hm(10, 0), hm(10, 30)))
        .await
        .unwrap();
}

#[tokio::test]
async fn oversized_text_is_refused() {
    let s = scheduler("text_limits.wal");
    weekly_slots(&s, &[hm(9, 0)]).await;
    let mut draft = visit(1, dec29(), hm(9, 0), hm(9, 30));
    draft.title = "x".repeat(MAX_TITLE_LEN + 1);
    assert_eq!(
        s.create_event(draft).await,
        Err(EngineError::LimitExceeded("title too long"))
    );
}

#[tokio::test]
async fn plan_update_shift_later() {
    let s = scheduler("plan_shift_later.wal");
    let ids = weekly_slots(&s, &[hm(10, 0), hm(10, 30), hm(11, 0)]).await;
    let event = s
        .create_event(visit(1, dec29(), hm(10, 0), hm(11, 0)))
        .await
        .unwrap();

    let plan = s
        .plan_update(
            event.id,
            1,
            event.window(),
            EventWindow::new(dec29(), Span::new(hm(10, 30), hm(11, 30))),
        )
        .await
        .unwrap();
    assert_eq!(plan.for_delete, vec![ids[0]]);
    assert_eq!(plan.for_create, vec![ids[2]]);
    assert_eq!(plan.for_update, vec![ids[1]]);

    // Planning writes nothing.
    let (_, held) = s.event_slots(event.id).await.unwrap();
    assert_eq!(held.iter().map(|s| s.id).collect::<Vec<_>>(), ids[..2]);
}

#[tokio::test]
async fn plan_update_unchanged_window_keeps_everything() {
    let s = scheduler("plan_unchanged.wal");
    let ids = weekly_slots(&s, &[hm(10, 0), hm(10, 30)]).await;
    let event = s
        .create_event(visit(1, dec29(), hm(10, 0), hm(11, 0)))
        .await
        .unwrap();
    let plan = s
        .plan_update(event.id, 1, event.window(), event.window())
        .await
        .unwrap();
    assert!(plan.for_create.is_empty());
    assert!(plan.for_delete.is_empty());
    assert_eq!(plan.for_update, ids);
}

#[tokio::test]
async fn update_event_moves_links() {
    let s = scheduler("update_shift.wal");
    let ids = weekly_slots(&s, &[hm(10, 0), hm(10, 30), hm(11, 0)]).await;
    let event = s
        .create_event(visit(1, dec29(), hm(10, 0), hm(11, 0)))
        .await
        .unwrap();

    let update = EventUpdate {
        from: Some(hm(10, 30)),
        to: Some(hm(11, 30)),
        title: Some("medication review".into()),
        ..Default::default()
    };
    let (updated, plan) = s.update_event(event.id, &update).await.unwrap();
    assert_eq!(updated.span, Span::new(hm(10, 30), hm(11, 30)));
    assert_eq!(updated.title, "medication review");
    assert_eq!(plan.for_create, vec![ids[2]]);

    let (stored, held) = s.event_slots(event.id).await.unwrap();
    assert_eq!(stored, updated);
    assert_eq!(held.iter().map(|s| s.id).collect::<Vec<_>>(), ids[1..]);

    let open = s.open_slots(1, dec29(), 0, MINUTES_PER_DAY).await.unwrap();
    assert_eq!(open.iter().map(|s| s.id).collect::<Vec<_>>(), vec![ids[0]]);
}

#[tokio::test]
async fn update_event_to_another_date() {
    let s = scheduler("update_date.wal");
    weekly_slots(&s, &[hm(10, 0), hm(10, 30)]).await;
    let tuesday: Vec<SlotId> = {
        let mut ids = Vec::new();
        for from in [hm(14, 0), hm(14, 30)] {
            ids.push(
                s.add_slot(1, SlotAnchor::Weekly(Weekday::Tue), from)
                    .await
                    .unwrap()
                    .id,
            );
        }
        ids
    };
    let event = s
        .create_event(visit(1, dec29(), hm(10, 0), hm(11, 0)))
        .await
        .unwrap();

    let dec30 = dec29().succ_opt().unwrap();
    let update = EventUpdate {
        date: Some(dec30),
        from: Some(hm(14, 0)),
        to: Some(hm(15, 0)),
        ..Default::default()
    };
    let (_, plan) = s.update_event(event.id, &update).await.unwrap();
    assert_eq!(plan.for_create, tuesday);
    assert_eq!(plan.for_delete.len(), 2);
    assert!(plan.for_update.is_empty());

    let links = s.store().links_by_event(event.id).await.unwrap();
    assert_eq!(links.len(), 2);
    assert!(links.iter().all(|l| l.date == dec30));
    assert_eq!(s.open_slots(1, dec29(), 0, MINUTES_PER_DAY).await.unwrap().len(), 2);
}

#[tokio::test]
async fn rejected_update_changes_nothing() {
    let s = scheduler("update_rejected.wal");
    let ids = weekly_slots(&s, &[hm(10, 0), hm(10, 30), hm(11, 30)]).await;
    let event = s
        .create_event(visit(1, dec29(), hm(10, 0), hm(11, 0)))
        .await
        .unwrap();

    // 11:00 is not available.
    let update = EventUpdate {
        to: Some(hm(12, 0)),
        title: Some("renamed".into()),
        ..Default::default()
    };
    let why = rejection(s.update_event(event.id, &update).await);
    assert_eq!(why, Rejection::Gap { at: hm(11, 0) });

    let (stored, held) = s.event_slots(event.id).await.unwrap();
    assert_eq!(stored, event);
    assert_eq!(held.iter().map(|s| s.id).collect::<Vec<_>>(), ids[..2]);
}

#[tokio::test]
async fn growing_ignores_conflicts_elsewhere_on_the_day() {
    let s = scheduler("update_conflict_elsewhere.wal");
    let ids = weekly_slots(&s, &[hm(9, 0), hm(9, 30), hm(14, 0)]).await;
    s.add_slot(1, SlotAnchor::On(dec29()), hm(14, 0))
        .await
        .unwrap();

    assert_eq!(
        s.check_and_reserve(1, dec29(), hm(9, 0), hm(10, 0))
            .await
            .unwrap(),
        ids[..2]
    );

    let event = s
        .create_event(visit(1, dec29(), hm(9, 0), hm(9, 30)))
        .await
        .unwrap();
    let update = EventUpdate {
        to: Some(hm(10, 0)),
        ..Default::default()
    };
    let (_, plan) = s.update_event(event.id, &update).await.unwrap();
    assert_eq!(plan.for_create, vec![ids[1]]);
    assert_eq!(plan.for_update, vec![ids[0]]);

    // Growing into the duplicated 14:00 slot still fails.
    let update = EventUpdate {
        to: Some(hm(14, 30)),
        ..Default::default()
    };
    let why = rejection(s.update_event(event.id, &update).await);
    assert!(matches!(why, Rejection::Conflict { recurring, .. } if recurring == ids[2]));
}

#[tokio::test]
async fn location_can_be_cleared() {
    let s = scheduler("update_location.wal");
    weekly_slots(&s, &[hm(9, 0)]).await;
    let mut draft = visit(1, dec29(), hm(9, 0), hm(9, 30));
    draft.location = Some("ward 3".into());
    let event = s.create_event(draft).await.unwrap();

    let keep = EventUpdate {
        title: Some("dressing change".into()),
        ..Default::default()
    };
    let (kept, _) = s.update_event(event.id, &keep).await.unwrap();
    assert_eq!(kept.location.as_deref(), Some("ward 3"));

    let clear = EventUpdate {
        location: Some(None),
        ..Default::default()
    };
    let (cleared, plan) = s.update_event(event.id, &clear).await.unwrap();
    assert_eq!(cleared.location, None);
    assert!(plan.for_create.is_empty() && plan.for_delete.is_empty());
    assert_eq!(s.event_slots(event.id).await.unwrap().0.location, None);
}

#[tokio::test]
async fn update_into_another_booking_is_rejected() {
    let s = scheduler("update_collision.wal");
    weekly_slots(&s, &[hm(10, 0), hm(10, 30), hm(11, 0)]).await;
    let first = s
        .create_event(visit(1, dec29(), hm(10, 0), hm(10, 30)))
        .await
        .unwrap();
    s.create_event(visit(1, dec29(), hm(11, 0), hm(11, 30)))
        .await
        .unwrap();

    let update = EventUpdate {
        to: Some(hm(11, 30)),
        ..Default::default()
    };
    let why = rejection(s.update_event(first.id, &update).await);
    assert!(matches!(why, Rejection::AlreadyBooked { .. }));
    assert_eq!(s.store().links_by_event(first.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn apply_plan_with_stale_create_changes_nothing() {
    let s = scheduler("apply_stale.wal");
    let ids = weekly_slots(&s, &[hm(10, 0), hm(10, 30), hm(11, 0)]).await;
    let event = s
        .create_event(visit(1, dec29(), hm(10, 0), hm(10, 30)))
        .await
        .unwrap();
    let plan = s
        .plan_update(
            event.id,
            1,
            event.window(),
            EventWindow::new(dec29(), Span::new(hm(10, 30), hm(11, 30))),
        )
        .await
        .unwrap();

    // Someone else books 11:00 between planning and applying.
    s.create_event(visit(1, dec29(), hm(11, 0), hm(11, 30)))
        .await
        .unwrap();

    let why = rejection(s.apply_plan(event.id, &plan).await);
    assert!(matches!(why, Rejection::AlreadyBooked { .. }));
    let (_, held) = s.event_slots(event.id).await.unwrap();
    assert_eq!(held.iter().map(|s| s.id).collect::<Vec<_>>(), vec![ids[0]]);
}

#[tokio::test]
async fn delete_event_releases_slots() {
    let s = scheduler("delete_event.wal");
    weekly_slots(&s, &[hm(9, 0), hm(9, 30)]).await;
    let event = s
        .create_event(visit(1, dec29(), hm(9, 0), hm(10, 0)))
        .await
        .unwrap();

    assert_eq!(s.delete_event(event.id).await.unwrap(), event);
    assert_eq!(
        s.event_slots(event.id).await,
        Err(EngineError::NotFound(Entity::Event(event.id)))
    );
    assert_eq!(
        s.check_and_reserve(1, dec29(), hm(9, 0), hm(10, 0))
            .await
            .unwrap()
            .len(),
        2
    );
    assert!(s.delete_event(event.id).await.is_err());
}

// ── Availability upkeep ─────────────────────────────────────

#[tokio::test]
async fn add_slot_validation() {
    let s = scheduler("add_slot_validation.wal");
    let why = rejection(s.add_slot(1, SlotAnchor::Weekly(Weekday::Mon), hm(9, 10)).await);
    assert!(matches!(why, Rejection::InvalidWindow(_)));
    let why = rejection(s.add_slot(1, SlotAnchor::Weekly(Weekday::Mon), hm(24, 0)).await);
    assert!(matches!(why, Rejection::InvalidWindow(_)));

    s.add_slot(1, SlotAnchor::Weekly(Weekday::Mon), hm(23, 30))
        .await
        .unwrap();
    assert!(matches!(
        s.add_slot(1, SlotAnchor::Weekly(Weekday::Mon), hm(23, 30)).await,
        Err(EngineError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn booked_slot_cannot_be_toggled_off() {
    let s = scheduler("remove_booked_slot.wal");
    let ids = weekly_slots(&s, &[hm(9, 0)]).await;
    let event = s
        .create_event(visit(1, dec29(), hm(9, 0), hm(9, 30)))
        .await
        .unwrap();

    let why = rejection(s.remove_slot(ids[0]).await);
    assert_eq!(
        why,
        Rejection::SlotInUse {
            slot_id: ids[0],
            bookings: 1
        }
    );

    s.delete_event(event.id).await.unwrap();
    s.remove_slot(ids[0]).await.unwrap();
    assert_eq!(
        s.remove_slot(ids[0]).await,
        Err(EngineError::NotFound(Entity::Slot(ids[0])))
    );
}

#[tokio::test]
async fn remove_worker_cascades() {
    let s = scheduler("remove_worker.wal");
    weekly_slots(&s, &[hm(9, 0), hm(9, 30)]).await;
    let event = s
        .create_event(visit(1, dec29(), hm(9, 0), hm(10, 0)))
        .await
        .unwrap();

    assert_eq!(s.remove_worker(1).await.unwrap(), 2);
    assert!(matches!(
        s.event_slots(event.id).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(s
        .open_slots(1, dec29(), 0, MINUTES_PER_DAY)
        .await
        .unwrap()
        .is_empty());
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test]
async fn racing_patients_get_one_booking() {
    let s = scheduler("race_same_window.wal");
    weekly_slots(&s, &[hm(9, 0), hm(9, 30)]).await;

    let attempts = (0..8).map(|patient| {
        let mut draft = visit(1, dec29(), hm(9, 0), hm(10, 0));
        draft.patient_id = patient;
        s.create_event(draft)
    });
    let results = futures::future::join_all(attempts).await;

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for r in results.iter().filter(|r| r.is_err()) {
        assert!(matches!(
            r,
            Err(EngineError::NotAcceptable(Rejection::AlreadyBooked { .. }))
        ));
    }
}

#[tokio::test]
async fn racing_overlapping_windows_across_tasks() {
    let s = Arc::new(scheduler("race_overlap.wal"));
    weekly_slots(&*s, &[hm(9, 0), hm(9, 30), hm(10, 0)]).await;

    let mut handles = Vec::new();
    for (from, to) in [(hm(9, 0), hm(10, 0)), (hm(9, 30), hm(10, 30))] {
        let s = s.clone();
        handles.push(tokio::spawn(async move {
            s.create_event(visit(1, dec29(), from, to)).await
        }));
    }
    let mut ok = 0;
    for h in handles {
        if h.await.unwrap().is_ok() {
            ok += 1;
        }
    }
    assert_eq!(ok, 1);
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn bookings_survive_restart() {
    let path = test_wal_path("restart.wal");
    let event = {
        let s = Scheduler::new(Arc::new(Ledger::open(path.clone()).unwrap()));
        weekly_slots(&s, &[hm(9, 0), hm(9, 30)]).await;
        s.create_event(visit(1, dec29(), hm(9, 0), hm(10, 0)))
            .await
            .unwrap()
    };

    let s = Scheduler::new(Arc::new(Ledger::open(path).unwrap()));
    let (stored, held) = s.event_slots(event.id).await.unwrap();
    assert_eq!(stored, event);
    assert_eq!(held.len(), 2);
    let why = rejection(s.check_and_reserve(1, dec29(), hm(9, 0), hm(9, 30)).await);
    assert!(matches!(why, Rejection::AlreadyBooked { .. }));
}

// ── Store failures ───────────────────────────────────────

/// Ledger wrapper that can be told to fail specific calls.
struct FlakyStore {
    inner: Ledger,
    fail_reads: AtomicBool,
    fail_create: AtomicBool,
    fail_delete: AtomicBool,
    fail_save: AtomicBool,
}

impl FlakyStore {
    fn new(name: &str) -> Self {
        Self {
            inner: Ledger::open(test_wal_path(name)).unwrap(),
            fail_reads: AtomicBool::new(false),
            fail_create: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            fail_save: AtomicBool::new(false),
        }
    }

    fn check(flag: &AtomicBool) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ScheduleStore for FlakyStore {
    async fn recurring_slots(
        &self,
        worker_id: WorkerId,
        day: Weekday,
        from: Min,
        to: Min,
    ) -> Result<Vec<Slot>, StoreError> {
        Self::check(&self.fail_reads)?;
        self.inner.recurring_slots(worker_id, day, from, to).await
    }

    async fn date_slots(
        &self,
        worker_id: WorkerId,
        date: NaiveDate,
        from: Min,
        to: Min,
    ) -> Result<Vec<Slot>, StoreError> {
        Self::check(&self.fail_reads)?;
        self.inner.date_slots(worker_id, date, from, to).await
    }

    async fn slots_by_ids(&self, ids: &[SlotId]) -> Result<Vec<Slot>, StoreError> {
        self.inner.slots_by_ids(ids).await
    }

    async fn create_links(&self, links: &[ScheduleLink]) -> Result<(), StoreError> {
        Self::check(&self.fail_create)?;
        self.inner.create_links(links).await
    }

    async fn update_links(&self, links: &[ScheduleLink]) -> Result<(), StoreError> {
        self.inner.update_links(links).await
    }

    async fn delete_links(&self, links: &[ScheduleLink]) -> Result<(), StoreError> {
        Self::check(&self.fail_delete)?;
        self.inner.delete_links(links).await
    }

    async fn links_by_slot(&self, slot_id: SlotId) -> Result<Vec<ScheduleLink>, StoreError> {
        self.inner.links_by_slot(slot_id).await
    }

    async fn links_by_event(&self, event_id: EventId) -> Result<Vec<ScheduleLink>, StoreError> {
        self.inner.links_by_event(event_id).await
    }
}

#[async_trait]
impl CatalogStore for FlakyStore {
    async fn insert_slot(
        &self,
        worker_id: WorkerId,
        anchor: SlotAnchor,
        from: Min,
    ) -> Result<Slot, StoreError> {
        self.inner.insert_slot(worker_id, anchor, from).await
    }

    async fn remove_slot(&self, id: SlotId) -> Result<Slot, StoreError> {
        self.inner.remove_slot(id).await
    }

    async fn remove_worker(&self, worker_id: WorkerId) -> Result<usize, StoreError> {
        self.inner.remove_worker(worker_id).await
    }

    async fn event(&self, id: EventId) -> Result<Option<Event>, StoreError> {
        self.inner.event(id).await
    }

    async fn insert_event(&self, draft: NewEvent) -> Result<Event, StoreError> {
        self.inner.insert_event(draft).await
    }

    async fn save_event(&self, event: &Event) -> Result<(), StoreError> {
        Self::check(&self.fail_save)?;
        self.inner.save_event(event).await
    }

    async fn remove_event(&self, id: EventId) -> Result<Event, StoreError> {
        self.inner.remove_event(id).await
    }
}

#[tokio::test]
async fn repository_failure_is_surfaced() {
    let store = Arc::new(FlakyStore::new("flaky_reads.wal"));
    let s = Scheduler::new(store.clone());
    weekly_slots(&s, &[hm(9, 0)]).await;

    store.fail_reads.store(true, Ordering::SeqCst);
    let result = s.check_and_reserve(1, dec29(), hm(9, 0), hm(9, 30)).await;
    assert_eq!(
        result,
        Err(EngineError::Repository("injected failure".into()))
    );
}

#[tokio::test]
async fn failed_link_write_rolls_back_event() {
    let store = Arc::new(FlakyStore::new("flaky_create.wal"));
    let s = Scheduler::new(store.clone());
    weekly_slots(&s, &[hm(9, 0)]).await;

    store.fail_create.store(true, Ordering::SeqCst);
    let result = s.create_event(visit(1, dec29(), hm(9, 0), hm(9, 30))).await;
    assert!(matches!(result, Err(EngineError::Repository(_))));
    // The event id handed out was 1; rollback removed it.
    assert_eq!(store.event(1).await.unwrap(), None);
}

#[tokio::test]
async fn later_apply_failures_do_not_stop_remaining_steps() {
    let store = Arc::new(FlakyStore::new("flaky_delete.wal"));
    let s = Scheduler::new(store.clone());
    let ids = weekly_slots(&s, &[hm(10, 0), hm(10, 30), hm(11, 0)]).await;
    let event = s
        .create_event(visit(1, dec29(), hm(10, 0), hm(11, 0)))
        .await
        .unwrap();

    store.fail_delete.store(true, Ordering::SeqCst);
    let update = EventUpdate {
        from: Some(hm(10, 30)),
        to: Some(hm(11, 30)),
        ..Default::default()
    };
    let result = s.update_event(event.id, &update).await;
    assert!(matches!(result, Err(EngineError::Repository(_))));

    // Create ran and the event was saved; only the release failed.
    let held: Vec<SlotId> = store
        .links_by_event(event.id)
        .await
        .unwrap()
        .iter()
        .map(|l| l.slot_id)
        .collect();
    assert_eq!(held, ids);
    assert_eq!(
        store.event(event.id).await.unwrap().unwrap().span,
        Span::new(hm(10, 30), hm(11, 30))
    );
}

#[tokio::test]
async fn failed_save_releases_new_links() {
    let store = Arc::new(FlakyStore::new("flaky_save.wal"));
    let s = Scheduler::new(store.clone());
    let ids = weekly_slots(&s, &[hm(10, 0), hm(10, 30), hm(11, 0)]).await;
    let event = s
        .create_event(visit(1, dec29(), hm(10, 0), hm(11, 0)))
        .await
        .unwrap();
    let before = store.links_by_event(event.id).await.unwrap();

    store.fail_save.store(true, Ordering::SeqCst);
    let update = EventUpdate {
        from: Some(hm(10, 30)),
        to: Some(hm(11, 30)),
        ..Default::default()
    };
    let result = s.update_event(event.id, &update).await;
    assert!(matches!(result, Err(EngineError::Repository(_))));

    assert_eq!(store.links_by_event(event.id).await.unwrap(), before);
    assert!(store.links_by_slot(ids[2]).await.unwrap().is_empty());
    assert_eq!(store.event(event.id).await.unwrap(), Some(event));
}
