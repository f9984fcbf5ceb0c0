use chrono::{DateTime, Duration, NaiveDate, Utc};
use machmon::daemon::records::{shift_relative_availability, DowntimeReason};
use machmon::storage::sqlite3::SqliteStore;
use machmon::storage::MachineStore;
use std::sync::Arc;

fn d(s: &str) -> NaiveDate {
    s.parse().expect("date literal")
}

fn ts(s: &str) -> DateTime<Utc> {
    s.parse().expect("timestamp literal")
}

#[test]
fn many_closed_cycles_keep_every_counter_in_step() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn MachineStore> =
        Arc::new(SqliteStore::open(dir.path().join("machmon.sqlite3"), 27_000).expect("open"));
    let day = d("2025-01-15");
    let base = ts("2025-01-15T08:00:00Z");

    let mut expected_runtime = 0;
    let mut last = None;
    for i in 0..25 {
        let start = base + Duration::seconds(i * 60);
        let stop = start + Duration::seconds(i + 1);
        expected_runtime += i + 1;
        last = Some(store.close_run(day, start, stop).expect("close run"));
    }

    // close_run hands back the counters it just committed.
    let last = last.expect("at least one cycle");
    assert_eq!(last.cycle.cycle_no, 25);
    assert_eq!(last.summary.total_cycles, 25);
    assert_eq!(last.summary.total_runtime_sec, expected_runtime);

    let cycles = store.cycles_for(day).expect("cycles");
    assert_eq!(cycles.len(), 25);
    assert!(cycles
        .windows(2)
        .all(|w| w[0].cycle_no + 1 == w[1].cycle_no));
    assert_eq!(
        cycles.iter().map(|c| c.runtime_sec).sum::<i64>(),
        expected_runtime
    );

    let totals = store.day_totals(day).expect("totals");
    assert_eq!(totals.cycles, 25);
    assert_eq!(totals.runtime_sec, expected_runtime);

    let summary = store.summary_for(day).expect("query").expect("row");
    assert_eq!(summary.total_cycles, 25);
    assert_eq!(summary.total_runtime_sec, expected_runtime);
    assert_eq!(
        summary.availability_pct,
        shift_relative_availability(expected_runtime, 27_000)
    );
}

#[test]
fn a_reopened_store_continues_where_the_first_left_off() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("machmon.sqlite3");
    let day = d("2025-01-15");

    {
        let store = SqliteStore::open(&db_path, 27_000).expect("open");
        store
            .close_run(day, ts("2025-01-15T08:00:00Z"), ts("2025-01-15T08:05:00Z"))
            .expect("first cycle");
        store
            .close_run(day, ts("2025-01-15T09:00:00Z"), ts("2025-01-15T09:10:00Z"))
            .expect("second cycle");
        store
            .start_downtime(DowntimeReason::Repair, ts("2025-01-15T10:00:00Z"), day)
            .expect("open episode");
    }

    let store = SqliteStore::open(&db_path, 27_000).expect("reopen");
    let totals = store.day_totals(day).expect("totals");
    assert_eq!(totals.cycles, 2);
    assert_eq!(totals.runtime_sec, 900);

    // The open episode survives the restart and still blocks a second one.
    let active = store.active_downtime().expect("query").expect("episode");
    assert_eq!(active.reason, DowntimeReason::Repair);
    assert!(store
        .start_downtime(DowntimeReason::Maintenance, ts("2025-01-15T10:30:00Z"), day)
        .is_err());
    store.stop_downtime(ts("2025-01-15T10:20:00Z")).expect("close episode");

    // Cycle numbering picks up from the persisted log.
    let third = store
        .close_run(day, ts("2025-01-15T11:00:00Z"), ts("2025-01-15T11:01:00Z"))
        .expect("third cycle");
    assert_eq!(third.cycle.cycle_no, 3);
}

#[test]
fn downtime_is_charged_to_the_day_the_episode_started() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::open(dir.path().join("machmon.sqlite3"), 27_000).expect("open");
    let day = d("2025-06-10");

    store
        .start_downtime(DowntimeReason::PowerFailure, ts("2025-06-10T23:50:00Z"), day)
        .expect("open episode");
    let closed = store
        .stop_downtime(ts("2025-06-11T00:10:00Z"))
        .expect("close episode");
    assert_eq!(closed.duration_sec, Some(1200));
    assert_eq!(closed.date, day);

    let summary = store.summary_for(day).expect("query").expect("row");
    assert_eq!(summary.total_downtime_sec, 1200);
    assert_eq!(summary.total_cycles, 0);

    // The day the episode ended on is untouched.
    assert!(store.summary_for(d("2025-06-11")).expect("query").is_none());
}

#[test]
fn summaries_between_returns_the_requested_window_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::open(dir.path().join("machmon.sqlite3"), 27_000).expect("open");
    for (date_s, start_s, stop_s) in [
        ("2025-04-01", "2025-04-01T08:00:00Z", "2025-04-01T08:01:40Z"),
        ("2025-04-03", "2025-04-03T08:00:00Z", "2025-04-03T08:03:20Z"),
        ("2025-05-02", "2025-05-02T08:00:00Z", "2025-05-02T08:05:00Z"),
    ] {
        store
            .close_run(d(date_s), ts(start_s), ts(stop_s))
            .expect("close run");
    }

    let april = store
        .summaries_between(d("2025-04-01"), d("2025-04-30"))
        .expect("april");
    assert_eq!(april.len(), 2);
    assert_eq!(april[0].date, d("2025-04-01"));
    assert_eq!(april[0].total_runtime_sec, 100);
    assert_eq!(april[1].date, d("2025-04-03"));
    assert_eq!(april[1].total_runtime_sec, 200);

    // Bounds are inclusive on both ends.
    let exact = store
        .summaries_between(d("2025-04-03"), d("2025-05-02"))
        .expect("exact");
    assert_eq!(exact.len(), 2);
    assert_eq!(exact[1].total_runtime_sec, 300);

    let empty = store
        .summaries_between(d("2025-06-01"), d("2025-06-30"))
        .expect("empty");
    assert!(empty.is_empty());
}

#[test]
fn downtime_for_lists_closed_episodes_oldest_first() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::open(dir.path().join("machmon.sqlite3"), 27_000).expect("open");
    let day = d("2025-03-10");

    for (reason, start_s, stop_s) in [
        (
            DowntimeReason::SetupDie,
            "2025-03-10T09:00:00Z",
            "2025-03-10T09:02:00Z",
        ),
        (
            DowntimeReason::Repair,
            "2025-03-10T11:00:00Z",
            "2025-03-10T11:10:00Z",
        ),
    ] {
        store
            .start_downtime(reason, ts(start_s), day)
            .expect("open episode");
        store.stop_downtime(ts(stop_s)).expect("close episode");
    }
    // Still-open episodes belong to the live tracker, not the day sheet.
    store
        .start_downtime(DowntimeReason::QualityCheck, ts("2025-03-10T12:00:00Z"), day)
        .expect("open episode");

    let episodes = store.downtime_for(day).expect("episodes");
    assert_eq!(episodes.len(), 2);
    assert_eq!(episodes[0].reason, DowntimeReason::SetupDie);
    assert_eq!(episodes[0].duration_sec, Some(120));
    assert_eq!(episodes[1].reason, DowntimeReason::Repair);
    assert_eq!(episodes[1].duration_sec, Some(600));
    assert!(episodes.iter().all(|e| !e.is_active));
}

#[test]
fn history_never_surfaces_the_episode_still_open() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::open(dir.path().join("machmon.sqlite3"), 27_000).expect("open");
    let day = d("2025-03-10");

    store
        .start_downtime(DowntimeReason::Repair, ts("2025-03-10T09:00:00Z"), day)
        .expect("open episode");
    store
        .stop_downtime(ts("2025-03-10T09:05:00Z"))
        .expect("close episode");
    store
        .start_downtime(DowntimeReason::QualityCheck, ts("2025-03-10T12:00:00Z"), day)
        .expect("open second episode");

    let history = store.downtime_history(None, None, 100).expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].reason, DowntimeReason::Repair);
    assert_eq!(history[0].duration_sec, Some(300));
    assert!(!history[0].is_active);

    // The closed-only filter also composes with explicit date bounds.
    let bounded = store
        .downtime_history(Some(day), Some(day), 100)
        .expect("bounded history");
    assert_eq!(bounded.len(), 1);
    assert!(!bounded[0].is_active);
}
