//! End-to-end tachograph uploads: decode, build, reconcile, persist.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use common::{AVAILABILITY, BREAK, DRIVING, WORK, at, driver_card_packed, driver_card_runs, vehicle_unit};
use crossbeam_channel::{Receiver, Sender};
use fleet_fusion::core::config::UploadConfig;
use fleet_fusion::prelude::*;
use fleet_fusion::store::ActivityQuery;

fn request(name: &str, driver: &str, bytes: Vec<u8>) -> UploadRequest {
    UploadRequest {
        file_name: name.to_string(),
        bytes,
        driver_id: DriverId::new(driver),
        slot: None,
    }
}

fn memory_service(now: chrono::DateTime<chrono::Utc>) -> (Arc<MemoryStore>, UploadService) {
    let store = Arc::new(MemoryStore::default());
    let service = UploadService::new(
        store.clone(),
        Arc::new(FixedClock::new(now)),
        UploadConfig::default(),
    );
    (store, service)
}

#[test]
fn vehicle_unit_open_session_scenario() {
    let (store, service) = memory_service(at(9, 30));
    let bytes = vehicle_unit(
        "HH-AB 123",
        true,
        &[(at(8, 0), 1, DRIVING), (at(8, 45), 1, BREAK), (at(9, 0), 1, DRIVING)],
    );
    let response = service.upload(&request("download.tgd", "D1", bytes));

    assert!(response.success, "{:?}", response.errors);
    assert_eq!(response.activities_created, 3);
    assert_eq!(response.activities_skipped, 0);
    assert_eq!(response.parse_result.total_driving_minutes, 45 + 30);
    assert_eq!(response.parse_result.total_rest_minutes, 15);

    let stored = store
        .list_intervals(&DriverId::new("D1"), &ActivityQuery::default())
        .unwrap();
    let mut spans: Vec<_> = stored
        .iter()
        .map(|row| (row.interval.state, row.interval.start_time, row.interval.end_time))
        .collect();
    spans.reverse();
    assert_eq!(
        spans,
        vec![
            (ActivityState::Driving, at(8, 0), Some(at(8, 45))),
            (ActivityState::Break, at(8, 45), Some(at(9, 0))),
            (ActivityState::Driving, at(9, 0), None),
        ]
    );
}

#[test]
fn co_driver_slot_is_extracted_separately() {
    let (store, service) = memory_service(at(12, 0));
    let bytes = vehicle_unit(
        "HH-AB 123",
        false,
        &[
            (at(8, 0), 1, DRIVING),
            (at(8, 0), 2, AVAILABILITY),
            (at(10, 0), 1, BREAK),
            (at(10, 0), 2, DRIVING),
            (at(11, 0), 1, BREAK),
            (at(11, 0), 2, DRIVING),
        ],
    );
    let mut co = request("unit.tgd", "D2", bytes.clone());
    co.slot = Some(DriverSlot::CoDriver);
    let primary = service.upload(&request("unit.tgd", "D1", bytes));
    let co = service.upload(&co);

    assert_eq!(primary.parse_result.total_driving_minutes, 120);
    assert_eq!(co.parse_result.total_driving_minutes, 60);
    assert_eq!(co.activities_created, 2);
    assert_eq!(store.interval_count(), 4);
}

#[test]
fn driver_card_layouts_agree() {
    let (_, service) = memory_service(at(23, 0));
    let mut minutes = vec![DRIVING; 90];
    minutes.extend(vec![BREAK; 45]);
    minutes.extend(vec![WORK; 30]);
    let packed = service.upload(&request("card.DDD", "D1", driver_card_packed("CARD-1", at(6, 0), &minutes)));

    let (_, service) = memory_service(at(23, 0));
    let runs = service.upload(&request(
        "card.ddd",
        "D1",
        driver_card_runs("CARD-1", at(6, 0), &[(DRIVING, 90), (BREAK, 45), (WORK, 30)]),
    ));

    for response in [&packed, &runs] {
        assert!(response.success);
        assert_eq!(response.activities_created, 3);
        assert_eq!(response.parse_result.total_driving_minutes, 90);
        assert_eq!(response.parse_result.total_rest_minutes, 45);
        assert_eq!(response.parse_result.total_work_minutes, 30);
        assert_eq!(response.parse_result.card_number.as_deref(), Some("CARD-1"));
    }
}

#[test]
fn superset_upload_only_adds_new_portion() {
    let (store, service) = memory_service(at(23, 0));
    let first = driver_card_runs("C", at(6, 0), &[(DRIVING, 60), (BREAK, 30)]);
    let superset = driver_card_runs("C", at(6, 0), &[(DRIVING, 60), (BREAK, 30), (WORK, 60)]);

    assert_eq!(service.upload(&request("a.ddd", "D1", first)).activities_created, 2);
    let second = service.upload(&request("b.ddd", "D1", superset));
    assert_eq!(second.activities_created, 1);
    assert_eq!(second.activities_skipped, 2);
    assert_eq!(store.interval_count(), 3);
}

#[test]
fn partial_overlap_is_stored_with_warning() {
    let (store, service) = memory_service(at(23, 0));
    service.upload(&request(
        "a.ddd",
        "D1",
        driver_card_runs("C", at(6, 0), &[(DRIVING, 60)]),
    ));
    let shifted = service.upload(&request(
        "b.ddd",
        "D1",
        driver_card_runs("C", at(6, 30), &[(DRIVING, 60)]),
    ));
    assert!(shifted.success);
    assert_eq!(shifted.activities_created, 1);
    assert!(
        shifted
            .parse_result
            .warnings
            .iter()
            .any(|w| w.contains("partially overlaps"))
    );
    assert_eq!(store.interval_count(), 2);
}

#[test]
fn truncated_file_is_rejected_whole() {
    let (store, service) = memory_service(at(23, 0));
    let mut bytes = driver_card_runs("C", at(6, 0), &[(DRIVING, 60), (BREAK, 30)]);
    bytes.truncate(bytes.len() - 2);
    let response = service.upload(&request("a.ddd", "D1", bytes));
    assert!(!response.success);
    assert!(response.errors[0].contains("FFX-4003"));
    assert_eq!(store.interval_count(), 0);
}

#[test]
fn concurrent_uploads_for_one_driver_never_double_insert() {
    let (store, service) = memory_service(at(23, 0));
    let service = Arc::new(service);
    let bytes = driver_card_runs("C", at(6, 0), &[(DRIVING, 60), (BREAK, 30), (WORK, 15)]);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let service = Arc::clone(&service);
            let bytes = bytes.clone();
            thread::spawn(move || service.upload(&request(&format!("{i}.ddd"), "D1", bytes)))
        })
        .collect();
    let responses: Vec<UploadResponse> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let created: usize = responses.iter().map(|r| r.activities_created).sum();
    let skipped: usize = responses.iter().map(|r| r.activities_skipped).sum();
    assert_eq!(created, 3);
    assert_eq!(skipped, 3 * 7);
    assert_eq!(store.interval_count(), 3);
}

#[test]
fn sqlite_store_round_trips_an_upload() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        SqliteStore::open(&dir.path().join("fleet.sqlite3"), Duration::from_secs(5)).unwrap(),
    );
    store.register_driver(&DriverId::new("D1")).unwrap();
    let service = UploadService::new(
        store.clone(),
        Arc::new(FixedClock::new(at(23, 0))),
        UploadConfig::default(),
    )
    .with_directory(store.clone());

    let bytes = vehicle_unit("X", false, &[(at(8, 0), 1, WORK), (at(9, 0), 1, DRIVING), (at(9, 40), 1, BREAK)]);
    let first = service.upload(&request("u.tgd", "D1", bytes.clone()));
    let again = service.upload(&request("u.tgd", "D1", bytes));
    assert_eq!(first.activities_created, 2);
    assert_eq!(again.activities_skipped, 2);

    let rows = store
        .intervals_overlapping(&DriverId::new("D1"), at(0, 0), None)
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].interval.end_time, Some(at(9, 40)));

    let rejected = service.upload(&request("u.tgd", "D9", vehicle_unit("X", false, &[(at(8, 0), 1, WORK)])));
    assert!(!rejected.success);
}

fn may(day: u32, h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, day, h, m, 0).unwrap()
}

#[test]
fn open_session_does_not_swallow_a_later_week() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        SqliteStore::open(&dir.path().join("fleet.sqlite3"), Duration::from_secs(5)).unwrap(),
    );
    let clock = Arc::new(FixedClock::new(may(6, 9, 30)));
    let service = UploadService::new(store.clone(), clock.clone(), UploadConfig::default());
    let day_one = vehicle_unit(
        "HH-AB 123",
        true,
        &[(may(6, 8, 0), 1, DRIVING), (may(6, 8, 45), 1, BREAK), (may(6, 9, 0), 1, DRIVING)],
    );
    let first = service.upload(&request("monday.tgd", "D1", day_one.clone()));
    assert_eq!((first.activities_created, first.activities_skipped), (3, 0));

    clock.set(may(13, 13, 0));
    let week_later = vehicle_unit(
        "HH-AB 123",
        false,
        &[
            (may(13, 8, 0), 1, DRIVING),
            (may(13, 10, 0), 1, BREAK),
            (may(13, 11, 0), 1, DRIVING),
            (may(13, 12, 0), 1, DRIVING),
        ],
    );
    let second = service.upload(&request("next_monday.tgd", "D1", week_later));
    assert!(second.success, "{:?}", second.errors);
    assert_eq!((second.activities_created, second.activities_skipped), (3, 0));
    assert!(second.parse_result.warnings.is_empty());

    let fusion = FusionEngine::new(store.clone(), store.clone(), store.clone());
    let driver = DriverId::new("D1");
    let day_two = fusion
        .activity_summary(&driver, may(13, 0, 0), may(14, 0, 0))
        .unwrap();
    assert_eq!(day_two.total_driving_minutes, 180);
    assert_eq!(day_two.total_rest_minutes, 60);
    let day_one_summary = fusion
        .activity_summary(&driver, may(6, 0, 0), may(7, 0, 0))
        .unwrap();
    assert_eq!(day_one_summary.total_driving_minutes, 45 + 30);
    let between = fusion.fuse(&driver, may(8, 0, 0), may(9, 0, 0)).unwrap();
    assert!(between.activities.is_empty());

    let replay = service.upload(&request("monday.tgd", "D1", day_one));
    assert_eq!((replay.activities_created, replay.activities_skipped), (0, 3));
    assert_eq!(
        store
            .list_intervals(&driver, &ActivityQuery::default())
            .unwrap()
            .len(),
        6
    );
}

/// Activity store whose first overlap query parks until released.
struct GatedStore {
    inner: MemoryStore,
    armed: AtomicBool,
    entered: Sender<()>,
    release: Receiver<()>,
}

impl ActivityStore for GatedStore {
    fn intervals_overlapping(
        &self,
        driver: &DriverId,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> fleet_fusion::core::errors::Result<Vec<StoredInterval>> {
        if self.armed.swap(false, Ordering::SeqCst) {
            let _ = self.entered.send(());
            let _ = self.release.recv();
        }
        self.inner.intervals_overlapping(driver, start, end)
    }

    fn next_start_after(
        &self,
        driver: &DriverId,
        after: DateTime<Utc>,
    ) -> fleet_fusion::core::errors::Result<Option<DateTime<Utc>>> {
        self.inner.next_start_after(driver, after)
    }

    fn insert_intervals(
        &self,
        intervals: &[ActivityInterval],
    ) -> fleet_fusion::core::errors::Result<Vec<i64>> {
        self.inner.insert_intervals(intervals)
    }

    fn list_intervals(
        &self,
        driver: &DriverId,
        query: &ActivityQuery,
    ) -> fleet_fusion::core::errors::Result<Vec<StoredInterval>> {
        self.inner.list_intervals(driver, query)
    }
}

#[test]
fn upload_waiting_on_a_busy_driver_times_out_and_persists_nothing() {
    let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
    let (release_tx, release_rx) = crossbeam_channel::bounded(1);
    let store = Arc::new(GatedStore {
        inner: MemoryStore::default(),
        armed: AtomicBool::new(true),
        entered: entered_tx,
        release: release_rx,
    });
    let service = UploadService::new(
        store.clone(),
        Arc::new(FixedClock::new(at(23, 0))),
        UploadConfig {
            lock_timeout_ms: 100,
            ..UploadConfig::default()
        },
    );
    let slow_file = driver_card_runs("C", at(6, 0), &[(DRIVING, 60), (BREAK, 30)]);
    let blocked_file = driver_card_runs("C", at(12, 0), &[(WORK, 45)]);

    let (slow, blocked, other_driver, waited) = thread::scope(|scope| {
        let slow = scope.spawn(|| service.upload(&request("slow.ddd", "D1", slow_file)));
        entered_rx.recv().unwrap();

        let started = Instant::now();
        let blocked = service.upload(&request("blocked.ddd", "D1", blocked_file));
        let waited = started.elapsed();
        let other_driver = service.upload(&request(
            "other.ddd",
            "D2",
            driver_card_runs("C2", at(6, 0), &[(WORK, 30)]),
        ));

        release_tx.send(()).unwrap();
        (slow.join().unwrap(), blocked, other_driver, waited)
    });

    assert!(!blocked.success);
    assert_eq!(blocked.activities_created, 0);
    assert!(blocked.errors[0].contains("FFX-3001"), "{:?}", blocked.errors);
    assert!(waited >= Duration::from_millis(100));
    assert!(waited < Duration::from_secs(5));

    assert!(other_driver.success);
    assert!(slow.success);
    assert_eq!(slow.activities_created, 2);

    let d1 = store
        .list_intervals(&DriverId::new("D1"), &ActivityQuery::default())
        .unwrap();
    assert_eq!(d1.len(), 2);
    assert!(d1.iter().all(|row| row.interval.state != ActivityState::Work));
}
