//! Concurrent, out-of-order and duplicate position delivery.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Duration as TimeDelta;
use common::at;
use fleet_fusion::core::config::TelemetryConfig;
use fleet_fusion::prelude::*;

fn report(vehicle: &str, ts: chrono::DateTime<chrono::Utc>, speed: f64) -> PositionReport {
    PositionReport {
        vehicle_id: VehicleId::new(vehicle),
        timestamp: ts,
        latitude: 48.0 + speed / 1000.0,
        longitude: 11.0,
        speed_kmh: Some(speed),
        extras: PositionExtras::default(),
    }
}

fn ingestor(store: Arc<dyn PositionStore>, parallelism: usize) -> TelemetryIngestor {
    TelemetryIngestor::new(
        store,
        Arc::new(FixedClock::new(at(23, 0))),
        TelemetryConfig {
            parallelism,
            ..TelemetryConfig::default()
        },
    )
}

#[test]
fn shuffled_concurrent_reports_converge_on_latest() {
    let store = Arc::new(MemoryStore::default());
    let ingestor = Arc::new(ingestor(store.clone(), 1));

    // 8 threads deliver interleaved minutes of one vehicle in reverse order.
    let handles: Vec<_> = (0..8u32)
        .map(|t| {
            let ingestor = Arc::clone(&ingestor);
            thread::spawn(move || {
                for i in (0..50u32).rev() {
                    let minute = i * 8 + t;
                    let ts = at(10, 0) + TimeDelta::minutes(i64::from(minute));
                    ingestor.ingest(&report("V1", ts, f64::from(minute))).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let presence = store.presence(&VehicleId::new("V1")).unwrap().unwrap();
    assert_eq!(presence.last_seen, at(10, 0) + TimeDelta::minutes(399));
    assert_eq!(presence.last_speed, Some(399.0));
    assert_eq!(store.position_log(&VehicleId::new("V1")).unwrap().len(), 400);
}

#[test]
fn duplicate_delivery_is_logged_twice_without_moving_presence() {
    let store = Arc::new(MemoryStore::default());
    let ingestor = ingestor(store.clone(), 1);
    let r = report("V1", at(10, 0), 50.0);
    assert_eq!(ingestor.ingest(&r), Ok(IngestOutcome::Advanced));
    assert_eq!(ingestor.ingest(&r), Ok(IngestOutcome::Advanced));
    assert_eq!(store.position_log(&VehicleId::new("V1")).unwrap().len(), 2);
    assert_eq!(
        store.presence(&VehicleId::new("V1")).unwrap().unwrap().last_seen,
        at(10, 0)
    );
}

#[test]
fn parallel_batch_keeps_per_vehicle_order_and_input_positions() {
    let store = Arc::new(MemoryStore::default());
    let ingestor = ingestor(store.clone(), 4);

    let mut batch = Vec::new();
    for i in 0..60i64 {
        let vehicle = format!("V{}", i % 6);
        batch.push(report(&vehicle, at(9, 0) + TimeDelta::minutes(i), 10.0));
    }
    // One stale report per vehicle at the end of the batch.
    for v in 0..6 {
        batch.push(report(&format!("V{v}"), at(8, 0), 99.0));
    }

    let results = ingestor.ingest_batch(&batch);
    assert_eq!(results.len(), 66);
    assert!(results[..60].iter().all(|r| *r == Ok(IngestOutcome::Advanced)));
    assert!(results[60..].iter().all(|r| *r == Ok(IngestOutcome::Historical)));

    for v in 0..6 {
        let id = VehicleId::new(format!("V{v}"));
        let log = store.position_log(&id).unwrap();
        assert_eq!(log.len(), 11);
        assert!(log[..10].windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(store.presence(&id).unwrap().unwrap().last_speed, Some(10.0));
    }
    assert_eq!(ingestor.fleet_counts().unwrap().total, 6);
}

#[test]
fn sqlite_ingestion_from_many_threads() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        SqliteStore::open(&dir.path().join("fleet.sqlite3"), Duration::from_secs(5)).unwrap(),
    );
    let ingestor = Arc::new(ingestor(store.clone(), 4));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let ingestor = Arc::clone(&ingestor);
            thread::spawn(move || {
                let batch: Vec<PositionReport> = (0..25i64)
                    .map(|i| report(&format!("V{t}"), at(10, 0) + TimeDelta::minutes(i), 20.0))
                    .collect();
                ingestor.ingest_batch(&batch)
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap().iter().all(std::result::Result::is_ok));
    }

    let presence = store.all_presence().unwrap();
    assert_eq!(presence.len(), 4);
    assert!(presence.iter().all(|p| p.last_seen == at(10, 24)));
    assert_eq!(store.prune_positions_before(at(10, 10)).unwrap(), 40);
}
