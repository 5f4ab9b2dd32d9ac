//! SQLite store: WAL-mode database implementing every storage seam.
//!
//! A small pool of connections to one database file. Readers never wait on
//! each other; writers take `BEGIN IMMEDIATE` transactions and queue inside
//! SQLite for at most the busy timeout. Each position report, each upload's
//! accepted set and each fusion read runs inside its own transaction.
//! Timestamps are stored as epoch milliseconds.

#![allow(missing_docs)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Type;
use rusqlite::{
    Connection, ErrorCode, OpenFlags, OptionalExtension, TransactionBehavior, params,
};

use crate::core::errors::{FleetError, Result};
use crate::core::ids::{DriverId, VehicleId};
use crate::fusion::assignment::Assignment;
use crate::store::{
    ActivityQuery, ActivityStore, AssignmentSource, FleetDirectory, PositionStore, SegmentQuery,
};
use crate::tacho::activity::{ActivityInterval, StoredInterval};
use crate::telemetry::presence::{
    Coordinates, GpsPosition, IngestOutcome, PositionExtras, PositionSource, VehiclePresence,
};

/// Pool size used by [`SqliteStore::open`].
pub const DEFAULT_CONNECTIONS: usize = 4;

pub struct SqliteStore {
    pool: Vec<Mutex<Connection>>,
    next: AtomicUsize,
    busy_timeout: Duration,
}

impl SqliteStore {
    /// Open (or create) the database at `path` with the default pool size.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        Self::open_with_connections(path, busy_timeout, DEFAULT_CONNECTIONS)
    }

    /// Open (or create) the database at `path`, applying schema and PRAGMAs,
    /// and keep `connections` handles to it (at least one).
    pub fn open_with_connections(
        path: &Path,
        busy_timeout: Duration,
        connections: usize,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| FleetError::io(parent, source))?;
        }

        let mut pool = Vec::with_capacity(connections.max(1));
        for index in 0..connections.max(1) {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.busy_timeout(busy_timeout)?;
            apply_pragmas(&conn)?;
            if index == 0 {
                apply_schema(&conn)?;
            }
            pool.push(Mutex::new(conn));
        }

        Ok(Self {
            pool,
            next: AtomicUsize::new(0),
            busy_timeout,
        })
    }

    pub fn connections(&self) -> usize {
        self.pool.len()
    }

    /// Check that WAL mode is active (for diagnostics).
    pub fn is_wal_mode(&self) -> bool {
        self.with_conn("is_wal_mode", |conn| {
            conn.query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))
        })
        .is_ok_and(|mode| mode.eq_ignore_ascii_case("wal"))
    }

    fn waited_ms(&self) -> u64 {
        u64::try_from(self.busy_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    /// Take any idle connection, else wait up to the busy timeout for one.
    fn lock(&self, context: &'static str) -> Result<MutexGuard<'_, Connection>> {
        let start = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        for offset in 0..self.pool.len() {
            if let Some(conn) = self.pool[(start + offset) % self.pool.len()].try_lock() {
                return Ok(conn);
            }
        }
        self.pool[start]
            .try_lock_for(self.busy_timeout)
            .ok_or(FleetError::StorageTimeout {
                context,
                waited_ms: self.waited_ms(),
            })
    }

    fn with_conn<T>(
        &self,
        context: &'static str,
        work: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self.lock(context)?;
        work(&mut conn).map_err(|error| self.sql_error(context, error))
    }

    fn sql_error(&self, context: &'static str, error: rusqlite::Error) -> FleetError {
        match error.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                FleetError::StorageTimeout {
                    context,
                    waited_ms: self.waited_ms(),
                }
            }
            _ => match error {
                rusqlite::Error::FromSqlConversionFailure(_, _, cause) => FleetError::Storage {
                    context,
                    details: cause.to_string(),
                },
                other => FleetError::Sql {
                    context,
                    details: other.to_string(),
                },
            },
        }
    }

    // ──────────────────── directory writes ────────────────────

    pub fn register_driver(&self, driver: &DriverId) -> Result<()> {
        self.with_conn("register_driver", |conn| {
            conn.prepare_cached("INSERT OR IGNORE INTO drivers (driver_id) VALUES (?1)")?
                .execute(params![driver.as_str()])
        })?;
        Ok(())
    }

    pub fn register_vehicle(&self, vehicle: &VehicleId) -> Result<()> {
        self.with_conn("register_vehicle", |conn| {
            conn.prepare_cached("INSERT OR IGNORE INTO vehicles (vehicle_id) VALUES (?1)")?
                .execute(params![vehicle.as_str()])
        })?;
        Ok(())
    }

    pub fn record_assignment(&self, assignment: &Assignment) -> Result<()> {
        if assignment
            .assigned_until
            .is_some_and(|until| until <= assignment.assigned_from)
        {
            return Err(FleetError::InvalidInput {
                details: "assignment ends before it starts".to_string(),
            });
        }
        self.with_conn("record_assignment", |conn| {
            conn.prepare_cached(
                "INSERT INTO driver_vehicle_assignments (
                driver_id, vehicle_id, assigned_from_ms, assigned_until_ms
            ) VALUES (?1,?2,?3,?4)",
            )?
            .execute(params![
                assignment.driver_id.as_str(),
                assignment.vehicle_id.as_str(),
                assignment.assigned_from.timestamp_millis(),
                assignment.assigned_until.map(|t| t.timestamp_millis()),
            ])
        })?;
        Ok(())
    }
}

// ──────────────────── activity_intervals ────────────────────

const INTERVAL_COLUMNS: &str = "id, driver_id, state, start_ms, end_ms, observed_until_ms, \
     source_file_id, source_format";

fn read_interval(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredInterval> {
    let state: String = row.get(2)?;
    let format: String = row.get(7)?;
    Ok(StoredInterval {
        id: row.get(0)?,
        interval: ActivityInterval {
            driver_id: DriverId::new(row.get::<_, String>(1)?),
            state: state.parse().map_err(|details| corrupt(2, Type::Text, details))?,
            start_time: from_millis(3, row.get(3)?)?,
            end_time: optional_millis(4, row.get(4)?)?,
            observed_until: optional_millis(5, row.get(5)?)?,
            source_file_id: row.get(6)?,
            source_format: format.parse().map_err(|details| corrupt(7, Type::Text, details))?,
        },
    })
}

impl ActivityStore for SqliteStore {
    fn intervals_overlapping(
        &self,
        driver: &DriverId,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredInterval>> {
        self.with_conn("intervals_overlapping", |conn| {
            conn.prepare_cached(&format!(
                "SELECT {INTERVAL_COLUMNS} FROM activity_intervals
                 WHERE driver_id = ?1
                   AND (COALESCE(end_ms, observed_until_ms) IS NULL
                        OR COALESCE(end_ms, observed_until_ms) > ?2)
                   AND (?3 IS NULL OR start_ms < ?3)
                 ORDER BY start_ms ASC, id ASC"
            ))?
            .query_map(
                params![
                    driver.as_str(),
                    start.timestamp_millis(),
                    end.map(|t| t.timestamp_millis())
                ],
                read_interval,
            )?
            .collect()
        })
    }

    fn next_start_after(
        &self,
        driver: &DriverId,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        self.with_conn("next_start_after", |conn| {
            let next: Option<i64> = conn
                .prepare_cached(
                    "SELECT MIN(start_ms) FROM activity_intervals
                     WHERE driver_id = ?1 AND start_ms > ?2",
                )?
                .query_row(params![driver.as_str(), after.timestamp_millis()], |row| {
                    row.get(0)
                })?;
            optional_millis(0, next)
        })
    }

    fn insert_intervals(&self, intervals: &[ActivityInterval]) -> Result<Vec<i64>> {
        self.with_conn("insert_intervals", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut ids = Vec::with_capacity(intervals.len());
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO activity_intervals (
                    driver_id, state, start_ms, end_ms, observed_until_ms,
                    source_file_id, source_format
                ) VALUES (?1,?2,?3,?4,?5,?6,?7)",
                )?;
                for interval in intervals {
                    stmt.execute(params![
                        interval.driver_id.as_str(),
                        interval.state.as_str(),
                        interval.start_time.timestamp_millis(),
                        interval.end_time.map(|t| t.timestamp_millis()),
                        interval.observed_until.map(|t| t.timestamp_millis()),
                        interval.source_file_id,
                        interval.source_format.as_str(),
                    ])?;
                    ids.push(tx.last_insert_rowid());
                }
            }
            tx.commit()?;
            Ok(ids)
        })
    }

    fn list_intervals(
        &self,
        driver: &DriverId,
        query: &ActivityQuery,
    ) -> Result<Vec<StoredInterval>> {
        let limit = query
            .limit
            .map_or(-1, |limit| i64::try_from(limit).unwrap_or(i64::MAX));
        self.with_conn("list_intervals", |conn| {
            conn.prepare_cached(&format!(
                "SELECT {INTERVAL_COLUMNS} FROM activity_intervals
                 WHERE driver_id = ?1
                   AND (?2 IS NULL
                        OR COALESCE(end_ms, observed_until_ms) IS NULL
                        OR COALESCE(end_ms, observed_until_ms) > ?2)
                   AND (?3 IS NULL OR start_ms < ?3)
                   AND (?4 IS NULL OR state = ?4)
                 ORDER BY start_ms DESC, id DESC
                 LIMIT ?5"
            ))?
            .query_map(
                params![
                    driver.as_str(),
                    query.start.map(|t| t.timestamp_millis()),
                    query.end.map(|t| t.timestamp_millis()),
                    query.state.map(|s| s.as_str()),
                    limit,
                ],
                read_interval,
            )?
            .collect()
        })
    }
}

// ──────────────────── gps_positions / vehicle_presence ────────────────────

const POSITION_COLUMNS: &str = "vehicle_id, ts_ms, latitude, longitude, speed_kmh, source, \
     heading, odometer_km, ignition, driver_id";

fn read_position(row: &rusqlite::Row<'_>) -> rusqlite::Result<GpsPosition> {
    let source: String = row.get(5)?;
    Ok(GpsPosition {
        vehicle_id: VehicleId::new(row.get::<_, String>(0)?),
        timestamp: from_millis(1, row.get(1)?)?,
        latitude: row.get(2)?,
        longitude: row.get(3)?,
        speed_kmh: row.get(4)?,
        source: PositionSource::parse(&source)
            .ok_or_else(|| corrupt(5, Type::Text, format!("unknown position source {source:?}")))?,
        extras: PositionExtras {
            heading: row.get(6)?,
            odometer_km: row.get(7)?,
            ignition: row.get(8)?,
            driver_id: row.get::<_, Option<String>>(9)?.map(DriverId::new),
        },
    })
}

const PRESENCE_COLUMNS: &str = "vehicle_id, last_seen_ms, last_latitude, last_longitude, \
     last_speed, last_heading, odometer_km";

fn read_presence_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VehiclePresence> {
    let latitude: Option<f64> = row.get(2)?;
    let longitude: Option<f64> = row.get(3)?;
    Ok(VehiclePresence {
        vehicle_id: VehicleId::new(row.get::<_, String>(0)?),
        last_seen: from_millis(1, row.get(1)?)?,
        last_position: latitude.zip(longitude).map(|(latitude, longitude)| Coordinates {
            latitude,
            longitude,
        }),
        last_speed: row.get(4)?,
        last_heading: row.get(5)?,
        odometer_km: row.get(6)?,
    })
}

fn read_presence(conn: &Connection, vehicle: &VehicleId) -> rusqlite::Result<Option<VehiclePresence>> {
    conn.prepare_cached(&format!(
        "SELECT {PRESENCE_COLUMNS} FROM vehicle_presence WHERE vehicle_id = ?1"
    ))?
    .query_row(params![vehicle.as_str()], read_presence_row)
    .optional()
}

fn write_presence(conn: &Connection, presence: &VehiclePresence) -> rusqlite::Result<()> {
    conn.prepare_cached(&format!(
        "INSERT OR REPLACE INTO vehicle_presence ({PRESENCE_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7)"
    ))?
    .execute(params![
        presence.vehicle_id.as_str(),
        presence.last_seen.timestamp_millis(),
        presence.last_position.map(|c| c.latitude),
        presence.last_position.map(|c| c.longitude),
        presence.last_speed,
        presence.last_heading,
        presence.odometer_km,
    ])?;
    Ok(())
}

impl PositionStore for SqliteStore {
    fn record(&self, position: &GpsPosition) -> Result<IngestOutcome> {
        self.with_conn("record", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.prepare_cached(&format!(
                "INSERT INTO gps_positions ({POSITION_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)"
            ))?
            .execute(params![
                position.vehicle_id.as_str(),
                position.timestamp.timestamp_millis(),
                position.latitude,
                position.longitude,
                position.speed_kmh,
                position.source.as_str(),
                position.extras.heading,
                position.extras.odometer_km,
                position.extras.ignition,
                position.extras.driver_id.as_ref().map(DriverId::as_str),
            ])?;

            let mut presence = read_presence(&tx, &position.vehicle_id)?.unwrap_or_else(|| {
                VehiclePresence::first_seen(position.vehicle_id.clone(), position.timestamp)
            });
            let outcome = presence.apply_position(position);
            if outcome == IngestOutcome::Advanced {
                write_presence(&tx, &presence)?;
            }
            tx.commit()?;
            Ok(outcome)
        })
    }

    fn heartbeat(&self, vehicle: &VehicleId, at: DateTime<Utc>) -> Result<IngestOutcome> {
        self.with_conn("heartbeat", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let (presence, outcome) = match read_presence(&tx, vehicle)? {
                Some(mut presence) => {
                    let outcome = presence.apply_heartbeat(at);
                    (presence, outcome)
                }
                None => (
                    VehiclePresence::first_seen(vehicle.clone(), at),
                    IngestOutcome::Advanced,
                ),
            };
            if outcome == IngestOutcome::Advanced {
                write_presence(&tx, &presence)?;
            }
            tx.commit()?;
            Ok(outcome)
        })
    }

    fn presence(&self, vehicle: &VehicleId) -> Result<Option<VehiclePresence>> {
        self.with_conn("presence", |conn| read_presence(conn, vehicle))
    }

    fn all_presence(&self) -> Result<Vec<VehiclePresence>> {
        self.with_conn("all_presence", |conn| {
            conn.prepare_cached(&format!(
                "SELECT {PRESENCE_COLUMNS} FROM vehicle_presence ORDER BY vehicle_id ASC"
            ))?
            .query_map([], read_presence_row)?
            .collect()
        })
    }

    fn positions_for_segments(&self, segments: &[SegmentQuery]) -> Result<Vec<Vec<GpsPosition>>> {
        self.with_conn("positions_for_segments", |conn| {
            let tx = conn.transaction()?;
            let mut out = Vec::with_capacity(segments.len());
            {
                let mut stmt = tx.prepare_cached(&format!(
                    "SELECT {POSITION_COLUMNS} FROM gps_positions
                     WHERE vehicle_id = ?1 AND ts_ms >= ?2 AND ts_ms < ?3
                     ORDER BY ts_ms ASC, id ASC"
                ))?;
                for segment in segments {
                    out.push(
                        stmt.query_map(
                            params![
                                segment.vehicle_id.as_str(),
                                segment.start.timestamp_millis(),
                                segment.end.timestamp_millis()
                            ],
                            read_position,
                        )?
                        .collect::<rusqlite::Result<Vec<_>>>()?,
                    );
                }
            }
            tx.commit()?;
            Ok(out)
        })
    }

    fn prune_positions_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted = self.with_conn("prune_positions_before", |conn| {
            conn.execute(
                "DELETE FROM gps_positions WHERE ts_ms < ?1",
                params![cutoff.timestamp_millis()],
            )
        })?;
        Ok(u64::try_from(deleted).unwrap_or(u64::MAX))
    }
}

// ──────────────────── assignments and directory ────────────────────

impl AssignmentSource for SqliteStore {
    fn assignments_for(
        &self,
        driver: &DriverId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Assignment>> {
        self.with_conn("assignments_for", |conn| {
            conn.prepare_cached(
                "SELECT vehicle_id, assigned_from_ms, assigned_until_ms
                 FROM driver_vehicle_assignments
                 WHERE driver_id = ?1
                   AND assigned_from_ms < ?3
                   AND (assigned_until_ms IS NULL OR assigned_until_ms > ?2)
                 ORDER BY assigned_from_ms ASC, id ASC",
            )?
            .query_map(
                params![driver.as_str(), start.timestamp_millis(), end.timestamp_millis()],
                |row| {
                    Ok(Assignment {
                        driver_id: driver.clone(),
                        vehicle_id: VehicleId::new(row.get::<_, String>(0)?),
                        assigned_from: from_millis(1, row.get(1)?)?,
                        assigned_until: optional_millis(2, row.get(2)?)?,
                    })
                },
            )?
            .collect()
        })
    }
}

impl FleetDirectory for SqliteStore {
    fn driver_exists(&self, driver: &DriverId) -> Result<bool> {
        self.with_conn("driver_exists", |conn| {
            conn.prepare_cached("SELECT 1 FROM drivers WHERE driver_id = ?1")?
                .exists(params![driver.as_str()])
        })
    }

    fn vehicle_exists(&self, vehicle: &VehicleId) -> Result<bool> {
        self.with_conn("vehicle_exists", |conn| {
            conn.prepare_cached("SELECT 1 FROM vehicles WHERE vehicle_id = ?1")?
                .exists(params![vehicle.as_str()])
        })
    }

    fn vehicle_ids(&self) -> Result<Vec<VehicleId>> {
        self.with_conn("vehicle_ids", |conn| {
            conn.prepare_cached("SELECT vehicle_id FROM vehicles ORDER BY vehicle_id")?
                .query_map([], |row| row.get::<_, String>(0).map(VehicleId::new))?
                .collect()
        })
    }
}

// ──────────────────── conversions ────────────────────

fn from_millis(column: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| corrupt(column, Type::Integer, format!("timestamp {ms} out of range")))
}

fn optional_millis(column: usize, ms: Option<i64>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    ms.map(|ms| from_millis(column, ms)).transpose()
}

fn corrupt(column: usize, kind: Type, details: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        kind,
        format!("unreadable column {column}: {details}").into(),
    )
}

// ──────────────────── schema & pragmas ────────────────────

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -8000;
         PRAGMA temp_store = MEMORY;
         PRAGMA foreign_keys = ON;",
    )?;
    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        eprintln!("[FFX-SQLITE] WARNING: requested WAL mode but got '{mode}'");
    }
    Ok(())
}

/// Columns added after the first schema; older databases gain them on open.
const ADDED_COLUMNS: &[(&str, &str, &str)] = &[
    ("activity_intervals", "observed_until_ms", "INTEGER"),
    ("gps_positions", "heading", "REAL"),
    ("gps_positions", "odometer_km", "REAL"),
    ("gps_positions", "ignition", "INTEGER"),
    ("gps_positions", "driver_id", "TEXT"),
    ("vehicle_presence", "last_heading", "REAL"),
    ("vehicle_presence", "odometer_km", "REAL"),
];

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS activity_intervals (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            driver_id TEXT NOT NULL,
            state TEXT NOT NULL,
            start_ms INTEGER NOT NULL,
            end_ms INTEGER,
            observed_until_ms INTEGER,
            source_file_id TEXT NOT NULL,
            source_format TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS gps_positions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            vehicle_id TEXT NOT NULL,
            ts_ms INTEGER NOT NULL,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            speed_kmh REAL,
            source TEXT NOT NULL,
            heading REAL,
            odometer_km REAL,
            ignition INTEGER,
            driver_id TEXT
        );
        CREATE TABLE IF NOT EXISTS vehicle_presence (
            vehicle_id TEXT PRIMARY KEY,
            last_seen_ms INTEGER NOT NULL,
            last_latitude REAL,
            last_longitude REAL,
            last_speed REAL,
            last_heading REAL,
            odometer_km REAL
        );
        CREATE TABLE IF NOT EXISTS driver_vehicle_assignments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            driver_id TEXT NOT NULL,
            vehicle_id TEXT NOT NULL,
            assigned_from_ms INTEGER NOT NULL,
            assigned_until_ms INTEGER
        );
        CREATE TABLE IF NOT EXISTS drivers (
            driver_id TEXT PRIMARY KEY
        );
        CREATE TABLE IF NOT EXISTS vehicles (
            vehicle_id TEXT PRIMARY KEY
        );
        CREATE INDEX IF NOT EXISTS idx_intervals_driver_start
            ON activity_intervals(driver_id, start_ms);
        CREATE INDEX IF NOT EXISTS idx_positions_vehicle_ts
            ON gps_positions(vehicle_id, ts_ms);
        CREATE INDEX IF NOT EXISTS idx_positions_ts ON gps_positions(ts_ms);
        CREATE INDEX IF NOT EXISTS idx_assignments_driver_from
            ON driver_vehicle_assignments(driver_id, assigned_from_ms);",
    )?;

    for (table, column, decl) in ADDED_COLUMNS {
        let present = conn
            .prepare_cached("SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2")?
            .exists(params![table, column])?;
        if !present {
            conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl};"))?;
        }
    }
    Ok(())
}

// ──────────────────── tests ────────────────────
