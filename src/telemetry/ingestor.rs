//! Position and ping ingestion, online status and fleet counts.
//!
//! Each report is validated, then appended to the position log and folded
//! into the vehicle's presence as one atomic step in the [`PositionStore`].
//! Batches fan out across vehicles on a small scoped worker pool; reports for
//! the same vehicle always run in batch order on one worker.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use chrono::{DateTime, Utc};
use crossbeam_channel as channel;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::clock::Clock;
use crate::core::config::TelemetryConfig;
use crate::core::errors::FleetError;
use crate::core::ids::VehicleId;
use crate::logger::journal::{JournalEvent, JournalHandle};
use crate::store::{FleetDirectory, PositionStore};
use crate::telemetry::presence::{
    Coordinates, FleetCounts, GpsPosition, IngestOutcome, PositionExtras, PositionSource,
    VehicleStatus,
};

// ──────────────────── boundary types ────────────────────

/// Full position report from a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionReport {
    pub vehicle_id: VehicleId,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_kmh: Option<f64>,
    #[serde(flatten)]
    pub extras: PositionExtras,
}

/// Liveness signal, optionally carrying coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub vehicle_id: VehicleId,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Coordinates>,
}

/// Report as received on the wire, timestamp not yet parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPositionReport {
    pub vehicle_id: String,
    pub timestamp: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub speed_kmh: Option<f64>,
    #[serde(flatten)]
    pub extras: PositionExtras,
}

impl RawPositionReport {
    pub fn parse(self) -> Result<PositionReport, IngestError> {
        Ok(PositionReport {
            timestamp: parse_timestamp(&self.timestamp)?,
            vehicle_id: VehicleId::new(self.vehicle_id),
            latitude: self.latitude,
            longitude: self.longitude,
            speed_kmh: self.speed_kmh,
            extras: self.extras,
        })
    }
}

/// Parse an RFC 3339 timestamp or integer unix seconds.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, IngestError> {
    let trimmed = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(secs) = trimmed.parse::<i64>() {
        if let Some(ts) = DateTime::from_timestamp(secs, 0) {
            return Ok(ts);
        }
    }
    Err(IngestError::MalformedTimestamp {
        raw: raw.to_string(),
    })
}

/// Per-report ingestion failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestError {
    #[error("[FFX-5001] unknown vehicle {vehicle_id}")]
    UnknownVehicle { vehicle_id: VehicleId },

    #[error("[FFX-5002] invalid coordinates lat={latitude} lon={longitude}")]
    InvalidCoordinates { latitude: f64, longitude: f64 },

    #[error("[FFX-5003] invalid speed {speed_kmh} km/h")]
    InvalidSpeed { speed_kmh: f64 },

    #[error("[FFX-5004] timestamp {timestamp} is ahead of now ({now})")]
    FutureTimestamp {
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    #[error("[FFX-5005] malformed timestamp {raw:?}")]
    MalformedTimestamp { raw: String },

    #[error("[FFX-5006] batch element {index} exceeds the batch limit of {limit}")]
    BatchLimitExceeded { index: usize, limit: usize },

    #[error("[FFX-5007] invalid heading {heading} (expected 0..=360 degrees)")]
    InvalidHeading { heading: f64 },

    #[error("[FFX-5008] invalid odometer reading {odometer_km} km")]
    InvalidOdometer { odometer_km: f64 },

    #[error("[FFX-5900] storage failure ({code}): {details}")]
    Storage { code: &'static str, details: String },
}

impl IngestError {
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::UnknownVehicle { .. } => "FFX-5001",
            Self::InvalidCoordinates { .. } => "FFX-5002",
            Self::InvalidSpeed { .. } => "FFX-5003",
            Self::FutureTimestamp { .. } => "FFX-5004",
            Self::MalformedTimestamp { .. } => "FFX-5005",
            Self::BatchLimitExceeded { .. } => "FFX-5006",
            Self::InvalidHeading { .. } => "FFX-5007",
            Self::InvalidOdometer { .. } => "FFX-5008",
            Self::Storage { .. } => "FFX-5900",
        }
    }
}

impl From<FleetError> for IngestError {
    fn from(value: FleetError) -> Self {
        Self::Storage {
            code: value.code(),
            details: value.to_string(),
        }
    }
}

fn valid_coordinates(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude)
}

// ──────────────────── ingestor ────────────────────

/// Outcome of each batch element, in input order.
pub type BatchOutcome = Vec<Result<IngestOutcome, IngestError>>;

pub struct TelemetryIngestor {
    store: Arc<dyn PositionStore>,
    directory: Option<Arc<dyn FleetDirectory>>,
    clock: Arc<dyn Clock>,
    config: TelemetryConfig,
    journal: JournalHandle,
}

impl TelemetryIngestor {
    #[must_use]
    pub fn new(store: Arc<dyn PositionStore>, clock: Arc<dyn Clock>, config: TelemetryConfig) -> Self {
        Self {
            store,
            directory: None,
            clock,
            config,
            journal: JournalHandle::noop(),
        }
    }

    /// Check vehicles against `directory` and count fleet status over it.
    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn FleetDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    #[must_use]
    pub fn with_journal(mut self, journal: JournalHandle) -> Self {
        self.journal = journal;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// Ingest one full report.
    pub fn ingest(&self, report: &PositionReport) -> Result<IngestOutcome, IngestError> {
        let result = self.ingest_quiet(report, self.clock.now());
        if let Err(error) = &result {
            self.journal_rejection(&report.vehicle_id, error);
        }
        result
    }

    /// Ingest a batch. One result per element, in input order.
    ///
    /// Elements at or past `max_batch` fail with `BatchLimitExceeded` without
    /// affecting the earlier ones.
    pub fn ingest_batch(&self, reports: &[PositionReport]) -> BatchOutcome {
        let started = Instant::now();
        let now = self.clock.now();
        let limit = self.config.max_batch;
        let mut results: Vec<Option<Result<IngestOutcome, IngestError>>> =
            (0..reports.len()).map(|_| None).collect();

        let mut groups: BTreeMap<&VehicleId, Vec<usize>> = BTreeMap::new();
        for (index, report) in reports.iter().enumerate() {
            if index >= limit {
                results[index] = Some(Err(IngestError::BatchLimitExceeded { index, limit }));
            } else {
                groups.entry(&report.vehicle_id).or_default().push(index);
            }
        }

        let groups: Vec<Vec<usize>> = groups.into_values().collect();
        let workers = self.config.parallelism.max(1).min(groups.len());
        if workers <= 1 {
            for index in groups.into_iter().flatten() {
                results[index] = Some(self.ingest_quiet(&reports[index], now));
            }
        } else {
            for (index, result) in self.run_groups(reports, groups, workers, now) {
                results[index] = Some(result);
            }
        }

        let results: BatchOutcome = results
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    Err(IngestError::Storage {
                        code: "FFX-3900",
                        details: format!("batch element {index} was never processed"),
                    })
                })
            })
            .collect();

        let rejected = results.iter().filter(|r| r.is_err()).count();
        for (report, result) in reports.iter().zip(&results) {
            if let Err(error) = result {
                self.journal_rejection(&report.vehicle_id, error);
            }
        }
        self.journal.send(JournalEvent::BatchIngested {
            accepted: results.len() - rejected,
            rejected,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        });
        results
    }

    /// Record a ping. Presence advances; position and speed are only touched
    /// when the ping carries coordinates.
    pub fn ping(&self, ping: &Ping) -> Result<IngestOutcome, IngestError> {
        let now = self.clock.now();
        let result = self.check_common(&ping.vehicle_id, ping.timestamp, now).and_then(|()| {
            match ping.position {
                Some(coords) => {
                    if !valid_coordinates(coords.latitude, coords.longitude) {
                        return Err(IngestError::InvalidCoordinates {
                            latitude: coords.latitude,
                            longitude: coords.longitude,
                        });
                    }
                    let position = GpsPosition {
                        vehicle_id: ping.vehicle_id.clone(),
                        timestamp: ping.timestamp,
                        latitude: coords.latitude,
                        longitude: coords.longitude,
                        speed_kmh: None,
                        source: PositionSource::Ping,
                        extras: PositionExtras::default(),
                    };
                    Ok(self.store.record(&position)?)
                }
                None => Ok(self.store.heartbeat(&ping.vehicle_id, ping.timestamp)?),
            }
        });
        if let Err(error) = &result {
            self.journal_rejection(&ping.vehicle_id, error);
        }
        result
    }

    /// Current status of one vehicle; never-seen vehicles are offline.
    pub fn vehicle_status(&self, vehicle: &VehicleId) -> crate::core::errors::Result<VehicleStatus> {
        let presence = self.store.presence(vehicle)?;
        Ok(VehicleStatus::derive(
            vehicle.clone(),
            presence.as_ref(),
            self.clock.now(),
            self.config.online_threshold(),
        ))
    }

    /// Status of every known vehicle: the directory's vehicles when one is
    /// configured, otherwise every vehicle that has presence.
    pub fn all_statuses(&self) -> crate::core::errors::Result<Vec<VehicleStatus>> {
        let now = self.clock.now();
        let threshold = self.config.online_threshold();
        let presence: BTreeMap<VehicleId, _> = self
            .store
            .all_presence()?
            .into_iter()
            .map(|p| (p.vehicle_id.clone(), p))
            .collect();

        let statuses = match &self.directory {
            Some(directory) => directory
                .vehicle_ids()?
                .into_iter()
                .map(|id| {
                    let p = presence.get(&id);
                    VehicleStatus::derive(id, p, now, threshold)
                })
                .collect(),
            None => presence
                .into_iter()
                .map(|(id, p)| VehicleStatus::derive(id, Some(&p), now, threshold))
                .collect(),
        };
        Ok(statuses)
    }

    pub fn fleet_counts(&self) -> crate::core::errors::Result<FleetCounts> {
        let statuses = self.all_statuses()?;
        let online = statuses.iter().filter(|s| s.is_online).count();
        Ok(FleetCounts {
            online,
            offline: statuses.len() - online,
            total: statuses.len(),
        })
    }

    /// Drop log entries older than `retention` before now. Presence is kept.
    pub fn prune(&self, retention: chrono::Duration) -> crate::core::errors::Result<u64> {
        let cutoff = self.clock.now() - retention;
        let removed = self.store.prune_positions_before(cutoff)?;
        self.journal.send(JournalEvent::PositionsPruned {
            removed,
            cutoff: cutoff.to_rfc3339(),
        });
        Ok(removed)
    }

    // ──────────────────── internals ────────────────────

    fn ingest_quiet(
        &self,
        report: &PositionReport,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, IngestError> {
        if !valid_coordinates(report.latitude, report.longitude) {
            return Err(IngestError::InvalidCoordinates {
                latitude: report.latitude,
                longitude: report.longitude,
            });
        }
        if let Some(speed) = report.speed_kmh {
            if !speed.is_finite() || speed < 0.0 {
                return Err(IngestError::InvalidSpeed { speed_kmh: speed });
            }
        }
        if let Some(heading) = report.extras.heading {
            if !heading.is_finite() || !(0.0..=360.0).contains(&heading) {
                return Err(IngestError::InvalidHeading { heading });
            }
        }
        if let Some(odometer_km) = report.extras.odometer_km {
            if !odometer_km.is_finite() || odometer_km < 0.0 {
                return Err(IngestError::InvalidOdometer { odometer_km });
            }
        }
        self.check_common(&report.vehicle_id, report.timestamp, now)?;

        let position = GpsPosition {
            vehicle_id: report.vehicle_id.clone(),
            timestamp: report.timestamp,
            latitude: report.latitude,
            longitude: report.longitude,
            speed_kmh: report.speed_kmh,
            source: PositionSource::FullReport,
            extras: report.extras.clone(),
        };
        Ok(self.store.record(&position)?)
    }

    fn check_common(
        &self,
        vehicle: &VehicleId,
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        if timestamp > now + self.config.future_tolerance() {
            return Err(IngestError::FutureTimestamp { timestamp, now });
        }
        if self.config.require_known_vehicle {
            if let Some(directory) = &self.directory {
                if !directory.vehicle_exists(vehicle)? {
                    return Err(IngestError::UnknownVehicle {
                        vehicle_id: vehicle.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Fan vehicle groups out over `workers` scoped threads.
    fn run_groups(
        &self,
        reports: &[PositionReport],
        groups: Vec<Vec<usize>>,
        workers: usize,
        now: DateTime<Utc>,
    ) -> Vec<(usize, Result<IngestOutcome, IngestError>)> {
        let (work_tx, work_rx) = channel::bounded::<Vec<usize>>(groups.len());
        let (result_tx, result_rx) = channel::unbounded();
        for group in groups {
            let _ = work_tx.send(group);
        }
        drop(work_tx);

        thread::scope(|scope| {
            for _ in 0..workers {
                let work_rx = work_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    for group in work_rx {
                        for index in group {
                            let result = self.ingest_quiet(&reports[index], now);
                            let _ = result_tx.send((index, result));
                        }
                    }
                });
            }
        });
        drop(result_tx);

        result_rx.into_iter().collect()
    }

    fn journal_rejection(&self, vehicle: &VehicleId, error: &IngestError) {
        self.journal.send(JournalEvent::IngestRejected {
            vehicle_id: vehicle.to_string(),
            code: error.code().to_string(),
            reason: error.to_string(),
        });
    }
}
