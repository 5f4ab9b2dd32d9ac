//! Position log entries, per-vehicle presence and online status derivation.

#![allow(missing_docs)]

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ids::{DriverId, VehicleId};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// How a position reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionSource {
    FullReport,
    Ping,
}

impl PositionSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FullReport => "FULL_REPORT",
            Self::Ping => "PING",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "FULL_REPORT" => Some(Self::FullReport),
            "PING" => Some(Self::Ping),
            _ => None,
        }
    }
}

/// Optional device readings that ride along with a full report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionExtras {
    /// Degrees clockwise from north, `0..=360`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub odometer_km: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignition: Option<bool>,
    /// Driver logged in on the device, if it reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<DriverId>,
}

/// One row of the append-only position log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsPosition {
    pub vehicle_id: VehicleId,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kmh: Option<f64>,
    pub source: PositionSource,
    #[serde(flatten)]
    pub extras: PositionExtras,
}

impl GpsPosition {
    #[must_use]
    pub const fn coordinates(&self) -> Coordinates {
        Coordinates {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

/// Whether an accepted event moved the vehicle's presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Presence now reflects this event.
    Advanced,
    /// Logged, but older than `last_seen`; presence untouched.
    Historical,
}

/// Latest known state of one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehiclePresence {
    pub vehicle_id: VehicleId,
    pub last_seen: DateTime<Utc>,
    pub last_position: Option<Coordinates>,
    pub last_speed: Option<f64>,
    #[serde(default)]
    pub last_heading: Option<f64>,
    /// Latest odometer reading seen, kept until a newer report carries one.
    #[serde(default)]
    pub odometer_km: Option<f64>,
}

impl VehiclePresence {
    /// Presence for a vehicle first heard from at `timestamp`.
    #[must_use]
    pub const fn first_seen(vehicle_id: VehicleId, timestamp: DateTime<Utc>) -> Self {
        Self {
            vehicle_id,
            last_seen: timestamp,
            last_position: None,
            last_speed: None,
            last_heading: None,
            odometer_km: None,
        }
    }

    /// Apply a logged position. Equal timestamps advance; older ones do not.
    ///
    /// A ping never carries speed or heading, so it leaves both alone. The
    /// odometer only moves when a report actually carries a reading.
    pub fn apply_position(&mut self, position: &GpsPosition) -> IngestOutcome {
        if position.timestamp < self.last_seen {
            return IngestOutcome::Historical;
        }
        self.last_seen = position.timestamp;
        self.last_position = Some(position.coordinates());
        if position.source == PositionSource::FullReport {
            self.last_speed = position.speed_kmh;
            self.last_heading = position.extras.heading;
        }
        if let Some(odometer) = position.extras.odometer_km {
            self.odometer_km = Some(odometer);
        }
        IngestOutcome::Advanced
    }

    /// Apply a position-less ping.
    pub fn apply_heartbeat(&mut self, timestamp: DateTime<Utc>) -> IngestOutcome {
        if timestamp < self.last_seen {
            return IngestOutcome::Historical;
        }
        self.last_seen = timestamp;
        IngestOutcome::Advanced
    }
}

/// Online means heard from within `threshold`, boundary included.
/// A vehicle with no presence is offline.
#[must_use]
pub fn is_online(presence: Option<&VehiclePresence>, now: DateTime<Utc>, threshold: Duration) -> bool {
    presence.is_some_and(|p| now - p.last_seen <= threshold)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleStatus {
    pub vehicle_id: VehicleId,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub current_position: Option<Coordinates>,
    pub current_speed: Option<f64>,
    pub current_heading: Option<f64>,
    pub total_odometer_km: Option<f64>,
}

impl VehicleStatus {
    #[must_use]
    pub fn derive(
        vehicle_id: VehicleId,
        presence: Option<&VehiclePresence>,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> Self {
        Self {
            vehicle_id,
            is_online: is_online(presence, now, threshold),
            last_seen: presence.map(|p| p.last_seen),
            current_position: presence.and_then(|p| p.last_position),
            current_speed: presence.and_then(|p| p.last_speed),
            current_heading: presence.and_then(|p| p.last_heading),
            total_odometer_km: presence.and_then(|p| p.odometer_km),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FleetCounts {
    pub online: usize,
    pub offline: usize,
    pub total: usize,
}
