//! Activity vocabulary shared by the decoders, the interval builder, the
//! reconciler and fusion.

#![allow(missing_docs)]

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ids::DriverId;

// ──────────────────── states and codes ────────────────────

/// What a driver was doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityState {
    Driving,
    Work,
    Rest,
    Break,
    Availability,
}

impl ActivityState {
    /// Map a 2-bit tachograph activity code. `0` is the shared BREAK/REST code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Break),
            1 => Some(Self::Availability),
            2 => Some(Self::Work),
            3 => Some(Self::Driving),
            _ => None,
        }
    }

    /// Stable storage/wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Driving => "DRIVING",
            Self::Work => "WORK",
            Self::Rest => "REST",
            Self::Break => "BREAK",
            Self::Availability => "AVAILABILITY",
        }
    }

    /// Rest totals include both REST and BREAK.
    #[must_use]
    pub const fn counts_as_rest(self) -> bool {
        matches!(self, Self::Rest | Self::Break)
    }
}

impl fmt::Display for ActivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityState {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "DRIVING" => Ok(Self::Driving),
            "WORK" => Ok(Self::Work),
            "REST" => Ok(Self::Rest),
            "BREAK" => Ok(Self::Break),
            "AVAILABILITY" => Ok(Self::Availability),
            other => Err(format!("unknown activity state {other:?}")),
        }
    }
}

/// Tachograph card slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverSlot {
    /// Card slot 1.
    Primary,
    /// Card slot 2.
    CoDriver,
}

impl DriverSlot {
    #[must_use]
    pub const fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Primary),
            2 => Some(Self::CoDriver),
            _ => None,
        }
    }
}

impl FromStr for DriverSlot {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "primary" | "1" => Ok(Self::Primary),
            "co_driver" | "co-driver" | "codriver" | "2" => Ok(Self::CoDriver),
            other => Err(format!("unknown driver slot {other:?}")),
        }
    }
}

/// Which interchange format a file was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceFormat {
    /// `.ddd` driver card download.
    DriverCard,
    /// `.tgd` vehicle unit download.
    VehicleUnit,
}

impl SourceFormat {
    /// Derive the format from a file name's extension, case-insensitively.
    #[must_use]
    pub fn from_file_name(name: &str) -> Option<Self> {
        let (_, ext) = name.rsplit_once('.')?;
        if ext.eq_ignore_ascii_case("ddd") {
            Some(Self::DriverCard)
        } else if ext.eq_ignore_ascii_case("tgd") {
            Some(Self::VehicleUnit)
        } else {
            None
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DriverCard => "DRIVER_CARD",
            Self::VehicleUnit => "VEHICLE_UNIT",
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "DRIVER_CARD" => Ok(Self::DriverCard),
            "VEHICLE_UNIT" => Ok(Self::VehicleUnit),
            other => Err(format!("unknown source format {other:?}")),
        }
    }
}

// ──────────────────── events and intervals ────────────────────

/// One activity change as read from a file. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityEvent {
    pub slot: DriverSlot,
    pub timestamp: DateTime<Utc>,
    pub state: ActivityState,
}

/// A labeled half-open span `[start_time, end_time)` of a driver's time.
///
/// `end_time == None` means the recording session was still open when the
/// file was downloaded. `observed_until` then records that download time, the
/// last instant the file vouches for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityInterval {
    pub driver_id: DriverId,
    pub state: ActivityState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_until: Option<DateTime<Utc>>,
    /// Hex SHA-256 of the uploaded bytes.
    pub source_file_id: String,
    pub source_format: SourceFormat,
}

impl ActivityInterval {
    /// Closed and zero-length.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end_time.is_some_and(|end| end <= self.start_time)
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Last instant the interval is known to cover: `end_time` when closed,
    /// else the download time if one was recorded.
    #[must_use]
    pub fn known_end(&self) -> Option<DateTime<Utc>> {
        self.end_time.or(self.observed_until)
    }

    /// End of an open interval cut at the earlier of its download time and
    /// `next_start`, the start of the driver's next known interval. Never
    /// earlier than `start_time`. `None` when nothing bounds it.
    #[must_use]
    pub fn bounded_end(&self, next_start: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        if let Some(end) = self.end_time {
            return Some(end);
        }
        let bound = match (self.observed_until, next_start) {
            (Some(observed), Some(next)) => Some(observed.min(next)),
            (observed, next) => observed.or(next),
        };
        bound.map(|end| end.max(self.start_time))
    }

    /// Whether `[start, end)` intersects this interval. An open interval
    /// reaches its download time, or forever when none was recorded.
    #[must_use]
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start_time < end && self.known_end().is_none_or(|own_end| own_end > start)
    }

    /// Whole minutes covered, counting an open interval up to `now` or its
    /// download time, whichever is earlier.
    #[must_use]
    pub fn minutes_until(&self, now: DateTime<Utc>) -> i64 {
        let end = self
            .end_time
            .unwrap_or_else(|| self.observed_until.map_or(now, |observed| observed.min(now)));
        (end - self.start_time).num_minutes().max(0)
    }
}

/// A persisted interval with the row id the store assigned to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredInterval {
    pub id: i64,
    #[serde(flatten)]
    pub interval: ActivityInterval,
}
