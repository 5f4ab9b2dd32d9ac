//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use fleet_fusion::prelude::*;
//! ```

// Core
pub use crate::core::clock::{Clock, FixedClock, SystemClock};
pub use crate::core::config::Config;
pub use crate::core::errors::{FleetError, Result};
pub use crate::core::ids::{DriverId, VehicleId};

// Tachograph
pub use crate::tacho::activity::{
    ActivityEvent, ActivityInterval, ActivityState, DriverSlot, SourceFormat, StoredInterval,
};
pub use crate::tacho::decoder::{DecodeError, DecodedFile, decode};
pub use crate::tacho::intervals::{BuiltInterval, build};

// Reconciliation
pub use crate::reconcile::reconciler::{ReconcileReport, Reconciler};

// Telemetry
pub use crate::telemetry::ingestor::{IngestError, Ping, PositionReport, TelemetryIngestor};
pub use crate::telemetry::presence::{
    Coordinates, FleetCounts, GpsPosition, IngestOutcome, PositionExtras, PositionSource,
    VehiclePresence, VehicleStatus,
};

// Fusion
pub use crate::fusion::assignment::{Assignment, AssignmentTimeline};
pub use crate::fusion::engine::{ActivitySummary, FusedActivity, FusionEngine, FusionReport};

// Storage
pub use crate::store::memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use crate::store::sqlite::SqliteStore;
pub use crate::store::{ActivityStore, AssignmentSource, FleetDirectory, PositionStore};

// Services
#[cfg(feature = "sqlite")]
pub use crate::service::fleet::Fleet;
pub use crate::service::upload::{UploadRequest, UploadResponse, UploadService};
