//! Tachograph upload boundary: validate, decode, build, reconcile, report.
//!
//! File-level problems produce `success = false` and persist nothing.
//! Record-level problems become warnings and the rest of the file is kept.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::core::clock::Clock;
use crate::core::config::UploadConfig;
use crate::core::errors::FleetError;
use crate::core::ids::DriverId;
use crate::logger::journal::{JournalEvent, JournalHandle};
use crate::reconcile::reconciler::{ReconcileReport, Reconciler};
use crate::store::{ActivityStore, FleetDirectory};
use crate::tacho::activity::{ActivityInterval, ActivityState, DriverSlot, SourceFormat};
use crate::tacho::decoder::{self, DecodeError, DecodedFile};
use crate::tacho::{intervals, source_file_id};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub driver_id: DriverId,
    /// Vehicle unit slot to extract; defaults to `upload.default_slot`.
    #[serde(default)]
    pub slot: Option<DriverSlot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseSummary {
    pub card_number: Option<String>,
    pub vehicle_registration: Option<String>,
    pub total_driving_minutes: i64,
    /// REST and BREAK together.
    pub total_rest_minutes: i64,
    pub total_work_minutes: i64,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub success: bool,
    pub file_name: String,
    pub driver_id: DriverId,
    pub activities_created: usize,
    pub activities_skipped: usize,
    pub parse_result: ParseSummary,
    pub errors: Vec<String>,
}

/// Why a whole file was turned away.
#[derive(Debug)]
struct Rejection {
    code: &'static str,
    message: String,
}

impl From<FleetError> for Rejection {
    fn from(value: FleetError) -> Self {
        Self {
            code: value.code(),
            message: value.to_string(),
        }
    }
}

impl From<DecodeError> for Rejection {
    fn from(value: DecodeError) -> Self {
        Self {
            code: value.code(),
            message: value.to_string(),
        }
    }
}

fn invalid(message: String) -> Rejection {
    FleetError::InvalidInput { details: message }.into()
}

pub struct UploadService {
    reconciler: Reconciler,
    directory: Option<Arc<dyn FleetDirectory>>,
    clock: Arc<dyn Clock>,
    config: UploadConfig,
    journal: JournalHandle,
}

impl UploadService {
    #[must_use]
    pub fn new(store: Arc<dyn ActivityStore>, clock: Arc<dyn Clock>, config: UploadConfig) -> Self {
        Self {
            reconciler: Reconciler::new(store, config.lock_timeout()),
            directory: None,
            clock,
            config,
            journal: JournalHandle::noop(),
        }
    }

    /// Reject uploads for drivers the directory does not know.
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

    /// Process one uploaded file end to end.
    pub fn upload(&self, request: &UploadRequest) -> UploadResponse {
        let started = Instant::now();
        let mut response = UploadResponse {
            success: false,
            file_name: request.file_name.clone(),
            driver_id: request.driver_id.clone(),
            activities_created: 0,
            activities_skipped: 0,
            parse_result: ParseSummary::default(),
            errors: Vec::new(),
        };

        let outcome = self
            .validate(request)
            .and_then(|format| self.decode(request, format, &mut response.parse_result))
            .and_then(|(file_id, candidates)| {
                let report = self.reconciler.reconcile(&request.driver_id, &candidates)?;
                Ok((file_id, report))
            });

        match outcome {
            Ok((file_id, report)) => {
                self.apply_report(&mut response, report);
                self.journal.send(JournalEvent::UploadProcessed {
                    driver_id: request.driver_id.to_string(),
                    file_name: request.file_name.clone(),
                    source_file_id: file_id,
                    created: response.activities_created,
                    skipped: response.activities_skipped,
                    warnings: response.parse_result.warnings.len(),
                    duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                });
            }
            Err(rejection) => {
                response.errors.push(rejection.message.clone());
                self.journal.send(JournalEvent::UploadRejected {
                    driver_id: request.driver_id.to_string(),
                    file_name: request.file_name.clone(),
                    code: rejection.code.to_string(),
                    reason: rejection.message,
                });
            }
        }
        response
    }

    fn validate(&self, request: &UploadRequest) -> Result<SourceFormat, Rejection> {
        let format = SourceFormat::from_file_name(&request.file_name).ok_or_else(|| {
            invalid(format!(
                "unsupported file type {:?}: expected .ddd or .tgd",
                request.file_name
            ))
        })?;
        if request.bytes.is_empty() {
            return Err(invalid(format!("{} is empty", request.file_name)));
        }
        if request.bytes.len() as u64 > self.config.max_file_size_bytes {
            return Err(invalid(format!(
                "{} is {} bytes, over the {} byte limit",
                request.file_name,
                request.bytes.len(),
                self.config.max_file_size_bytes
            )));
        }
        if let Some(directory) = &self.directory {
            if !directory.driver_exists(&request.driver_id)? {
                return Err(FleetError::NotFound {
                    entity: "driver",
                    id: request.driver_id.to_string(),
                }
                .into());
            }
        }
        Ok(format)
    }

    fn decode(
        &self,
        request: &UploadRequest,
        format: SourceFormat,
        summary: &mut ParseSummary,
    ) -> Result<(String, Vec<ActivityInterval>), Rejection> {
        let slot = request.slot.unwrap_or(self.config.default_slot);
        let decoded = decoder::decode(&request.bytes, format, slot)?;
        let file_id = source_file_id(&request.bytes);

        let built = intervals::build(&decoded.events, decoded.session_open);
        let now = self.clock.now();
        let candidates =
            intervals::into_activity_intervals(&built, &request.driver_id, &file_id, format, now);
        *summary = summarize(&decoded, &candidates, now);
        Ok((file_id, candidates))
    }

    fn apply_report(&self, response: &mut UploadResponse, report: ReconcileReport) {
        response.success = true;
        response.activities_created = report.created;
        response.activities_skipped = report.skipped;
        response.parse_result.warnings.extend(report.warnings);
    }
}

fn summarize(
    decoded: &DecodedFile,
    candidates: &[ActivityInterval],
    now: chrono::DateTime<chrono::Utc>,
) -> ParseSummary {
    let mut summary = ParseSummary {
        card_number: decoded.card_number.clone(),
        vehicle_registration: decoded.vehicle_registration.clone(),
        warnings: decoded.warnings.iter().map(ToString::to_string).collect(),
        ..ParseSummary::default()
    };
    for interval in candidates {
        let minutes = interval.minutes_until(now);
        match interval.state {
            ActivityState::Driving => summary.total_driving_minutes += minutes,
            ActivityState::Work => summary.total_work_minutes += minutes,
            state if state.counts_as_rest() => summary.total_rest_minutes += minutes,
            _ => {}
        }
    }
    summary
}
