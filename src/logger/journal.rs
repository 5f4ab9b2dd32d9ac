//! Event journal: a dedicated writer thread fed through a bounded channel.
//!
//! Uploads and ingestion never wait on the journal. `JournalHandle::send`
//! uses `try_send`; events that do not fit are counted and the count is
//! written to the journal as soon as the writer catches up.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::errors::{FleetError, Result};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};

const CHANNEL_CAPACITY: usize = 1024;

/// Everything the journal records.
#[derive(Debug, Clone)]
pub enum JournalEvent {
    ServiceStarted {
        version: String,
        config_hash: String,
    },
    UploadProcessed {
        driver_id: String,
        file_name: String,
        source_file_id: String,
        created: usize,
        skipped: usize,
        warnings: usize,
        duration_ms: u64,
    },
    UploadRejected {
        driver_id: String,
        file_name: String,
        code: String,
        reason: String,
    },
    BatchIngested {
        accepted: usize,
        rejected: usize,
        duration_ms: u64,
    },
    IngestRejected {
        vehicle_id: String,
        code: String,
        reason: String,
    },
    PositionsPruned {
        removed: u64,
        cutoff: String,
    },
    Error {
        code: String,
        message: String,
    },
    /// Stops the writer thread after flushing.
    Shutdown,
}

/// Cloneable, non-blocking sender side of the journal.
#[derive(Clone)]
pub struct JournalHandle {
    tx: Sender<JournalEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl JournalHandle {
    /// A handle whose events go nowhere.
    #[must_use]
    pub fn noop() -> Self {
        let (tx, _rx) = bounded(1);
        Self {
            tx,
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue `event`. A full channel drops it and bumps the counter.
    pub fn send(&self, event: JournalEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Events dropped and not yet reported to the journal.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Ask the writer thread to flush and exit.
    pub fn shutdown(&self) {
        let _ = self.tx.send(JournalEvent::Shutdown);
    }
}

/// Spawn the writer thread.
pub fn spawn_journal(
    config: JsonlConfig,
    capacity: usize,
) -> Result<(JournalHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<JournalEvent>(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let handle = JournalHandle {
        tx,
        dropped_events: Arc::clone(&dropped),
    };

    let join = thread::Builder::new()
        .name("ffx-journal".to_string())
        .spawn(move || journal_thread_main(&rx, config, &dropped))
        .map_err(|e| FleetError::Runtime {
            details: format!("failed to spawn journal thread: {e}"),
        })?;

    Ok((handle, join))
}

/// [`spawn_journal`] with the default channel capacity.
pub fn spawn_default(config: JsonlConfig) -> Result<(JournalHandle, thread::JoinHandle<()>)> {
    spawn_journal(config, CHANNEL_CAPACITY)
}

fn journal_thread_main(rx: &Receiver<JournalEvent>, config: JsonlConfig, dropped: &AtomicU64) {
    let mut writer = JsonlWriter::open(config);

    while let Ok(event) = rx.recv() {
        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            let mut entry = LogEntry::new(EventType::Error, Severity::Warning);
            entry.details = Some(format!("{lost} journal events dropped under back-pressure"));
            writer.write_entry(&entry);
        }

        if matches!(event, JournalEvent::Shutdown) {
            break;
        }
        if let Some(entry) = to_log_entry(&event) {
            writer.write_entry(&entry);
        }
        if writer.state() != "normal" {
            writer.try_recover();
        }
    }

    writer.flush();
    writer.fsync();
}

fn count(value: usize) -> Option<u64> {
    u64::try_from(value).ok()
}

fn to_log_entry(event: &JournalEvent) -> Option<LogEntry> {
    let entry = match event {
        JournalEvent::ServiceStarted {
            version,
            config_hash,
        } => {
            let mut e = LogEntry::new(EventType::ServiceStarted, Severity::Info);
            e.details = Some(format!("version={version} config_hash={config_hash}"));
            e.ok = Some(true);
            e
        }
        JournalEvent::UploadProcessed {
            driver_id,
            file_name,
            source_file_id,
            created,
            skipped,
            warnings,
            duration_ms,
        } => {
            let severity = if *warnings > 0 {
                Severity::Warning
            } else {
                Severity::Info
            };
            let mut e = LogEntry::new(EventType::UploadProcessed, severity);
            e.driver_id = Some(driver_id.clone());
            e.file_name = Some(file_name.clone());
            e.source_file_id = Some(source_file_id.clone());
            e.accepted = count(*created);
            e.rejected = count(*skipped);
            e.warnings = count(*warnings);
            e.duration_ms = Some(*duration_ms);
            e.ok = Some(true);
            e
        }
        JournalEvent::UploadRejected {
            driver_id,
            file_name,
            code,
            reason,
        } => {
            let mut e = LogEntry::new(EventType::UploadRejected, Severity::Warning);
            e.driver_id = Some(driver_id.clone());
            e.file_name = Some(file_name.clone());
            e.error_code = Some(code.clone());
            e.error_message = Some(reason.clone());
            e.ok = Some(false);
            e
        }
        JournalEvent::BatchIngested {
            accepted,
            rejected,
            duration_ms,
        } => {
            let mut e = LogEntry::new(EventType::BatchIngested, Severity::Info);
            e.accepted = count(*accepted);
            e.rejected = count(*rejected);
            e.duration_ms = Some(*duration_ms);
            e.ok = Some(*rejected == 0);
            e
        }
        JournalEvent::IngestRejected {
            vehicle_id,
            code,
            reason,
        } => {
            let mut e = LogEntry::new(EventType::IngestRejected, Severity::Warning);
            e.vehicle_id = Some(vehicle_id.clone());
            e.error_code = Some(code.clone());
            e.error_message = Some(reason.clone());
            e.ok = Some(false);
            e
        }
        JournalEvent::PositionsPruned { removed, cutoff } => {
            let mut e = LogEntry::new(EventType::PositionsPruned, Severity::Info);
            e.rejected = Some(*removed);
            e.details = Some(format!("cutoff={cutoff}"));
            e.ok = Some(true);
            e
        }
        JournalEvent::Error { code, message } => {
            let mut e = LogEntry::new(EventType::Error, Severity::Critical);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e.ok = Some(false);
            e
        }
        JournalEvent::Shutdown => return None,
    };
    Some(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path) -> JsonlConfig {
        JsonlConfig {
            path: dir.join("journal.jsonl"),
            fallback_path: None,
            max_size_bytes: 10 * 1024 * 1024,
            max_rotated_files: 3,
            fsync_interval_secs: 60,
        }
    }

    #[test]
    fn events_reach_the_file_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_journal(config(dir.path()), 64).unwrap();
        handle.send(JournalEvent::ServiceStarted {
            version: "0.1.0".to_string(),
            config_hash: "abc".to_string(),
        });
        handle.send(JournalEvent::UploadProcessed {
            driver_id: "D1".to_string(),
            file_name: "card.ddd".to_string(),
            source_file_id: "ff".to_string(),
            created: 3,
            skipped: 1,
            warnings: 0,
            duration_ms: 4,
        });
        handle.send(JournalEvent::IngestRejected {
            vehicle_id: "V9".to_string(),
            code: "FFX-5001".to_string(),
            reason: "unknown vehicle".to_string(),
        });
        handle.shutdown();
        join.join().unwrap();

        let contents = std::fs::read_to_string(dir.path().join("journal.jsonl")).unwrap();
        let events: Vec<String> = contents
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["event"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(
            events,
            vec!["service_started", "upload_processed", "ingest_rejected"]
        );
        assert!(contents.contains("FFX-5001"));
    }

    #[test]
    fn handles_can_be_cloned_across_threads() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_journal(config(dir.path()), 64).unwrap();
        let other = handle.clone();
        std::thread::spawn(move || {
            other.send(JournalEvent::BatchIngested {
                accepted: 10,
                rejected: 0,
                duration_ms: 1,
            });
        })
        .join()
        .unwrap();
        handle.shutdown();
        join.join().unwrap();

        let contents = std::fs::read_to_string(dir.path().join("journal.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[test]
    fn full_channel_counts_drops() {
        let (tx, rx) = bounded::<JournalEvent>(1);
        let handle = JournalHandle {
            tx,
            dropped_events: Arc::new(AtomicU64::new(0)),
        };
        for _ in 0..3 {
            handle.send(JournalEvent::Error {
                code: "FFX-3900".to_string(),
                message: "x".to_string(),
            });
        }
        assert_eq!(handle.dropped_events(), 2);
        drop(rx);
    }

    #[test]
    fn noop_handle_swallows_events() {
        let handle = JournalHandle::noop();
        handle.send(JournalEvent::Shutdown);
        handle.shutdown();
        assert_eq!(handle.dropped_events(), 0);
    }
}
