//! Append-only JSONL journal file.
//!
//! Every entry is serialized to a complete line in memory and handed to the
//! file in one `write_all`, so a tailing reader never sees half a record.
//! When the journal file cannot be written the writer steps down a chain:
//! primary path, fallback path, stderr (`[FFX-JSONL]` prefix), then discard.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::core::errors::{FleetError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Journal event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ServiceStarted,
    UploadProcessed,
    UploadRejected,
    BatchIngested,
    IngestRejected,
    PositionsPruned,
    Error,
}

/// One journal line. Only `ts`, `event` and `severity` are always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 UTC, millisecond precision.
    pub ts: String,
    pub event: EventType,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file_id: Option<String>,
    /// Intervals created, or reports accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted: Option<u64>,
    /// Intervals skipped as duplicates, or reports rejected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    /// Entry stamped with the current UTC time.
    pub fn new(event: EventType, severity: Severity) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            event,
            severity,
            driver_id: None,
            vehicle_id: None,
            file_name: None,
            source_file_id: None,
            accepted: None,
            rejected: None,
            warnings: None,
            duration_ms: None,
            ok: None,
            error_code: None,
            error_message: None,
            details: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sink {
    Primary,
    Fallback,
    Stderr,
    Discard,
}

/// Journal file settings.
#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    /// Used when the primary path cannot be opened or written.
    pub fallback_path: Option<PathBuf>,
    /// Rotate before a write would grow the file past this size.
    pub max_size_bytes: u64,
    /// Rotated generations kept as `<path>.1` .. `<path>.N`.
    pub max_rotated_files: u32,
    pub fsync_interval_secs: u64,
}

impl JsonlConfig {
    /// Settings for the journal at `path` with the given limits.
    #[must_use]
    pub fn from_journal(path: PathBuf, journal: &crate::core::config::JournalConfig) -> Self {
        let fallback_path = Some(std::env::temp_dir().join("ffx-events.jsonl"));
        Self {
            path,
            fallback_path,
            max_size_bytes: journal.max_size_bytes,
            max_rotated_files: journal.max_rotated_files,
            fsync_interval_secs: journal.fsync_interval_secs,
        }
    }
}

/// JSONL writer with size-based rotation and the degradation chain above.
pub struct JsonlWriter {
    config: JsonlConfig,
    file: Option<BufWriter<File>>,
    sink: Sink,
    current_size: u64,
    last_sync: Instant,
}

impl JsonlWriter {
    /// Open the journal, stepping down the chain if the primary path fails.
    pub fn open(config: JsonlConfig) -> Self {
        let mut writer = Self {
            config,
            file: None,
            sink: Sink::Discard,
            current_size: 0,
            last_sync: Instant::now(),
        };
        match open_append(&writer.config.path) {
            Ok((file, size)) => writer.attach(file, size, Sink::Primary),
            Err(_) => writer.open_fallback(),
        }
        writer
    }

    pub fn write_entry(&mut self, entry: &LogEntry) {
        match serde_json::to_string(entry) {
            Ok(json) => self.write_line(&format!("{json}\n")),
            Err(e) => {
                let _ = writeln!(io::stderr(), "[FFX-JSONL] serialize error: {e}");
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
    }

    pub fn fsync(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
            let _ = file.get_ref().sync_data();
        }
        self.last_sync = Instant::now();
    }

    /// `normal`, `fallback`, `stderr` or `discard`.
    pub fn state(&self) -> &'static str {
        match self.sink {
            Sink::Primary => "normal",
            Sink::Fallback => "fallback",
            Sink::Stderr => "stderr",
            Sink::Discard => "discard",
        }
    }

    /// Reopen the primary path after a degradation, if it works again.
    pub fn try_recover(&mut self) {
        if self.sink == Sink::Primary {
            return;
        }
        if let Ok((file, size)) = open_append(&self.config.path) {
            self.flush();
            self.attach(file, size, Sink::Primary);
            let _ = writeln!(
                io::stderr(),
                "[FFX-JSONL] recovered to primary path: {}",
                self.config.path.display()
            );
        }
    }

    fn attach(&mut self, file: File, size: u64, sink: Sink) {
        self.file = Some(BufWriter::with_capacity(64 * 1024, file));
        self.current_size = size;
        self.sink = sink;
    }

    fn active_path(&self) -> Option<&Path> {
        match self.sink {
            Sink::Primary => Some(&self.config.path),
            Sink::Fallback => self.config.fallback_path.as_deref(),
            Sink::Stderr | Sink::Discard => None,
        }
    }

    fn write_line(&mut self, line: &str) {
        loop {
            match self.sink {
                Sink::Primary | Sink::Fallback => {
                    let len = line.len() as u64;
                    if self.current_size > 0 && self.current_size + len > self.config.max_size_bytes {
                        self.rotate();
                        continue;
                    }
                    let written = self
                        .file
                        .as_mut()
                        .is_some_and(|file| file.write_all(line.as_bytes()).is_ok());
                    if written {
                        self.current_size += len;
                        if self.last_sync.elapsed().as_secs() >= self.config.fsync_interval_secs {
                            self.fsync();
                        }
                        return;
                    }
                    self.step_down();
                }
                Sink::Stderr => {
                    let _ = write!(io::stderr(), "[FFX-JSONL] {line}");
                    return;
                }
                Sink::Discard => return,
            }
        }
    }

    fn open_fallback(&mut self) {
        let Some(fallback) = self.config.fallback_path.clone() else {
            self.sink = Sink::Stderr;
            let _ = writeln!(
                io::stderr(),
                "[FFX-JSONL] journal path unusable and no fallback configured, using stderr"
            );
            return;
        };
        if let Ok((file, size)) = open_append(&fallback) {
            let _ = writeln!(
                io::stderr(),
                "[FFX-JSONL] journal path unusable, using fallback {}",
                fallback.display()
            );
            self.attach(file, size, Sink::Fallback);
        } else {
            self.sink = Sink::Stderr;
            let _ = writeln!(
                io::stderr(),
                "[FFX-JSONL] journal and fallback paths unusable, using stderr"
            );
        }
    }

    fn step_down(&mut self) {
        self.file = None;
        match self.sink {
            Sink::Primary => self.open_fallback(),
            Sink::Fallback => {
                self.sink = Sink::Stderr;
                let _ = writeln!(io::stderr(), "[FFX-JSONL] fallback write failed, using stderr");
            }
            Sink::Stderr => self.sink = Sink::Discard,
            Sink::Discard => {}
        }
    }

    /// `<path>.N-1 -> <path>.N`, ..., `<path> -> <path>.1`, then a fresh file.
    fn rotate(&mut self) {
        self.flush();
        self.file = None;
        let Some(base) = self.active_path().map(Path::to_path_buf) else {
            return;
        };

        let keep = self.config.max_rotated_files.max(1);
        let _ = fs::remove_file(rotated_name(&base, keep));
        for generation in (1..keep).rev() {
            let _ = fs::rename(rotated_name(&base, generation), rotated_name(&base, generation + 1));
        }
        let _ = fs::rename(&base, rotated_name(&base, 1));

        match open_append(&base) {
            Ok((file, _)) => {
                let sink = self.sink;
                self.attach(file, 0, sink);
            }
            Err(_) => self.step_down(),
        }
    }
}

// ──────────────────── helpers ────────────────────

/// Open or create `path` for appending, creating parent directories.
/// Returns the file and its current size.
fn open_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| FleetError::io(parent, source))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| FleetError::io(path, source))?;
    let size = file.metadata().map_or(0, |meta| meta.len());
    Ok((file, size))
}

/// `events.jsonl` -> `events.jsonl.3`.
fn rotated_name(base: &Path, generation: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}
