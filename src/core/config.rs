//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{FleetError, Result};
use crate::tacho::activity::DriverSlot;

/// Full fleet_fusion configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub telemetry: TelemetryConfig,
    pub upload: UploadConfig,
    pub storage: StorageConfig,
    pub journal: JournalConfig,
    pub paths: PathsConfig,
}

/// Position ingestion and presence derivation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// A vehicle is online while `now - last_seen <= online_threshold_secs`.
    pub online_threshold_secs: u64,
    /// Reports stamped further than this into the future are rejected.
    pub future_tolerance_secs: u64,
    /// Elements past this index in one batch fail with `BatchLimitExceeded`.
    pub max_batch: usize,
    /// Worker threads used to fan a batch out across vehicles.
    pub parallelism: usize,
    /// Reject reports for vehicles the directory does not know.
    pub require_known_vehicle: bool,
}

/// Tachograph upload handling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UploadConfig {
    pub max_file_size_bytes: u64,
    /// How long an upload waits for another upload of the same driver.
    pub lock_timeout_ms: u64,
    /// Card slot decoded from vehicle-unit files when the caller does not say.
    pub default_slot: DriverSlot,
}

/// Storage backend tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub busy_timeout_ms: u64,
    pub position_retention_days: u32,
    /// Pooled SQLite connections. Ingest workers beyond this count queue for one.
    pub connections: usize,
}

/// JSONL event journal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JournalConfig {
    pub enabled: bool,
    pub max_size_bytes: u64,
    pub max_rotated_files: u32,
    pub fsync_interval_secs: u64,
}

/// Filesystem paths used by ffx.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub sqlite_db: PathBuf,
    pub jsonl_log: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            online_threshold_secs: 300,
            future_tolerance_secs: 60,
            max_batch: 1_000,
            parallelism: std::thread::available_parallelism()
                .map_or(2, |n| n.get().saturating_div(2).max(1)),
            require_known_vehicle: true,
        }
    }
}

impl TelemetryConfig {
    #[must_use]
    pub fn online_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.online_threshold_secs).unwrap_or(i64::MAX))
    }

    #[must_use]
    pub fn future_tolerance(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.future_tolerance_secs).unwrap_or(i64::MAX))
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: 10 * 1024 * 1024,
            lock_timeout_ms: 5_000,
            default_slot: DriverSlot::Primary,
        }
    }
}

impl UploadConfig {
    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            position_retention_days: 90,
            connections: 4,
        }
    }
}

impl StorageConfig {
    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_bytes: 50 * 1024 * 1024,
            max_rotated_files: 5,
            fsync_interval_secs: 10,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[FFX-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir.join(".config").join("ffx").join("config.toml");
        let data = home_dir.join(".local").join("share").join("ffx");
        Self {
            config_file: cfg,
            sqlite_db: data.join("fleet.sqlite3"),
            jsonl_log: data.join("events.jsonl"),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| FleetError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(FleetError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for the journal.
    ///
    /// FNV-1a over the JSON form, stable across processes and Rust releases.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| FleetError::Serialization {
            context: "toml",
            details: e.to_string(),
        })
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // telemetry
        if let Some(raw) = lookup("FFX_TELEMETRY_ONLINE_THRESHOLD_SECS") {
            self.telemetry.online_threshold_secs =
                parse_env("FFX_TELEMETRY_ONLINE_THRESHOLD_SECS", &raw)?;
        }
        if let Some(raw) = lookup("FFX_TELEMETRY_FUTURE_TOLERANCE_SECS") {
            self.telemetry.future_tolerance_secs =
                parse_env("FFX_TELEMETRY_FUTURE_TOLERANCE_SECS", &raw)?;
        }
        if let Some(raw) = lookup("FFX_TELEMETRY_MAX_BATCH") {
            self.telemetry.max_batch = parse_env("FFX_TELEMETRY_MAX_BATCH", &raw)?;
        }
        if let Some(raw) = lookup("FFX_TELEMETRY_PARALLELISM") {
            self.telemetry.parallelism = parse_env("FFX_TELEMETRY_PARALLELISM", &raw)?;
        }
        if let Some(raw) = lookup("FFX_TELEMETRY_REQUIRE_KNOWN_VEHICLE") {
            self.telemetry.require_known_vehicle =
                parse_env("FFX_TELEMETRY_REQUIRE_KNOWN_VEHICLE", &raw)?;
        }

        // upload
        if let Some(raw) = lookup("FFX_UPLOAD_MAX_FILE_SIZE_BYTES") {
            self.upload.max_file_size_bytes = parse_env("FFX_UPLOAD_MAX_FILE_SIZE_BYTES", &raw)?;
        }
        if let Some(raw) = lookup("FFX_UPLOAD_LOCK_TIMEOUT_MS") {
            self.upload.lock_timeout_ms = parse_env("FFX_UPLOAD_LOCK_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("FFX_UPLOAD_DEFAULT_SLOT") {
            self.upload.default_slot = raw.parse().map_err(|details| FleetError::ConfigParse {
                context: "env",
                details: format!("FFX_UPLOAD_DEFAULT_SLOT={raw:?}: {details}"),
            })?;
        }

        // storage
        if let Some(raw) = lookup("FFX_STORAGE_BUSY_TIMEOUT_MS") {
            self.storage.busy_timeout_ms = parse_env("FFX_STORAGE_BUSY_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("FFX_STORAGE_POSITION_RETENTION_DAYS") {
            self.storage.position_retention_days =
                parse_env("FFX_STORAGE_POSITION_RETENTION_DAYS", &raw)?;
        }
        if let Some(raw) = lookup("FFX_STORAGE_CONNECTIONS") {
            self.storage.connections = parse_env("FFX_STORAGE_CONNECTIONS", &raw)?;
        }

        // journal
        if let Some(raw) = lookup("FFX_JOURNAL_ENABLED") {
            self.journal.enabled = parse_env("FFX_JOURNAL_ENABLED", &raw)?;
        }

        // paths
        if let Some(raw) = lookup("FFX_SQLITE_DB") {
            self.paths.sqlite_db = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("FFX_JSONL_LOG") {
            self.paths.jsonl_log = PathBuf::from(raw);
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.telemetry.online_threshold_secs == 0 {
            return Err(FleetError::InvalidConfig {
                details: "telemetry.online_threshold_secs must be > 0".to_string(),
            });
        }
        if self.telemetry.parallelism == 0 {
            return Err(FleetError::InvalidConfig {
                details: "telemetry.parallelism must be >= 1".to_string(),
            });
        }
        if self.telemetry.max_batch == 0 {
            return Err(FleetError::InvalidConfig {
                details: "telemetry.max_batch must be >= 1".to_string(),
            });
        }
        if self.upload.max_file_size_bytes == 0 {
            return Err(FleetError::InvalidConfig {
                details: "upload.max_file_size_bytes must be > 0".to_string(),
            });
        }
        if self.upload.lock_timeout_ms == 0 || self.storage.busy_timeout_ms == 0 {
            return Err(FleetError::InvalidConfig {
                details: "upload.lock_timeout_ms and storage.busy_timeout_ms must be > 0"
                    .to_string(),
            });
        }
        if self.storage.position_retention_days == 0 {
            return Err(FleetError::InvalidConfig {
                details: "storage.position_retention_days must be >= 1".to_string(),
            });
        }
        if self.storage.connections == 0 {
            return Err(FleetError::InvalidConfig {
                details: "storage.connections must be >= 1".to_string(),
            });
        }
        if self.journal.enabled && self.journal.max_rotated_files == 0 {
            return Err(FleetError::InvalidConfig {
                details: "journal.max_rotated_files must be >= 1 when the journal is enabled"
                    .to_string(),
            });
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|error| FleetError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}
