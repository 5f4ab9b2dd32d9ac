//! FFX-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, FleetError>;

/// Top-level error type for fleet_fusion.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("[FFX-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[FFX-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[FFX-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[FFX-2001] invalid input: {details}")]
    InvalidInput { details: String },

    #[error("[FFX-2002] {entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("[FFX-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[FFX-2102] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[FFX-2103] storage failure in {context}: {details}")]
    Storage {
        context: &'static str,
        details: String,
    },

    #[error("[FFX-3001] timed out after {waited_ms}ms waiting for lock on {key}")]
    LockTimeout { key: String, waited_ms: u64 },

    #[error("[FFX-3002] storage call timed out after {waited_ms}ms in {context}")]
    StorageTimeout {
        context: &'static str,
        waited_ms: u64,
    },

    #[error("[FFX-3003] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[FFX-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl FleetError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "FFX-1001",
            Self::MissingConfig { .. } => "FFX-1002",
            Self::ConfigParse { .. } => "FFX-1003",
            Self::InvalidInput { .. } => "FFX-2001",
            Self::NotFound { .. } => "FFX-2002",
            Self::Serialization { .. } => "FFX-2101",
            Self::Sql { .. } => "FFX-2102",
            Self::Storage { .. } => "FFX-2103",
            Self::LockTimeout { .. } => "FFX-3001",
            Self::StorageTimeout { .. } => "FFX-3002",
            Self::Io { .. } => "FFX-3003",
            Self::Runtime { .. } => "FFX-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Sql { .. }
                | Self::Storage { .. }
                | Self::LockTimeout { .. }
                | Self::StorageTimeout { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for FleetError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for FleetError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<FleetError> {
        vec![
            FleetError::InvalidConfig {
                details: String::new(),
            },
            FleetError::MissingConfig {
                path: PathBuf::new(),
            },
            FleetError::ConfigParse {
                context: "",
                details: String::new(),
            },
            FleetError::InvalidInput {
                details: String::new(),
            },
            FleetError::NotFound {
                entity: "driver",
                id: String::new(),
            },
            FleetError::Serialization {
                context: "",
                details: String::new(),
            },
            FleetError::Sql {
                context: "",
                details: String::new(),
            },
            FleetError::Storage {
                context: "",
                details: String::new(),
            },
            FleetError::LockTimeout {
                key: String::new(),
                waited_ms: 0,
            },
            FleetError::StorageTimeout {
                context: "",
                waited_ms: 0,
            },
            FleetError::Io {
                path: PathBuf::new(),
                source: std::io::Error::other("test"),
            },
            FleetError::Runtime {
                details: String::new(),
            },
        ]
    }

    #[test]
    fn error_codes_are_unique() {
        let errors = all_variants();
        let codes: Vec<&str> = errors.iter().map(FleetError::code).collect();
        let unique: std::collections::HashSet<&&str> = codes.iter().collect();
        assert_eq!(
            codes.len(),
            unique.len(),
            "error codes must be unique: {codes:?}"
        );
    }

    #[test]
    fn display_includes_code() {
        for err in all_variants() {
            let msg = err.to_string();
            assert!(
                msg.contains(err.code()),
                "display should contain error code: {msg}"
            );
        }
    }

    #[test]
    fn retryable_errors_are_correct() {
        assert!(
            FleetError::LockTimeout {
                key: "driver:D1".to_string(),
                waited_ms: 5
            }
            .is_retryable()
        );
        assert!(
            FleetError::Sql {
                context: "",
                details: String::new()
            }
            .is_retryable()
        );
        assert!(
            !FleetError::InvalidConfig {
                details: String::new()
            }
            .is_retryable()
        );
        assert!(
            !FleetError::NotFound {
                entity: "vehicle",
                id: "V1".to_string()
            }
            .is_retryable()
        );
    }

    #[test]
    fn io_convenience_constructor() {
        let err = FleetError::io(
            "/tmp/fleet.sqlite3",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.code(), "FFX-3003");
        assert!(err.to_string().contains("/tmp/fleet.sqlite3"));
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn from_rusqlite_error() {
        let sql_err =
            rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(1), Some("test".to_string()));
        let err: FleetError = sql_err.into();
        assert_eq!(err.code(), "FFX-2102");
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: FleetError = json_err.into();
        assert_eq!(err.code(), "FFX-2101");
    }

    #[test]
    fn from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        let err: FleetError = toml_err.into();
        assert_eq!(err.code(), "FFX-1003");
    }
}
