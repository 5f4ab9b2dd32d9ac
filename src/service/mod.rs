//! Entry points that compose decoding, reconciliation, ingestion and fusion.

#[cfg(feature = "sqlite")]
pub mod fleet;
pub mod upload;
