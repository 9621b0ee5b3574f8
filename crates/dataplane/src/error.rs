//! Dataplane errors

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while opening or writing dataplane maps.
#[derive(Debug, Error)]
pub enum DataplaneError {
    /// A pinned map could not be opened; the process must not serve without it
    #[error("Failed to load {map} map from {path}: {source}")]
    MapLoad {
        /// Map name
        map: &'static str,
        /// Pin path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: aya::maps::MapError,
    },

    /// A map operation failed
    #[error("{map} map operation failed: {source}")]
    Backend {
        /// Map name
        map: &'static str,
        /// Underlying error
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Bytes read from a map do not decode into a record
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Malformed MAC address
    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),
}
