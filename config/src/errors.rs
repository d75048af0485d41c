// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Type for configuration / validation failures.
//!
//! Any result returned by the validation or configuration builder methods in this crate is a
//! `ConfigError`.

use thiserror::Error;

/// The reasons a [`crate::Config`] may be rejected.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("worker_count must be at least 1")]
    ZeroWorkers,
    #[error("{field} must be a power of two, got {value}")]
    RingCapacityNotPowerOfTwo { field: &'static str, value: u32 },
    #[error("segment_size must be nonzero")]
    ZeroSegmentSize,
    #[error("host_addr is required when tcp_reuse_ipport is enabled")]
    MissingHostAddr,
    #[error("failed to parse config file: {0}")]
    Parse(String),
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::sync::Arc<std::io::Error>,
    },
}

/// Result-like type for configuration construction.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Render a [`ConfigResult`] for logging, mirroring how validation failures are reported
/// elsewhere in this workspace.
#[must_use]
pub fn stringify<T>(result: &ConfigResult<T>) -> String {
    match result {
        Ok(_) => "Ok".to_string(),
        Err(e) => format!("FAILED: {e}"),
    }
}
