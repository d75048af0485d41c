// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Process-wide, validated configuration for the fast-path stack.
//!
//! A [`Config`] is built once (via [`ConfigBuilder`] or [`Config::from_yaml`]) and wrapped in an
//! `Arc` by its caller; nothing in this crate mutates a `Config` after construction.

mod errors;

pub use errors::{ConfigError, ConfigResult, stringify};

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use tracing::debug;

/// Validated, immutable process configuration.
///
/// Field names match the switches named in the specification this stack implements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[builder(build_fn(validate = "Self::validate", error = "ConfigError"))]
#[builder(setter(into))]
pub struct Config {
    /// Run the protocol engine inline on the calling thread instead of dispatching RPCs to a
    /// separate worker. Used for co-located single-threaded deployments.
    #[builder(default = "false")]
    #[serde(default)]
    pub stack_mode_rtc: bool,

    /// Fan listening sockets out across every worker (shadow/clone descriptors).
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub listen_shadow: bool,

    /// When set, `listen` never fans out, even if `listen_shadow` is enabled.
    #[builder(default = "false")]
    #[serde(default)]
    pub tuple_filter: bool,

    /// Whether UDP sockets are eligible for the fast path at all.
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub udp_enable: bool,

    /// Enable minimum-connection-count master-clone election for shadow listeners
    /// (`SO_REUSEPORT`-style load balancing).
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub tcp_reuse_ipport: bool,

    /// The local interface address bound to the fast path, used by the destination-is-local
    /// predicate consulted on `connect`.
    #[builder(default)]
    #[serde(default)]
    pub host_addr: Option<IpAddr>,

    /// Number of fast-path workers.
    #[builder(default = "4")]
    #[serde(default = "default_worker_count")]
    pub worker_count: u16,

    /// Capacity, in buffers, of each descriptor's send ring. Must be a power of two.
    #[builder(default = "256")]
    #[serde(default = "default_ring_capacity")]
    pub send_ring_capacity: u32,

    /// Capacity, in buffers, of each descriptor's receive ring. Must be a power of two.
    #[builder(default = "256")]
    #[serde(default = "default_ring_capacity")]
    pub recv_ring_capacity: u32,

    /// Capacity, in buffers, of each worker's idle (pre-allocated transmit) ring. Must be a power
    /// of two.
    #[builder(default = "1024")]
    #[serde(default = "default_idle_capacity")]
    pub idle_ring_capacity: u32,

    /// Maximum segment size, in bytes, of a single packet buffer.
    #[builder(default = "1460")]
    #[serde(default = "default_segment_size")]
    pub segment_size: u16,
}

const fn default_true() -> bool {
    true
}

const fn default_worker_count() -> u16 {
    4
}

const fn default_ring_capacity() -> u32 {
    256
}

const fn default_idle_capacity() -> u32 {
    1024
}

const fn default_segment_size() -> u16 {
    1460
}

impl ConfigBuilder {
    fn validate(&self) -> ConfigResult<()> {
        if self.worker_count.unwrap_or(default_worker_count()) == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        for (field, value) in [
            (
                "send_ring_capacity",
                self.send_ring_capacity.unwrap_or(default_ring_capacity()),
            ),
            (
                "recv_ring_capacity",
                self.recv_ring_capacity.unwrap_or(default_ring_capacity()),
            ),
            (
                "idle_ring_capacity",
                self.idle_ring_capacity.unwrap_or(default_idle_capacity()),
            ),
        ] {
            if !value.is_power_of_two() {
                return Err(ConfigError::RingCapacityNotPowerOfTwo { field, value });
            }
        }
        if self.segment_size.unwrap_or(default_segment_size()) == 0 {
            return Err(ConfigError::ZeroSegmentSize);
        }
        if self.tcp_reuse_ipport.unwrap_or(true) && self.host_addr.flatten().is_none() {
            return Err(ConfigError::MissingHostAddr);
        }
        Ok(())
    }
}

impl Config {
    /// Start building a `Config`.
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load and validate a `Config` from a YAML document.
    pub fn from_yaml(yaml: &str) -> ConfigResult<Self> {
        serde_yaml_ng::from_str::<ConfigBuilderDocument>(yaml)
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .into_config()
    }

    /// Load and validate a `Config` from a YAML file on disk.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: std::sync::Arc::new(e),
        })?;
        debug!(path = %path.display(), "loaded config file");
        Self::from_yaml(&contents)
    }

    /// The idle-ring low-water replenishment threshold: one quarter of capacity.
    #[must_use]
    pub const fn idle_watermark(&self) -> u32 {
        self.idle_ring_capacity >> 2
    }
}

/// Deserialization target for a config file; every field is optional, falling back to
/// [`Config`]'s own defaults, then validated the same way [`ConfigBuilder`] validates.
#[derive(Debug, Default, Deserialize)]
struct ConfigBuilderDocument {
    #[serde(default)]
    stack_mode_rtc: bool,
    #[serde(default = "default_true")]
    listen_shadow: bool,
    #[serde(default)]
    tuple_filter: bool,
    #[serde(default = "default_true")]
    udp_enable: bool,
    #[serde(default = "default_true")]
    tcp_reuse_ipport: bool,
    #[serde(default)]
    host_addr: Option<IpAddr>,
    #[serde(default = "default_worker_count")]
    worker_count: u16,
    #[serde(default = "default_ring_capacity")]
    send_ring_capacity: u32,
    #[serde(default = "default_ring_capacity")]
    recv_ring_capacity: u32,
    #[serde(default = "default_idle_capacity")]
    idle_ring_capacity: u32,
    #[serde(default = "default_segment_size")]
    segment_size: u16,
}

impl ConfigBuilderDocument {
    fn into_config(self) -> ConfigResult<Config> {
        Config::builder()
            .stack_mode_rtc(self.stack_mode_rtc)
            .listen_shadow(self.listen_shadow)
            .tuple_filter(self.tuple_filter)
            .udp_enable(self.udp_enable)
            .tcp_reuse_ipport(self.tcp_reuse_ipport)
            .host_addr(self.host_addr)
            .worker_count(self.worker_count)
            .send_ring_capacity(self.send_ring_capacity)
            .recv_ring_capacity(self.recv_ring_capacity)
            .idle_ring_capacity(self.idle_ring_capacity)
            .segment_size(self.segment_size)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_builder_requires_host_addr_when_reuseport_on() {
        let err = Config::builder().build().unwrap_err();
        assert_eq!(err, ConfigError::MissingHostAddr);
    }

    #[test]
    fn builder_with_host_addr_succeeds() {
        let cfg = Config::builder()
            .host_addr(Some(IpAddr::from([127, 0, 0, 1])))
            .build()
            .expect("valid config");
        assert_eq!(cfg.worker_count, 4);
        assert_eq!(cfg.idle_watermark(), 256);
    }

    #[test]
    fn rejects_non_power_of_two_ring() {
        let err = Config::builder()
            .host_addr(Some(IpAddr::from([127, 0, 0, 1])))
            .send_ring_capacity(100_u32)
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::RingCapacityNotPowerOfTwo {
                field: "send_ring_capacity",
                value: 100,
            }
        );
    }

    #[test]
    fn rejects_zero_workers() {
        let err = Config::builder()
            .host_addr(Some(IpAddr::from([127, 0, 0, 1])))
            .worker_count(0_u16)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::ZeroWorkers);
    }

    #[test]
    fn from_yaml_parses_overrides() {
        let yaml = "worker_count: 8\nhost_addr: \"10.0.0.1\"\n";
        let cfg = Config::from_yaml(yaml).expect("valid yaml");
        assert_eq!(cfg.worker_count, 8);
        assert_eq!(cfg.host_addr, Some(IpAddr::from([10, 0, 0, 1])));
    }
}
