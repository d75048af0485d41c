// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The path selector (C1): decides, per process and per descriptor, whether a call is routed to
//! the kernel or the fast path.

use crate::descriptor::{DescriptorState, Topology};
use config::Config;
use std::sync::atomic::{AtomicBool, Ordering};

/// Which execution path a call should take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Path {
    /// Route through an ordinary kernel socket.
    Kernel,
    /// Route through the userspace protocol engine.
    Fast,
}

/// Address family / socket type combinations this crate's fast path can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// `AF_INET`/`AF_UNSPEC`, `SOCK_STREAM`.
    Tcp,
    /// `AF_INET`/`AF_UNSPEC`, `SOCK_DGRAM`.
    Udp,
    /// Any other address family or socket type.
    Unsupported,
}

/// Whether a descriptor has been tagged host-only (e.g. by the local-connect routing rule, §6).
#[derive(Default)]
pub struct HostTag(AtomicBool);

impl HostTag {
    /// A descriptor not tagged host-only.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Mark this descriptor host-only.
    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether this descriptor has been tagged host-only.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Process-wide predicate (§4.1): is the fast path available *at all* for a call of this kind?
///
/// Returns `Kernel` before the stack has finished initializing, or when the socket kind itself is
/// unsupported (not `AF_INET`/`AF_UNSPEC`, or datagram traffic with `udp_enable` turned off).
#[must_use]
pub fn select_global_path(initialized: bool, kind: SocketKind, config: &Config) -> Path {
    if !initialized {
        return Path::Kernel;
    }
    match kind {
        SocketKind::Unsupported => Path::Kernel,
        SocketKind::Udp if !config.udp_enable => Path::Kernel,
        SocketKind::Tcp | SocketKind::Udp => Path::Fast,
    }
}

/// Per-descriptor predicate (§4.1): given a descriptor that already passed
/// [`select_global_path`], does *this* descriptor still route to the fast path?
///
/// Returns `Kernel` if the descriptor has no fast-path state, or if it has been tagged host-only
/// (the local-connect routing rule, §6).
#[must_use]
pub fn select_fd_path<P>(state: Option<&DescriptorState<P>>) -> Path {
    match state {
        Some(state) if !state.host_tag.is_set() => Path::Fast,
        _ => Path::Kernel,
    }
}

/// Whether a descriptor is a shadow-ring clone, relevant to fan-out dispatch (C8) deciding
/// whether a call needs to broadcast or can run against a single worker.
#[must_use]
pub fn is_shadow<P>(state: &DescriptorState<P>) -> bool {
    state.topology() == Topology::Shadow
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Protocol;
    use crate::readiness::Wakeup;
    use std::net::IpAddr;
    use std::sync::Arc;

    fn config() -> Config {
        Config::builder()
            .host_addr(Some(IpAddr::from([127, 0, 0, 1])))
            .build()
            .expect("valid config")
    }

    #[test]
    fn uninitialized_process_always_routes_kernel() {
        assert_eq!(
            select_global_path(false, SocketKind::Tcp, &config()),
            Path::Kernel
        );
    }

    #[test]
    fn unsupported_kind_routes_kernel() {
        assert_eq!(
            select_global_path(true, SocketKind::Unsupported, &config()),
            Path::Kernel
        );
    }

    #[test]
    fn udp_disabled_routes_kernel() {
        let cfg = Config::builder()
            .host_addr(Some(IpAddr::from([127, 0, 0, 1])))
            .udp_enable(false)
            .build()
            .expect("valid config");
        assert_eq!(select_global_path(true, SocketKind::Udp, &cfg), Path::Kernel);
        assert_eq!(select_global_path(true, SocketKind::Tcp, &cfg), Path::Fast);
    }

    #[test]
    fn missing_descriptor_state_routes_kernel() {
        assert_eq!(select_fd_path::<()>(None), Path::Kernel);
    }

    #[test]
    fn host_tagged_descriptor_routes_kernel_even_with_state() {
        let state = DescriptorState::<()>::new(0, Protocol::Tcp, 4, 4, Arc::new(Wakeup::new_poll()));
        state.host_tag.set();
        assert_eq!(select_fd_path(Some(&state)), Path::Kernel);
    }

    #[test]
    fn fast_path_state_without_host_tag_routes_fast() {
        let state = DescriptorState::<()>::new(0, Protocol::Tcp, 4, 4, Arc::new(Wakeup::new_poll()));
        assert_eq!(select_fd_path(Some(&state)), Path::Fast);
    }
}
