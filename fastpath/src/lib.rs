// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all, clippy::pedantic)]
#![forbid(unsafe_code)]

//! A userspace, kernel-bypass-style POSIX socket fast path.
//!
//! Application threads never touch protocol-engine state directly: they create a
//! [`descriptor::DescriptorState`] through the [`registry::Registry`], read/write its rings
//! (C4/C6), and block on its [`readiness::Wakeup`] (C7). The workers ([`registry::Worker`]) are
//! the only threads that drive the [`engine::Engine`] collaborator, draining [`rpc::RpcQueue`]
//! commands and running the data-plane pumps in [`dataplane`] on every [`tick::tick`]. [`fanout`]
//! broadcasts operations across a shadow listener's clone ring; [`path`] decides, per call,
//! whether the fast path runs at all.

pub mod dataplane;
pub mod descriptor;
pub mod engine;
pub mod errors;
pub mod fanout;
pub mod local_addr;
pub mod path;
pub mod pool;
pub mod readiness;
pub mod registry;
pub mod rpc;
pub mod tick;

use config::Config;
use engine::Engine;
use registry::{Registry, Worker};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// The whole fast path: process-wide configuration plus the fixed set of workers.
///
/// Mirrors the specification's "one-time-populated immutable record" discipline (§9): built once
/// at startup via [`Stack::new`] and never mutated again, aside from the one-shot
/// [`Stack::mark_ready`] flag [`path::select_global_path`] consults.
pub struct Stack<E: Engine> {
    /// Validated, process-wide configuration.
    pub config: Arc<Config>,
    /// The fixed worker set and fd→owner bookkeeping.
    pub registry: Registry<E>,
    ready: AtomicBool,
}

impl<E: Engine> Stack<E> {
    /// Build a stack over an already-constructed worker set. Not yet marked ready — call
    /// [`Stack::mark_ready`] once the workers' tick threads are running.
    #[must_use]
    pub fn new(config: Config, workers: Vec<Arc<Worker<E>>>) -> Self {
        Self {
            config: Arc::new(config),
            registry: Registry::new(workers),
            ready: AtomicBool::new(false),
        }
    }

    /// Mark process initialization complete, so [`path::select_global_path`] starts admitting
    /// calls onto the fast path.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Whether [`Stack::mark_ready`] has been called.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Protocol;
    use crate::errors::EngineError;
    use std::net::{IpAddr, SocketAddr};

    struct NoopEngine;
    impl Engine for NoopEngine {
        type Pcb = ();
        fn create(&mut self, _protocol: Protocol) -> Result<(), EngineError> {
            Ok(())
        }
        fn bind(&mut self, _pcb: &mut (), _addr: SocketAddr) -> Result<(), EngineError> {
            Ok(())
        }
        fn listen(&mut self, _pcb: &mut (), _backlog: u32) -> Result<(), EngineError> {
            Ok(())
        }
        fn accept(&mut self, _pcb: &mut ()) -> Option<()> {
            None
        }
        fn has_pending_connection(&self, _pcb: &()) -> bool {
            false
        }
        fn connect(&mut self, _pcb: &mut (), _addr: SocketAddr) -> Result<(), EngineError> {
            Ok(())
        }
        fn send_window(&self, _pcb: &()) -> usize {
            0
        }
        fn send(&mut self, _pcb: &mut (), _data: &[u8]) -> usize {
            0
        }
        fn recv_available(&self, _pcb: &()) -> usize {
            0
        }
        fn recv(&mut self, _pcb: &mut (), _max: usize, _peek: bool) -> Vec<u8> {
            Vec::new()
        }
        fn local_addr(&self, _pcb: &()) -> Option<SocketAddr> {
            None
        }
        fn close(&mut self, _pcb: ()) {}
    }

    #[test]
    fn fresh_stack_is_not_ready_until_marked() {
        let cfg = Config::builder()
            .host_addr(Some(IpAddr::from([127, 0, 0, 1])))
            .build()
            .expect("valid config");
        let workers = vec![Arc::new(Worker::new(0, NoopEngine, &cfg, 16))];
        let stack = Stack::new(cfg, workers);
        assert!(!stack.is_ready());
        stack.mark_ready();
        assert!(stack.is_ready());
        assert_eq!(stack.registry.worker_count(), 1);
    }
}
