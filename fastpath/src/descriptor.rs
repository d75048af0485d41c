// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-socket fast-path state (C4) and the clone-chain topology used by shadow descriptors.

use crate::engine::Protocol;
use crate::path::HostTag;
use crate::readiness::Wakeup;
use concurrency::sync::{Arc, Mutex};
use crossbeam_channel::{Receiver, Sender, bounded};
use id::Id;
use net::buffer::PoolBuffer;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32};

/// Marker type tagging [`Id`] values that identify a [`DescriptorState`].
///
/// A raw OS file descriptor (`Fd`) is reused by the kernel once closed; `DescriptorId` is this
/// crate's stable handle into the descriptor arena so that a late RPC result or a straggling
/// clone-chain walk can never be confused with a *different* socket that was later opened on the
/// same numeric fd.
pub struct DescriptorTag;

/// Stable identity of one fast-path descriptor, independent of its (reusable) numeric fd.
pub type DescriptorId = Id<DescriptorTag>;

/// A raw POSIX file descriptor, as seen by the application.
pub type Fd = i32;

/// Whether a descriptor is a single fast-path instance or one clone of a shadow ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// Ordinary fast-path descriptor, owned by exactly one worker.
    Fast,
    /// One clone in a cyclic ring of per-worker shadow descriptors (listeners fanned out).
    Shadow,
}

/// Per-socket fast-path state.
///
/// Fields are partitioned by writer per §9 of the specification: the owning worker writes the
/// receive-ring producer side, `recv_residue`, and the recv-list membership flag; application
/// threads write the send-ring producer side and the event mask. `send_ring`/`recv_ring` are
/// themselves bounded SPSC channels, so no field here needs a lock on the data path — the
/// `Mutex`-guarded fields (residues, next-clone link) are cold, off-hot-path state.
pub struct DescriptorState<P> {
    /// Stable identity, independent of the (reusable) numeric fd.
    pub id: DescriptorId,
    /// The worker that owns this descriptor's protocol-engine state (I1).
    pub owner: crate::registry::WorkerId,
    /// Single vs. shadow-ring membership. Starts `Fast`; promoted to `Shadow` by bind/listen
    /// fan-out (§9: descriptors are created fast and only later found to need a clone ring).
    topology: Mutex<Topology>,
    /// TCP or UDP.
    pub protocol: Protocol,
    /// The engine-native pcb, if the descriptor has reached a state that has one.
    pub pcb: Mutex<Option<P>>,
    send_tx: Sender<PoolBuffer>,
    send_rx: Receiver<PoolBuffer>,
    recv_tx: Sender<PoolBuffer>,
    recv_rx: Receiver<PoolBuffer>,
    /// At most one partially consumed inbound buffer (I3).
    pub recv_residue: Mutex<Option<PoolBuffer>>,
    /// At most one outbound buffer the engine could not yet accept (I3).
    pub send_residue: Mutex<Option<PoolBuffer>>,
    /// Readiness object bound to this descriptor.
    pub wakeup: Arc<Wakeup>,
    /// Set while this descriptor is linked into its worker's recv-list (I4).
    pub recv_listed: AtomicBool,
    /// Next clone in the shadow ring, or this descriptor's own id if not shadowed.
    pub next_clone: Mutex<DescriptorId>,
    /// Set on the one clone elected master by `min-conn-stack` (tcp_reuse_ipport).
    pub is_master: AtomicBool,
    /// Address this descriptor (or its clone siblings) is bound to.
    pub local_addr: Mutex<Option<SocketAddr>>,
    /// Raised once closed; further RPCs on this id are rejected (I6).
    pub closed: AtomicBool,
    /// Bitmask of events a reader is interested in / that are currently asserted.
    pub event_mask: AtomicU32,
    /// Set when `connect`'s destination-is-local rule routes this descriptor to the kernel path
    /// instead (§6, §4.7); consulted by [`crate::path::select_fd_path`].
    pub host_tag: HostTag,
}

impl<P> DescriptorState<P> {
    /// Build a fresh, un-shadowed descriptor state owned by `owner`.
    #[must_use]
    pub fn new(
        owner: crate::registry::WorkerId,
        protocol: Protocol,
        send_ring_capacity: usize,
        recv_ring_capacity: usize,
        wakeup: Arc<Wakeup>,
    ) -> Self {
        let id = DescriptorId::new();
        let (send_tx, send_rx) = bounded(send_ring_capacity);
        let (recv_tx, recv_rx) = bounded(recv_ring_capacity);
        Self {
            id,
            owner,
            topology: Mutex::new(Topology::Fast),
            protocol,
            pcb: Mutex::new(None),
            send_tx,
            send_rx,
            recv_tx,
            recv_rx,
            recv_residue: Mutex::new(None),
            send_residue: Mutex::new(None),
            wakeup,
            recv_listed: AtomicBool::new(false),
            next_clone: Mutex::new(id),
            is_master: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            closed: AtomicBool::new(false),
            event_mask: AtomicU32::new(0),
            host_tag: HostTag::new(),
        }
    }

    /// Producer side of the send ring (application → worker).
    #[must_use]
    pub fn send_producer(&self) -> &Sender<PoolBuffer> {
        &self.send_tx
    }

    /// Consumer side of the send ring (worker's `stack_send` pump).
    #[must_use]
    pub fn send_consumer(&self) -> &Receiver<PoolBuffer> {
        &self.send_rx
    }

    /// Producer side of the receive ring (worker tick).
    #[must_use]
    pub fn recv_producer(&self) -> &Sender<PoolBuffer> {
        &self.recv_tx
    }

    /// Consumer side of the receive ring (application read).
    #[must_use]
    pub fn recv_consumer(&self) -> &Receiver<PoolBuffer> {
        &self.recv_rx
    }

    /// Whether the receive ring has no queued buffers.
    #[must_use]
    pub fn recv_ring_empty(&self) -> bool {
        self.recv_rx.is_empty()
    }

    /// Free (unused) capacity in the receive ring.
    #[must_use]
    pub fn recv_ring_free(&self) -> usize {
        self.recv_rx.capacity().unwrap_or(0) - self.recv_rx.len()
    }

    /// Current clone-ring membership.
    #[must_use]
    pub fn topology(&self) -> Topology {
        *self.topology.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Promote (or demote) this descriptor's clone-ring membership.
    pub fn set_topology(&self, topology: Topology) {
        *self.topology.lock().unwrap_or_else(|e| e.into_inner()) = topology;
    }
}

/// Given the first clone in a shadow ring, walk `next_clone` links until the chain cycles back,
/// invoking `visit` on every clone (including the first). Terminates after at most one lap using
/// the starting id as a sentinel (§9: "first-node sentinel").
pub fn walk_clone_chain<P>(
    start: DescriptorId,
    lookup: impl Fn(DescriptorId) -> Option<Arc<DescriptorState<P>>>,
    mut visit: impl FnMut(&DescriptorState<P>),
) {
    let mut current = start;
    loop {
        let Some(state) = lookup(current) else {
            return;
        };
        visit(&state);
        let next = *state.next_clone.lock().unwrap_or_else(|e| e.into_inner());
        if next == start {
            return;
        }
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readiness::Wakeup;

    fn fresh() -> DescriptorState<()> {
        DescriptorState::new(0, Protocol::Tcp, 4, 4, Arc::new(Wakeup::new_poll()))
    }

    #[test]
    fn new_descriptor_is_its_own_clone_chain() {
        let d = fresh();
        assert_eq!(*d.next_clone.lock().unwrap(), d.id);
    }

    #[test]
    fn send_ring_is_bounded() {
        let d = fresh();
        assert_eq!(d.send_producer().capacity(), Some(4));
    }

    #[test]
    fn clone_chain_of_one_visits_once() {
        let d = Arc::new(fresh());
        let id = d.id;
        let states = [(id, d.clone())];
        let mut visits = 0;
        walk_clone_chain(
            id,
            |i| states.iter().find(|(k, _)| *k == i).map(|(_, v)| v.clone()),
            |_| visits += 1,
        );
        assert_eq!(visits, 1);
    }
}
