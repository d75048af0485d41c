// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The worker registry (C2): enumerates workers and maps descriptors to the worker that owns
//! them.

use crate::dataplane::WorkerStats;
use crate::descriptor::{DescriptorId, DescriptorState, Fd};
use crate::engine::Engine;
use crate::pool::IdlePool;
use crate::rpc::RpcQueue;
use concurrency::sync::{Arc, Mutex};
use config::Config;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A worker's ordinal position in the registry, stable for process lifetime.
pub type WorkerId = u16;

/// A single-threaded fast-path executor.
///
/// Owns one protocol engine instance, one idle buffer ring, one RPC queue, and the arena of
/// descriptors it is the primary owner of. Everything here except `rpc`/the arena's concurrent
/// maps is touched only by the one thread that drives this worker's `tick()` loop (I1).
pub struct Worker<E: Engine> {
    /// This worker's ordinal, assigned at registry construction and never reused.
    pub id: WorkerId,
    /// The protocol engine instance this worker drives.
    pub engine: Mutex<E>,
    /// Command queue application threads post requests to.
    pub rpc: RpcQueue,
    /// Pre-allocated transmit buffers.
    pub idle: IdlePool,
    /// This worker's registered counters (A4).
    pub stats: WorkerStats,
    /// Capacity of a freshly created descriptor's send ring, in buffers.
    pub send_ring_capacity: usize,
    /// Capacity of a freshly created descriptor's receive ring, in buffers.
    pub recv_ring_capacity: usize,
    descriptors: Mutex<HashMap<DescriptorId, Arc<DescriptorState<E::Pcb>>>>,
    fd_table: Mutex<HashMap<Fd, DescriptorId>>,
    id_to_fd: Mutex<HashMap<DescriptorId, Fd>>,
    /// Descriptors with more engine-side data than receive-ring capacity (C6 recv-list drain).
    pub recv_list: Mutex<VecDeque<DescriptorId>>,
    conn_count: AtomicUsize,
}

impl<E: Engine> Worker<E> {
    /// Build a fresh, empty worker.
    #[must_use]
    pub fn new(id: WorkerId, engine: E, config: &Config, rpc_capacity: usize) -> Self {
        Self {
            id,
            engine: Mutex::new(engine),
            rpc: RpcQueue::new(rpc_capacity),
            idle: IdlePool::new(
                config.idle_ring_capacity,
                config.segment_size,
                config.idle_watermark(),
            ),
            stats: WorkerStats::new(id),
            send_ring_capacity: config.send_ring_capacity as usize,
            recv_ring_capacity: config.recv_ring_capacity as usize,
            descriptors: Mutex::new(HashMap::new()),
            fd_table: Mutex::new(HashMap::new()),
            id_to_fd: Mutex::new(HashMap::new()),
            recv_list: Mutex::new(VecDeque::new()),
            conn_count: AtomicUsize::new(0),
        }
    }

    /// Current live-connection count, used by `min-conn-stack` election.
    #[must_use]
    pub fn conn_count(&self) -> usize {
        self.conn_count.load(Ordering::Relaxed)
    }

    /// Record that this worker gained (or lost, via a negative delta passed as `false`) a live
    /// connection.
    pub fn adjust_conn_count(&self, delta: i64) {
        if delta >= 0 {
            self.conn_count.fetch_add(delta as usize, Ordering::Relaxed);
        } else {
            self.conn_count
                .fetch_sub(delta.unsigned_abs() as usize, Ordering::Relaxed);
        }
    }

    /// Insert a newly created descriptor into this worker's arena, indexed both by its stable id
    /// and by the application-visible fd.
    pub fn insert(&self, fd: Fd, state: Arc<DescriptorState<E::Pcb>>) {
        let id = self.insert_unrouted(state);
        self.attach_fd(fd, id);
    }

    /// Insert a descriptor the tick loop already created but that has no application-visible fd
    /// yet (`accept`: the caller only learns the new connection's id from the RPC reply and must
    /// mint or borrow a kernel fd for it afterward). Call [`Worker::attach_fd`] once one exists.
    pub fn insert_unrouted(&self, state: Arc<DescriptorState<E::Pcb>>) -> DescriptorId {
        let id = state.id;
        self.descriptors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, state);
        id
    }

    /// Route an application-visible fd onto an already-inserted descriptor.
    pub fn attach_fd(&self, fd: Fd, id: DescriptorId) {
        self.fd_table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(fd, id);
        self.id_to_fd
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, fd);
    }

    /// Look up a descriptor by its stable id.
    #[must_use]
    pub fn by_id(&self, id: DescriptorId) -> Option<Arc<DescriptorState<E::Pcb>>> {
        self.descriptors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// Snapshot of every descriptor this worker currently owns, for the tick loop's per-descriptor
    /// pumps. Cheap `Arc` clones; the lock is not held while the caller iterates.
    #[must_use]
    pub fn descriptors_snapshot(&self) -> Vec<Arc<DescriptorState<E::Pcb>>> {
        self.descriptors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Look up a descriptor by the application-visible fd.
    #[must_use]
    pub fn by_fd(&self, fd: Fd) -> Option<Arc<DescriptorState<E::Pcb>>> {
        let id = *self
            .fd_table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&fd)?;
        self.by_id(id)
    }

    /// Remove a descriptor from this worker's arena entirely (I6: once closed, never looked up
    /// again). `fd` is dropped from the fd table first so the OS is free to reuse the number
    /// immediately, without racing a lookup against the old descriptor's identity.
    pub fn remove(&self, fd: Fd, id: DescriptorId) {
        self.fd_table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&fd);
        self.id_to_fd
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        self.descriptors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// Remove a descriptor known only by its stable id (the tick loop's view of a `Close` RPC,
    /// which carries no fd). Looks up and drops the matching fd-table entry too, if one exists.
    pub fn remove_by_id(&self, id: DescriptorId) {
        let fd = self
            .id_to_fd
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if let Some(fd) = fd {
            self.fd_table
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&fd);
        }
        self.descriptors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}

/// The fixed, ordered set of workers, plus the mapping from a live fd to its owning worker.
///
/// The worker array itself (`workers`) is populated once at construction and never mutated again
/// — the "immutable after init" discipline of §9. The fd→owner map is ordinary, separately mutable
/// bookkeeping: sockets open and close throughout process lifetime, so *it* cannot be read-only,
/// only the topology (the set of workers) is.
pub struct Registry<E: Engine> {
    workers: Box<[Arc<Worker<E>>]>,
    fd_owner: Mutex<HashMap<Fd, WorkerId>>,
    next_bind: AtomicUsize,
}

impl<E: Engine> Registry<E> {
    /// Build a registry over an already-constructed, non-empty set of workers.
    #[must_use]
    pub fn new(workers: Vec<Arc<Worker<E>>>) -> Self {
        Self {
            workers: workers.into_boxed_slice(),
            fd_owner: Mutex::new(HashMap::new()),
            next_bind: AtomicUsize::new(0),
        }
    }

    /// Number of workers, `W` in the specification.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Every worker, in registry order.
    #[must_use]
    pub fn workers(&self) -> &[Arc<Worker<E>>] {
        &self.workers
    }

    /// The worker at ordinal `id`.
    #[must_use]
    pub fn worker(&self, id: WorkerId) -> &Arc<Worker<E>> {
        &self.workers[id as usize]
    }

    /// Find a descriptor's state by its stable id, wherever in the registry it lives. Shadow
    /// clones are scattered one-per-worker, so fan-out (C8) needs this instead of `Worker::by_id`.
    #[must_use]
    pub fn find(&self, id: DescriptorId) -> Option<Arc<DescriptorState<E::Pcb>>> {
        self.workers.iter().find_map(|w| w.by_id(id))
    }

    /// The worker that owns `fd`'s primary descriptor state, if any (by-fd lookup).
    #[must_use]
    pub fn owner_of(&self, fd: Fd) -> Option<WorkerId> {
        self.fd_owner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&fd)
            .copied()
    }

    /// Record that `fd` is now primarily owned by `worker`.
    pub fn bind_fd(&self, fd: Fd, worker: WorkerId) {
        self.fd_owner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(fd, worker);
    }

    /// Forget `fd`'s ownership entirely (after a fast-path close).
    pub fn forget_fd(&self, fd: Fd) {
        self.fd_owner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&fd);
    }

    /// The worker to use for a freshly created descriptor on the calling thread.
    ///
    /// Mirrors "current-thread affinity" with a round robin fallback, since this crate does not
    /// pin application threads to cores itself.
    #[must_use]
    pub fn bind_worker(&self) -> WorkerId {
        let n = self.workers.len();
        let i = self.next_bind.fetch_add(1, Ordering::Relaxed) % n;
        self.workers[i].id
    }

    /// `min-conn-stack(group)`: the worker, among `group`, with the smallest live connection
    /// count. Used by shadow-listen fan-out to elect a master clone.
    #[must_use]
    pub fn min_conn_stack(&self, group: &[WorkerId]) -> WorkerId {
        *group
            .iter()
            .min_by_key(|&&w| self.worker(w).conn_count())
            .expect("group must be non-empty")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Protocol;
    use crate::errors::EngineError;
    use std::net::SocketAddr;

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

    fn registry(n: u16) -> Registry<NoopEngine> {
        let cfg = Config::builder()
            .host_addr(Some(std::net::IpAddr::from([127, 0, 0, 1])))
            .build()
            .expect("valid config");
        let workers = (0..n)
            .map(|id| Arc::new(Worker::new(id, NoopEngine, &cfg, 16)))
            .collect();
        Registry::new(workers)
    }

    #[test]
    fn bind_worker_round_robins() {
        let r = registry(3);
        let picks: Vec<_> = (0..6).map(|_| r.bind_worker()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn min_conn_stack_picks_lowest_count() {
        let r = registry(3);
        r.worker(0).adjust_conn_count(5);
        r.worker(1).adjust_conn_count(1);
        r.worker(2).adjust_conn_count(3);
        assert_eq!(r.min_conn_stack(&[0, 1, 2]), 1);
    }

    #[test]
    fn fd_ownership_round_trips() {
        let r = registry(2);
        r.bind_fd(7, 1);
        assert_eq!(r.owner_of(7), Some(1));
        r.forget_fd(7);
        assert_eq!(r.owner_of(7), None);
    }
}
