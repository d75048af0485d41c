// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Fan-out operations (C8): broadcasting bind/listen/close/shutdown across a shadow listener's
//! clone ring, and the accept/`recvfrom` balancers that choose among it.

use crate::dataplane;
use crate::descriptor::{DescriptorId, DescriptorState, Fd, Topology, walk_clone_chain};
use crate::engine::Engine;
use crate::errors::{EngineError, FastpathError, FastpathResult};
use crate::readiness::EVENT_IN;
use crate::registry::{Registry, WorkerId};
use crate::rpc::{Command, Reply, ShutdownHow};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::instrument;

fn submit<E: Engine>(
    registry: &Registry<E>,
    worker: WorkerId,
    cmd: Command,
) -> FastpathResult<Reply> {
    registry.worker(worker).rpc.submit(cmd)
}

fn link_ring<E: Engine>(registry: &Registry<E>, ids: &[DescriptorId]) {
    for (i, &id) in ids.iter().enumerate() {
        let next = ids[(i + 1) % ids.len()];
        if let Some(desc) = registry.find(id) {
            *desc.next_clone.lock().unwrap_or_else(|e| e.into_inner()) = next;
        }
    }
}

/// Broadcast bind (§4.6): bind on the descriptor's own worker, then clone it onto every other
/// worker at the same address. Any clone failure rolls back by closing the whole chain.
#[instrument(level = "debug", skip(registry, desc))]
pub fn broadcast_bind<E: Engine>(
    registry: &Registry<E>,
    fd: Fd,
    desc: &Arc<DescriptorState<E::Pcb>>,
    addr: SocketAddr,
) -> FastpathResult<()> {
    match submit(registry, desc.owner, Command::Bind(desc.id, addr))? {
        Reply::Ok => {}
        Reply::Err(e) => return Err(e),
        _ => return Err(FastpathError::Engine(EngineError::BadState)),
    }
    *desc.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(addr);

    if registry.worker_count() == 1 {
        return Ok(());
    }

    let mut clones = vec![desc.id];
    let mut failure = None;
    for worker in registry.workers() {
        if worker.id == desc.owner {
            continue;
        }
        match submit(registry, worker.id, Command::ShadowFd(fd, addr)) {
            Ok(Reply::NewDescriptor(id)) => clones.push(id),
            Ok(Reply::Err(e)) => {
                failure = Some(e);
                break;
            }
            Err(e) => {
                failure = Some(e);
                break;
            }
            Ok(_) => {}
        }
    }

    if let Some(e) = failure {
        for id in clones {
            if let Some(state) = registry.find(id) {
                let _ = submit(registry, state.owner, Command::Close(id));
            }
        }
        return Err(e);
    }

    link_ring(registry, &clones);
    desc.set_topology(Topology::Shadow);
    Ok(())
}

/// Broadcast listen (§4.6): elect the clone with the fewest live connections as master, then move
/// every clone to the listening state.
#[instrument(level = "debug", skip(registry, desc))]
pub fn broadcast_listen<E: Engine>(
    registry: &Registry<E>,
    desc: &Arc<DescriptorState<E::Pcb>>,
    backlog: u32,
) -> FastpathResult<()> {
    if desc
        .local_addr
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .is_none()
    {
        return Err(FastpathError::InvalidArgument("listen before bind"));
    }

    let mut clones = Vec::new();
    walk_clone_chain(desc.id, |id| registry.find(id), |state| clones.push((state.id, state.owner)));
    if clones.is_empty() {
        clones.push((desc.id, desc.owner));
    }

    let owners: Vec<WorkerId> = clones.iter().map(|&(_, o)| o).collect();
    let master = registry.min_conn_stack(&owners);
    for &(id, owner) in &clones {
        if let Some(state) = registry.find(id) {
            state.is_master.store(owner == master, Ordering::Release);
        }
    }

    for &(id, owner) in &clones {
        match submit(registry, owner, Command::Listen(id, backlog)) {
            Ok(Reply::Ok) => {}
            Ok(Reply::Err(e)) => {
                broadcast_close(registry, desc)?;
                return Err(e);
            }
            Err(e) => {
                broadcast_close(registry, desc)?;
                return Err(e);
            }
            Ok(_) => {}
        }
    }
    Ok(())
}

/// Broadcast accept (§4.6, §9 ambiguity i): pick the clone with a ready incoming connection and
/// the fewest live connections among the ready set, and run the accept on *that clone's* worker —
/// never on the worker that owns the fd the caller passed in.
#[instrument(level = "debug", skip(registry, desc))]
pub fn broadcast_accept<E: Engine>(
    registry: &Registry<E>,
    desc: &Arc<DescriptorState<E::Pcb>>,
    blocking: bool,
) -> FastpathResult<DescriptorId> {
    loop {
        let mut ready = Vec::new();
        walk_clone_chain(
            desc.id,
            |id| registry.find(id),
            |state| {
                if state.wakeup.ready() & EVENT_IN != 0 {
                    ready.push((state.id, state.owner));
                }
            },
        );
        if ready.is_empty() {
            if !blocking {
                return Err(FastpathError::WouldBlock);
            }
            desc.wakeup.wait();
            continue;
        }
        let owners: Vec<WorkerId> = ready.iter().map(|&(_, o)| o).collect();
        let master = registry.min_conn_stack(&owners);
        let &(chosen_id, chosen_owner) = ready
            .iter()
            .find(|&&(_, o)| o == master)
            .unwrap_or(&ready[0]);
        return match submit(registry, chosen_owner, Command::Accept(chosen_id))? {
            Reply::NewDescriptor(new_id) => {
                if let Some(state) = registry.find(chosen_id) {
                    state.wakeup.clear(EVENT_IN);
                }
                Ok(new_id)
            }
            Reply::Err(e) => Err(e),
            _ => Err(FastpathError::Engine(EngineError::BadState)),
        };
    }
}

/// Broadcast close (§4.6): walk the clone chain once, posting `Close` to each clone's worker.
#[instrument(level = "debug", skip(registry, desc))]
pub fn broadcast_close<E: Engine>(
    registry: &Registry<E>,
    desc: &Arc<DescriptorState<E::Pcb>>,
) -> FastpathResult<()> {
    let mut first_err = None;
    walk_clone_chain(
        desc.id,
        |id| registry.find(id),
        |state| {
            state.closed.store(true, Ordering::Release);
            if let Err(e) = submit(registry, state.owner, Command::Close(state.id)) {
                first_err.get_or_insert(e);
            }
        },
    );
    first_err.map_or(Ok(()), Err)
}

/// Broadcast shutdown (§4.6): walk the clone chain once, posting `Shutdown(how)` to each clone.
#[instrument(level = "debug", skip(registry, desc))]
pub fn broadcast_shutdown<E: Engine>(
    registry: &Registry<E>,
    desc: &Arc<DescriptorState<E::Pcb>>,
    how: ShutdownHow,
) -> FastpathResult<()> {
    let mut first_err = None;
    walk_clone_chain(
        desc.id,
        |id| registry.find(id),
        |state| {
            if let Err(e) = submit(registry, state.owner, Command::Shutdown(state.id, how)) {
                first_err.get_or_insert(e);
            }
        },
    );
    first_err.map_or(Ok(()), Err)
}

/// UDP `recvfrom` fan-out (§9 ambiguity iii): round-robin the clone chain starting from the
/// descriptor the caller named, stopping once every clone has been tried once (first-node
/// sentinel), the same termination rule `dataplane::drain_recv_list` uses.
#[instrument(level = "trace", skip(registry, desc, out))]
pub fn udp_recvfrom<E: Engine>(
    registry: &Registry<E>,
    desc: &Arc<DescriptorState<E::Pcb>>,
    out: &mut [u8],
    peek: bool,
) -> FastpathResult<usize> {
    let start = desc.id;
    let mut current = start;
    loop {
        let Some(state) = registry.find(current) else {
            return Err(FastpathError::BadFd);
        };
        let worker = registry.worker(state.owner);
        match dataplane::read_stack_data(worker, &state, out, peek) {
            Err(FastpathError::WouldBlock) => {
                let next = *state.next_clone.lock().unwrap_or_else(|e| e.into_inner());
                if next == start {
                    return Err(FastpathError::WouldBlock);
                }
                current = next;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Protocol;
    use crate::readiness::Wakeup;
    use crate::registry::Worker;
    use config::Config;
    use std::net::IpAddr;

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
            .host_addr(Some(IpAddr::from([127, 0, 0, 1])))
            .build()
            .expect("valid config");
        let workers = (0..n)
            .map(|id| Arc::new(Worker::new(id, NoopEngine, &cfg, 16)))
            .collect();
        Registry::new(workers)
    }

    fn seed_descriptor<E: Engine>(
        registry: &Registry<E>,
        owner: WorkerId,
    ) -> (Fd, Arc<DescriptorState<E::Pcb>>) {
        let desc = Arc::new(DescriptorState::new(
            owner,
            Protocol::Udp,
            4,
            4,
            Arc::new(Wakeup::new_poll()),
        ));
        registry.worker(owner).insert(1, desc.clone());
        registry.bind_fd(1, owner);
        (1, desc)
    }

    /// A background thread standing in for a worker's tick loop, just enough to answer the RPCs
    /// `broadcast_bind`/`broadcast_listen` issue.
    fn drive_worker(worker: Arc<Worker<NoopEngine>>, stop: Arc<std::sync::atomic::AtomicBool>) {
        std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let Some((cmd, reply_tx)) = worker.rpc.try_recv() else {
                    std::thread::yield_now();
                    continue;
                };
                let reply = match cmd {
                    Command::Bind(id, addr) => {
                        if let Some(desc) = worker.by_id(id) {
                            *desc.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(addr);
                        }
                        Reply::Ok
                    }
                    Command::ShadowFd(src_fd, addr) => {
                        let clone = Arc::new(DescriptorState::new(
                            worker.id,
                            Protocol::Udp,
                            4,
                            4,
                            Arc::new(Wakeup::new_poll()),
                        ));
                        clone.set_topology(Topology::Shadow);
                        *clone.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(addr);
                        let new_fd = src_fd + i32::from(worker.id) * 1000 + 1;
                        let id = clone.id;
                        worker.insert(new_fd, clone);
                        Reply::NewDescriptor(id)
                    }
                    Command::Listen(..) => Reply::Ok,
                    Command::Close(id) => {
                        if let Some(desc) = worker.by_id(id) {
                            desc.closed.store(true, Ordering::Release);
                        }
                        Reply::Ok
                    }
                    _ => Reply::Ok,
                };
                let _ = reply_tx.send(reply);
            }
        });
    }

    #[test]
    fn broadcast_bind_links_a_ring_across_every_worker() {
        let r = registry(3);
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        for w in r.workers() {
            drive_worker(w.clone(), stop.clone());
        }
        let (fd, desc) = seed_descriptor(&r, 0);
        let addr: SocketAddr = "127.0.0.1:9000".parse().expect("valid addr");
        broadcast_bind(&r, fd, &desc, addr).expect("broadcast bind succeeds");
        stop.store(true, Ordering::Relaxed);
        let mut visited = 0;
        walk_clone_chain(desc.id, |id| r.find(id), |_| visited += 1);
        assert_eq!(visited, 3);
        assert_eq!(desc.topology(), Topology::Shadow);
    }

    #[test]
    fn link_ring_forms_a_cycle_of_the_given_length() {
        let r = registry(3);
        let ids: Vec<_> = (0..3)
            .map(|w| {
                let desc = Arc::new(DescriptorState::new(w, Protocol::Tcp, 4, 4, Arc::new(Wakeup::new_poll())));
                let id = desc.id;
                r.worker(w).insert(i32::from(w), desc);
                id
            })
            .collect();
        link_ring(&r, &ids);
        let mut visited = 0;
        walk_clone_chain(ids[0], |id| r.find(id), |_| visited += 1);
        assert_eq!(visited, 3);
    }
}
