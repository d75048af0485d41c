// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The worker's poll loop (§5): drains the RPC queue against the protocol engine, then runs the
//! data-plane pumps for every descriptor this worker owns. Never blocks — suspension is an
//! application-side concept (C7), not a worker-side one (I1).

use crate::dataplane::{self, update_send_readiness};
use crate::descriptor::{DescriptorId, DescriptorState};
use crate::engine::Engine;
use crate::errors::FastpathError;
use crate::readiness::{EVENT_HUP, EVENT_IN, Wakeup};
use crate::registry::Worker;
use crate::rpc::{Command, Reply, ShutdownHow};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, instrument, trace};

/// Run one iteration of a worker's poll loop.
///
/// Drains at most one pending RPC (so a flood of submissions cannot starve the data-plane pumps
/// below), then runs the send/receive pumps and the recv-list drain for every owned descriptor.
/// The caller is expected to call this in a tight loop on a thread pinned to this worker.
pub fn tick<E: Engine>(worker: &Worker<E>) {
    if let Some((cmd, reply_tx)) = worker.rpc.try_recv() {
        let reply = execute(worker, cmd);
        let _ = reply_tx.send(reply);
    }
    for desc in worker.descriptors_snapshot() {
        if desc.closed.load(Ordering::Acquire) {
            continue;
        }
        dataplane::stack_send(worker, &desc);
        update_send_readiness::<E>(&desc);
        dataplane::stack_recv(worker, &desc);
        dataplane::update_accept_readiness(worker, &desc);
    }
    dataplane::drain_recv_list(worker, |id| worker.by_id(id));
    if worker.idle.below_watermark() {
        worker.idle.replenish();
    }
}

#[instrument(level = "debug", skip(worker), fields(worker = worker.id))]
fn execute<E: Engine>(worker: &Worker<E>, cmd: Command) -> Reply {
    match cmd {
        Command::Create(protocol, fd) => create(worker, protocol, fd),
        Command::Close(id) => close(worker, id),
        Command::Shutdown(id, how) => shutdown(worker, id, how),
        Command::Bind(id, addr) => bind(worker, id, addr),
        Command::Listen(id, backlog) => listen(worker, id, backlog),
        Command::Accept(id) => accept(worker, id),
        Command::Connect(id, addr) => connect(worker, id, addr),
        Command::GetSockName(id) => get_sock_name(worker, id),
        Command::GetPeerName(_id) => Reply::Addr(None),
        Command::ShadowFd(src_fd, addr) => shadow_fd(worker, src_fd, addr),
        Command::ReplenishIdle => {
            worker.idle.replenish();
            Reply::Ok
        }
        Command::AddEvent(id, mask) => add_event(worker, id, mask),
        Command::ConnCount => Reply::Count(worker.conn_count()),
        Command::RecvListCount => Reply::Count(
            worker
                .recv_list
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
        ),
    }
}

fn create<E: Engine>(worker: &Worker<E>, protocol: crate::engine::Protocol, fd: crate::descriptor::Fd) -> Reply {
    let mut engine = worker.engine.lock().unwrap_or_else(|e| e.into_inner());
    match engine.create(protocol) {
        Ok(pcb) => {
            drop(engine);
            let desc = Arc::new(DescriptorState::new(
                worker.id,
                protocol,
                worker.send_ring_capacity,
                worker.recv_ring_capacity,
                Arc::new(Wakeup::new_poll()),
            ));
            *desc.pcb.lock().unwrap_or_else(|e| e.into_inner()) = Some(pcb);
            let id = desc.id;
            worker.insert(fd, desc);
            debug!(fd, ?protocol, "created descriptor");
            Reply::NewDescriptor(id)
        }
        Err(e) => Reply::Err(FastpathError::Engine(e)),
    }
}

fn close<E: Engine>(worker: &Worker<E>, id: DescriptorId) -> Reply {
    let Some(desc) = worker.by_id(id) else {
        return Reply::Err(FastpathError::BadFd);
    };
    desc.closed.store(true, Ordering::Release);
    if let Some(pcb) = desc.pcb.lock().unwrap_or_else(|e| e.into_inner()).take() {
        worker
            .engine
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .close(pcb);
    }
    if desc.is_master.swap(false, Ordering::AcqRel) {
        worker.adjust_conn_count(-1);
    }
    worker.remove_by_id(id);
    debug!(?id, "closed descriptor");
    Reply::Ok
}

fn shutdown<E: Engine>(worker: &Worker<E>, id: DescriptorId, how: ShutdownHow) -> Reply {
    let Some(desc) = worker.by_id(id) else {
        return Reply::Err(FastpathError::BadFd);
    };
    match how {
        ShutdownHow::Read | ShutdownHow::Both => desc.wakeup.raise(EVENT_HUP),
        ShutdownHow::Write => {}
    }
    trace!(?id, ?how, "shutdown half");
    Reply::Ok
}

fn bind<E: Engine>(worker: &Worker<E>, id: DescriptorId, addr: std::net::SocketAddr) -> Reply {
    let Some(desc) = worker.by_id(id) else {
        return Reply::Err(FastpathError::BadFd);
    };
    let mut pcb_guard = desc.pcb.lock().unwrap_or_else(|e| e.into_inner());
    let Some(pcb) = pcb_guard.as_mut() else {
        return Reply::Err(FastpathError::BadFd);
    };
    match worker
        .engine
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .bind(pcb, addr)
    {
        Ok(()) => {
            drop(pcb_guard);
            *desc.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(addr);
            Reply::Ok
        }
        Err(e) => Reply::Err(FastpathError::Engine(e)),
    }
}

fn listen<E: Engine>(worker: &Worker<E>, id: DescriptorId, backlog: u32) -> Reply {
    let Some(desc) = worker.by_id(id) else {
        return Reply::Err(FastpathError::BadFd);
    };
    let mut pcb_guard = desc.pcb.lock().unwrap_or_else(|e| e.into_inner());
    let Some(pcb) = pcb_guard.as_mut() else {
        return Reply::Err(FastpathError::BadFd);
    };
    match worker
        .engine
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .listen(pcb, backlog)
    {
        Ok(()) => Reply::Ok,
        Err(e) => Reply::Err(FastpathError::Engine(e)),
    }
}

fn accept<E: Engine>(worker: &Worker<E>, id: DescriptorId) -> Reply {
    let Some(desc) = worker.by_id(id) else {
        return Reply::Err(FastpathError::BadFd);
    };
    let mut pcb_guard = desc.pcb.lock().unwrap_or_else(|e| e.into_inner());
    let Some(pcb) = pcb_guard.as_mut() else {
        return Reply::Err(FastpathError::BadFd);
    };
    let accepted = worker
        .engine
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .accept(pcb);
    drop(pcb_guard);
    let Some(new_pcb) = accepted else {
        return Reply::Err(FastpathError::WouldBlock);
    };
    let new_desc = Arc::new(DescriptorState::new(
        worker.id,
        desc.protocol,
        worker.send_ring_capacity,
        worker.recv_ring_capacity,
        Arc::new(Wakeup::new_poll()),
    ));
    *new_desc.pcb.lock().unwrap_or_else(|e| e.into_inner()) = Some(new_pcb);
    let new_id = new_desc.id;
    worker.insert_unrouted(new_desc);
    worker.adjust_conn_count(1);
    debug!(listener = ?id, accepted = ?new_id, "accepted connection");
    Reply::NewDescriptor(new_id)
}

fn connect<E: Engine>(worker: &Worker<E>, id: DescriptorId, addr: std::net::SocketAddr) -> Reply {
    let Some(desc) = worker.by_id(id) else {
        return Reply::Err(FastpathError::BadFd);
    };
    let mut pcb_guard = desc.pcb.lock().unwrap_or_else(|e| e.into_inner());
    let Some(pcb) = pcb_guard.as_mut() else {
        return Reply::Err(FastpathError::BadFd);
    };
    match worker
        .engine
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .connect(pcb, addr)
    {
        Ok(()) => {
            drop(pcb_guard);
            worker.adjust_conn_count(1);
            Reply::Ok
        }
        Err(e) => Reply::Err(FastpathError::Engine(e)),
    }
}

fn get_sock_name<E: Engine>(worker: &Worker<E>, id: DescriptorId) -> Reply {
    let Some(desc) = worker.by_id(id) else {
        return Reply::Err(FastpathError::BadFd);
    };
    let pcb_guard = desc.pcb.lock().unwrap_or_else(|e| e.into_inner());
    let Some(pcb) = pcb_guard.as_ref() else {
        return Reply::Addr(None);
    };
    let addr = worker
        .engine
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .local_addr(pcb);
    Reply::Addr(addr)
}

fn shadow_fd<E: Engine>(
    worker: &Worker<E>,
    _src_fd: crate::descriptor::Fd,
    addr: std::net::SocketAddr,
) -> Reply {
    let mut engine = worker.engine.lock().unwrap_or_else(|e| e.into_inner());
    let pcb = match engine.create(crate::engine::Protocol::Tcp) {
        Ok(pcb) => pcb,
        Err(e) => return Reply::Err(FastpathError::Engine(e)),
    };
    let desc = Arc::new(DescriptorState::new(
        worker.id,
        crate::engine::Protocol::Tcp,
        worker.send_ring_capacity,
        worker.recv_ring_capacity,
        Arc::new(Wakeup::new_poll()),
    ));
    let mut pcb = pcb;
    if let Err(e) = engine.bind(&mut pcb, addr) {
        engine.close(pcb);
        return Reply::Err(FastpathError::Engine(e));
    }
    drop(engine);
    *desc.pcb.lock().unwrap_or_else(|e| e.into_inner()) = Some(pcb);
    *desc.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(addr);
    desc.set_topology(crate::descriptor::Topology::Shadow);
    let id = worker.insert_unrouted(desc);
    debug!(?id, worker = worker.id, %addr, "shadow clone bound");
    Reply::NewDescriptor(id)
}

fn add_event<E: Engine>(worker: &Worker<E>, id: DescriptorId, mask: u32) -> Reply {
    let Some(desc) = worker.by_id(id) else {
        return Reply::Err(FastpathError::BadFd);
    };
    desc.wakeup.raise(mask);
    if mask & EVENT_IN != 0 {
        dataplane::add_to_recv_list(worker, &desc);
    }
    Reply::Ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Protocol;
    use crate::errors::EngineError;
    use config::Config;
    use std::net::{IpAddr, SocketAddr};

    #[derive(Default)]
    struct EchoEngine {
        next_pcb: u32,
    }

    struct Pcb {
        id: u32,
        bound: Option<SocketAddr>,
        backlog: Option<u32>,
        pending_accept: Option<u32>,
    }

    impl Engine for EchoEngine {
        type Pcb = Pcb;
        fn create(&mut self, _protocol: Protocol) -> Result<Pcb, EngineError> {
            self.next_pcb += 1;
            Ok(Pcb {
                id: self.next_pcb,
                bound: None,
                backlog: None,
                pending_accept: None,
            })
        }
        fn bind(&mut self, pcb: &mut Pcb, addr: SocketAddr) -> Result<(), EngineError> {
            pcb.bound = Some(addr);
            Ok(())
        }
        fn listen(&mut self, pcb: &mut Pcb, backlog: u32) -> Result<(), EngineError> {
            pcb.backlog = Some(backlog);
            pcb.pending_accept = Some(pcb.id + 1000);
            Ok(())
        }
        fn accept(&mut self, pcb: &mut Pcb) -> Option<Pcb> {
            let id = pcb.pending_accept.take()?;
            Some(Pcb {
                id,
                bound: pcb.bound,
                backlog: None,
                pending_accept: None,
            })
        }
        fn has_pending_connection(&self, pcb: &Pcb) -> bool {
            pcb.pending_accept.is_some()
        }
        fn connect(&mut self, _pcb: &mut Pcb, _addr: SocketAddr) -> Result<(), EngineError> {
            Ok(())
        }
        fn send_window(&self, _pcb: &Pcb) -> usize {
            0
        }
        fn send(&mut self, _pcb: &mut Pcb, _data: &[u8]) -> usize {
            0
        }
        fn recv_available(&self, _pcb: &Pcb) -> usize {
            0
        }
        fn recv(&mut self, _pcb: &mut Pcb, _max: usize, _peek: bool) -> Vec<u8> {
            Vec::new()
        }
        fn local_addr(&self, pcb: &Pcb) -> Option<SocketAddr> {
            pcb.bound
        }
        fn close(&mut self, _pcb: Pcb) {}
    }

    fn worker() -> Worker<EchoEngine> {
        let cfg = Config::builder()
            .host_addr(Some(IpAddr::from([127, 0, 0, 1])))
            .build()
            .expect("valid config");
        Worker::new(0, EchoEngine::default(), &cfg, 16)
    }

    #[test]
    fn create_bind_listen_accept_round_trip() {
        let w = worker();
        let addr: SocketAddr = "127.0.0.1:9000".parse().expect("valid addr");

        let Reply::NewDescriptor(id) = execute(&w, Command::Create(Protocol::Tcp, 10)) else {
            panic!("expected NewDescriptor");
        };
        assert!(matches!(execute(&w, Command::Bind(id, addr)), Reply::Ok));
        assert!(matches!(execute(&w, Command::Listen(id, 16)), Reply::Ok));

        let Reply::NewDescriptor(accepted) = execute(&w, Command::Accept(id)) else {
            panic!("expected a ready connection");
        };
        assert_ne!(accepted, id);
        assert_eq!(w.conn_count(), 1);

        assert!(matches!(execute(&w, Command::Accept(id)), Reply::Err(_)));
    }

    #[test]
    fn tick_raises_event_in_on_a_listener_with_a_pending_connection() {
        let w = worker();
        let addr: SocketAddr = "127.0.0.1:9001".parse().expect("valid addr");

        let Reply::NewDescriptor(id) = execute(&w, Command::Create(Protocol::Tcp, 20)) else {
            panic!("expected NewDescriptor");
        };
        assert!(matches!(execute(&w, Command::Bind(id, addr)), Reply::Ok));
        assert!(matches!(execute(&w, Command::Listen(id, 16)), Reply::Ok));

        let desc = w.by_id(id).expect("descriptor exists");
        assert_eq!(desc.wakeup.ready() & EVENT_IN, 0);
        tick(&w);
        assert_ne!(desc.wakeup.ready() & EVENT_IN, 0);
    }

    #[test]
    fn close_tears_down_and_forgets_the_descriptor() {
        let w = worker();
        let Reply::NewDescriptor(id) = execute(&w, Command::Create(Protocol::Tcp, 11)) else {
            panic!("expected NewDescriptor");
        };
        assert!(matches!(execute(&w, Command::Close(id)), Reply::Ok));
        assert!(w.by_id(id).is_none());
        assert!(w.by_fd(11).is_none());
    }

    #[test]
    fn tick_drains_one_pending_rpc() {
        let w = worker();
        w.rpc.post(Command::Create(Protocol::Tcp, 12));
        tick(&w);
        assert!(w.by_fd(12).is_some());
    }
}
