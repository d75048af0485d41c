// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The data plane (C6): copy-in/enqueue on send, dequeue/copy-out on receive, and the
//! recv-list drain that keeps level-triggered readiness honest.

use crate::descriptor::{DescriptorId, DescriptorState};
use crate::engine::Engine;
use crate::errors::{FastpathError, FastpathResult};
use crate::readiness::{EVENT_IN, EVENT_OUT};
use crate::registry::Worker;
use crate::rpc::Command;
use net::buffer::{TrimFromEnd, TrimFromStart};
use stats::{MetricSpec, Register, Registered};
use std::sync::atomic::Ordering;
use tracing::{instrument, trace};

/// A worker's send/receive/idle-exhaustion counters, registered once at startup (A4).
pub struct WorkerStats {
    app_write_cnt: Registered<metrics::Counter>,
    app_write_drop: Registered<metrics::Counter>,
    app_write_idlefail: Registered<metrics::Counter>,
    write_drop: Registered<metrics::Counter>,
    app_read_cnt: Registered<metrics::Counter>,
    read_drop: Registered<metrics::Counter>,
}

impl WorkerStats {
    /// Register this worker's counters, labeled with its ordinal.
    #[must_use]
    pub fn new(worker: crate::registry::WorkerId) -> Self {
        let specs: Vec<MetricSpec> = stats::worker_metric_specs(worker);
        let mut specs = specs.into_iter();
        let mut next = || specs.next().expect("worker_metric_specs always yields six entries");
        Self {
            app_write_cnt: next().register(),
            app_write_drop: next().register(),
            app_write_idlefail: next().register(),
            write_drop: next().register(),
            app_read_cnt: next().register(),
            read_drop: next().register(),
        }
    }
}

/// Application write (send path, §4.4): copy up to `data.len()` bytes into idle buffers and
/// enqueue them on the descriptor's send ring.
///
/// Returns the number of bytes actually enqueued, per the "best-effort write" policy (§7): a
/// partial enqueue is not an error.
#[instrument(level = "trace", skip(worker, desc, data))]
pub fn send_to_stack<E: Engine>(
    worker: &Worker<E>,
    desc: &DescriptorState<E::Pcb>,
    data: &[u8],
) -> FastpathResult<usize> {
    if desc.closed.load(Ordering::Acquire) {
        return Err(FastpathError::BadFd);
    }
    if desc.send_producer().is_full() {
        return Err(FastpathError::WouldBlock);
    }
    let mut written = 0;
    while written < data.len() {
        let Some(mut buf) = worker.idle.try_alloc() else {
            worker.stats.app_write_idlefail.metric.increment(1);
            break;
        };
        let cap = buf.as_ref().len();
        let take = (data.len() - written).min(cap);
        buf.as_mut()[..take].copy_from_slice(&data[written..written + take]);
        if take < cap {
            #[allow(clippy::cast_possible_truncation)]
            let _ = buf.trim_from_end((cap - take) as u16);
        }
        match desc.send_producer().try_send(buf) {
            Ok(()) => {
                written += take;
                worker.stats.app_write_cnt.metric.increment(1);
            }
            Err(_) => {
                worker.stats.app_write_drop.metric.increment(1);
                break;
            }
        }
        if desc.send_producer().is_full() {
            break;
        }
    }
    if worker.idle.below_watermark() {
        worker.rpc.post(Command::ReplenishIdle);
    }
    Ok(written)
}

/// The worker's transmit pump (`stack_send`, §4.4): hand queued buffers to the protocol engine
/// until the ring drains, the engine backpressures, or the engine only partially accepts a
/// buffer.
#[instrument(level = "trace", skip(worker, desc))]
pub fn stack_send<E: Engine>(worker: &Worker<E>, desc: &DescriptorState<E::Pcb>) {
    let mut engine = worker.engine.lock().unwrap_or_else(|e| e.into_inner());
    loop {
        let buf = {
            let mut residue = desc.send_residue.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(buf) = residue.take() {
                buf
            } else {
                drop(residue);
                match desc.send_consumer().try_recv() {
                    Ok(buf) => buf,
                    Err(_) => return,
                }
            }
        };
        let mut pcb_guard = desc.pcb.lock().unwrap_or_else(|e| e.into_inner());
        let Some(pcb) = pcb_guard.as_mut() else {
            *desc.send_residue.lock().unwrap_or_else(|e| e.into_inner()) = Some(buf);
            return;
        };
        let window = engine.send_window(pcb);
        let data_len = buf.as_ref().len();
        if window < data_len {
            drop(pcb_guard);
            *desc.send_residue.lock().unwrap_or_else(|e| e.into_inner()) = Some(buf);
            return;
        }
        let accepted = engine.send(pcb, buf.as_ref());
        if accepted < data_len {
            trace!(accepted, data_len, "engine partially accepted send buffer");
            worker.stats.write_drop.metric.increment(1);
            return;
        }
    }
    // Loop exits only by `return`; reaching here would mean the ring fully drained.
}

/// Note the level-triggered readiness state after a transmit pass: if the send ring is now empty
/// and no residue remains, a writer can be told `EVENT_OUT` is asserted (§4.4 step 5).
pub fn update_send_readiness<E: Engine>(desc: &DescriptorState<E::Pcb>) {
    let residue_empty = desc
        .send_residue
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .is_none();
    if residue_empty && desc.send_consumer().is_empty() {
        desc.wakeup.raise(EVENT_OUT);
    }
}

/// Note a listener's accept readiness (§4.6, §9 scenarios 2/6): if the engine reports a pending
/// connection for this pcb, raise `EVENT_IN` so a blocked `accept` (single-worker or, via the
/// clone's own wakeup, a fan-out one) wakes up and a ready poll can see it. A no-op for any pcb
/// that isn't listening, since `Engine::has_pending_connection` is false for those.
pub fn update_accept_readiness<E: Engine>(worker: &Worker<E>, desc: &DescriptorState<E::Pcb>) {
    let engine = worker.engine.lock().unwrap_or_else(|e| e.into_inner());
    let pcb_guard = desc.pcb.lock().unwrap_or_else(|e| e.into_inner());
    let Some(pcb) = pcb_guard.as_ref() else {
        return;
    };
    if engine.has_pending_connection(pcb) {
        desc.wakeup.raise(EVENT_IN);
    }
}

/// Worker tick, receive half (`stack_recv`, §4.4 step 1): pull buffers from the engine's receive
/// mailbox into the descriptor's receive ring. Returns whether any bytes were moved.
#[instrument(level = "trace", skip(worker, desc))]
pub fn stack_recv<E: Engine>(worker: &Worker<E>, desc: &DescriptorState<E::Pcb>) -> bool {
    let mut engine = worker.engine.lock().unwrap_or_else(|e| e.into_inner());
    let mut pcb_guard = desc.pcb.lock().unwrap_or_else(|e| e.into_inner());
    let Some(pcb) = pcb_guard.as_mut() else {
        return false;
    };
    let mut moved_any = false;
    loop {
        if desc.recv_ring_free() == 0 {
            break;
        }
        let available = engine.recv_available(pcb);
        if available == 0 {
            break;
        }
        let Some(mut buf) = worker.idle.try_alloc() else {
            break;
        };
        let cap = buf.as_ref().len();
        let take = available.min(cap);
        let data = engine.recv(pcb, take, false);
        if data.is_empty() {
            break;
        }
        let n = data.len();
        buf.as_mut()[..n].copy_from_slice(&data);
        if n < cap {
            #[allow(clippy::cast_possible_truncation)]
            let _ = buf.trim_from_end((cap - n) as u16);
        }
        if desc.recv_producer().try_send(buf).is_err() {
            break;
        }
        moved_any = true;
    }
    if engine.recv_available(pcb) > 0 {
        add_to_recv_list(worker, desc);
    }
    if moved_any {
        desc.wakeup.raise(EVENT_IN);
    }
    moved_any
}

/// Link `desc` into its worker's recv-list, if it is not already linked (I4).
pub fn add_to_recv_list<E: Engine>(worker: &Worker<E>, desc: &DescriptorState<E::Pcb>) {
    if desc
        .recv_listed
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        worker
            .recv_list
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(desc.id);
    }
}

/// Drain the recv-list for one worker tick.
///
/// Visits at most as many descriptors as were queued when the drain began — the counting form of
/// the specification's "first-node sentinel" — so a descriptor that re-queues itself mid-drain
/// cannot cause the walk to livelock (§8 testable property, §9 ambiguity iii).
pub fn drain_recv_list<E: Engine>(
    worker: &Worker<E>,
    lookup: impl Fn(DescriptorId) -> Option<std::sync::Arc<DescriptorState<E::Pcb>>>,
) {
    let initial_len = worker
        .recv_list
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .len();
    for _ in 0..initial_len {
        let id = {
            let mut list = worker.recv_list.lock().unwrap_or_else(|e| e.into_inner());
            let Some(id) = list.pop_front() else {
                return;
            };
            id
        };
        // Cleared before re-running stack_recv so a still-residual descriptor re-links itself.
        if let Some(desc) = lookup(id) {
            desc.recv_listed.store(false, Ordering::Release);
            stack_recv(worker, &desc);
        }
    }
}

/// Application read (§4.4 step 3): drain recv-residue, then the receive ring, into the caller's
/// buffer. Returns `EAGAIN` if nothing was available.
#[instrument(level = "trace", skip(worker, desc, out))]
pub fn read_stack_data<E: Engine>(
    worker: &Worker<E>,
    desc: &DescriptorState<E::Pcb>,
    out: &mut [u8],
    peek: bool,
) -> FastpathResult<usize> {
    if desc.closed.load(Ordering::Acquire) {
        return Err(FastpathError::BadFd);
    }
    let mut copied = 0;
    let mut leftover_residue = None;
    {
        let mut residue_guard = desc.recv_residue.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut buf) = residue_guard.take() {
            let available = buf.as_ref().len();
            let take = available.min(out.len());
            out[..take].copy_from_slice(&buf.as_ref()[..take]);
            copied += take;
            if peek || take < available {
                if !peek {
                    let _ = buf.trim_from_start(u16::try_from(take).unwrap_or(u16::MAX));
                }
                leftover_residue = Some(buf);
            }
        }
        *residue_guard = leftover_residue;
    }
    while copied < out.len() {
        let Ok(mut buf) = desc.recv_consumer().try_recv() else {
            break;
        };
        let available = buf.as_ref().len();
        let take = available.min(out.len() - copied);
        out[copied..copied + take].copy_from_slice(&buf.as_ref()[..take]);
        copied += take;
        if take < available {
            let _ = buf.trim_from_start(u16::try_from(take).unwrap_or(u16::MAX));
            *desc.recv_residue.lock().unwrap_or_else(|e| e.into_inner()) = Some(buf);
            break;
        }
    }
    if copied > 0 {
        worker.stats.app_read_cnt.metric.increment(1);
    } else {
        worker.stats.read_drop.metric.increment(1);
    }
    let anything_left = desc
        .recv_residue
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .is_some()
        || !desc.recv_ring_empty();
    if anything_left && !desc.recv_listed.load(Ordering::Acquire) {
        worker.rpc.post(Command::AddEvent(desc.id, EVENT_IN));
    }
    if copied == 0 {
        return Err(FastpathError::WouldBlock);
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Protocol;
    use crate::errors::EngineError;
    use crate::readiness::Wakeup;
    use config::Config;
    use std::net::SocketAddr;
    use std::sync::Arc;

    /// A minimal engine that immediately reflects whatever was sent into its own recv mailbox,
    /// i.e. a loopback pcb: good enough to exercise the send/receive pumps end-to-end.
    struct LoopbackEngine {
        mailbox: Vec<u8>,
    }

    impl Engine for LoopbackEngine {
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
            1 << 20
        }
        fn send(&mut self, _pcb: &mut (), data: &[u8]) -> usize {
            self.mailbox.extend_from_slice(data);
            data.len()
        }
        fn recv_available(&self, _pcb: &()) -> usize {
            self.mailbox.len()
        }
        fn recv(&mut self, _pcb: &mut (), max: usize, peek: bool) -> Vec<u8> {
            let take = max.min(self.mailbox.len());
            if peek {
                self.mailbox[..take].to_vec()
            } else {
                self.mailbox.drain(..take).collect()
            }
        }
        fn local_addr(&self, _pcb: &()) -> Option<SocketAddr> {
            None
        }
        fn close(&mut self, _pcb: ()) {}
    }

    fn worker_with_desc() -> (Worker<LoopbackEngine>, Arc<DescriptorState<()>>) {
        let cfg = Config::builder()
            .host_addr(Some(std::net::IpAddr::from([127, 0, 0, 1])))
            .build()
            .expect("valid config");
        let worker = Worker::new(
            0,
            LoopbackEngine {
                mailbox: Vec::new(),
            },
            &cfg,
            16,
        );
        let desc = Arc::new(DescriptorState::new(
            0,
            Protocol::Tcp,
            4,
            4,
            Arc::new(Wakeup::new_poll()),
        ));
        *desc.pcb.lock().unwrap() = Some(());
        (worker, desc)
    }

    #[test]
    fn write_then_drain_then_read_round_trips() {
        let (worker, desc) = worker_with_desc();
        let n = send_to_stack(&worker, &desc, b"hello").expect("write succeeds");
        assert_eq!(n, 5);
        stack_send(&worker, &desc);
        assert!(stack_recv(&worker, &desc));
        let mut out = [0_u8; 5];
        let n = read_stack_data(&worker, &desc, &mut out, false).expect("read succeeds");
        assert_eq!(n, 5);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn peek_preserves_data() {
        let (worker, desc) = worker_with_desc();
        send_to_stack(&worker, &desc, b"hi").expect("write succeeds");
        stack_send(&worker, &desc);
        stack_recv(&worker, &desc);
        let mut out = [0_u8; 2];
        let n = read_stack_data(&worker, &desc, &mut out, true).expect("peek succeeds");
        assert_eq!(n, 2);
        let mut out2 = [0_u8; 2];
        let n2 = read_stack_data(&worker, &desc, &mut out2, false).expect("read succeeds");
        assert_eq!(out, out2);
        assert_eq!(n, n2);
    }

    #[test]
    fn read_with_nothing_available_is_eagain() {
        let (worker, desc) = worker_with_desc();
        let mut out = [0_u8; 2];
        let err = read_stack_data(&worker, &desc, &mut out, false).unwrap_err();
        assert!(matches!(err, FastpathError::WouldBlock));
    }

    #[test]
    fn recv_list_drain_visits_each_descriptor_once_per_tick() {
        let (worker, desc) = worker_with_desc();
        add_to_recv_list(&worker, &desc);
        let id = desc.id;
        let desc2 = desc.clone();
        drain_recv_list(&worker, move |i| if i == id { Some(desc2.clone()) } else { None });
        assert!(worker.recv_list.lock().unwrap().is_empty());
    }
}
