// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The per-worker RPC queue (C3): a bounded command channel from any application thread to the
//! one worker that owns a descriptor, with synchronous per-command completion.

use crate::descriptor::{DescriptorId, Fd};
use crate::engine::Protocol;
use crate::errors::{FastpathError, FastpathResult};
use crossbeam_channel::{Receiver, Sender, bounded};
use std::net::SocketAddr;

/// Which half(s) of a connection `shutdown` affects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHow {
    /// Shut down the read half.
    Read,
    /// Shut down the write half.
    Write,
    /// Shut down both halves.
    Both,
}

/// A command posted to a worker's RPC queue.
///
/// Every variant that targets an existing descriptor carries its [`DescriptorId`], never a raw
/// [`Fd`] — the id survives fd reuse and rules out acting on the wrong socket (§9 "cyclic clone
/// chain" discipline extended to every RPC, not just shadow walks).
#[derive(Debug, Clone)]
pub enum Command {
    /// Create a new, unbound pcb on this worker for the given protocol.
    Create(Protocol, Fd),
    /// Tear down a descriptor's engine-side state.
    Close(DescriptorId),
    /// Shut down one or both halves of a connection.
    Shutdown(DescriptorId, ShutdownHow),
    /// Bind to a local address.
    Bind(DescriptorId, SocketAddr),
    /// Move to the listening state.
    Listen(DescriptorId, u32),
    /// Attempt to pop one ready incoming connection.
    Accept(DescriptorId),
    /// Begin connecting to a remote address.
    Connect(DescriptorId, SocketAddr),
    /// Fetch the locally bound address.
    GetSockName(DescriptorId),
    /// Fetch the peer address (stub: engines that don't track one return `None`).
    GetPeerName(DescriptorId),
    /// Clone a shadow descriptor onto this worker, bound to the same address.
    ShadowFd(Fd, SocketAddr),
    /// Ask the worker to top up its idle (transmit) buffer ring.
    ReplenishIdle,
    /// Re-assert readiness for a descriptor (level-triggered; §9).
    AddEvent(DescriptorId, u32),
    /// Introspection: number of live connections this worker owns.
    ConnCount,
    /// Introspection: number of descriptors currently on the recv-list.
    RecvListCount,
}

/// A worker's response to a [`Command`].
#[derive(Debug, Clone)]
pub enum Reply {
    /// The command completed with no further data.
    Ok,
    /// A (possibly absent) socket address.
    Addr(Option<SocketAddr>),
    /// A newly created descriptor's stable id.
    NewDescriptor(DescriptorId),
    /// A count, for introspection commands.
    Count(usize),
    /// The command failed.
    Err(FastpathError),
}

/// A bounded, single-producer/single-consumer-per-submission command channel into one worker.
///
/// Many application threads may call [`RpcQueue::submit`] concurrently (the channel itself is
/// MPMC-safe), but the specification's SPSC framing refers to *per command*: each submission opens
/// its own one-shot completion slot, and the worker drains the shared queue strictly in enqueue
/// order (ordering guarantee of §4.3).
pub struct RpcQueue {
    tx: Sender<(Command, Sender<Reply>)>,
    rx: Receiver<(Command, Sender<Reply>)>,
}

impl RpcQueue {
    /// Create a queue with room for `capacity` outstanding (not yet drained) commands.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }

    /// Enqueue `cmd` and block until the owning worker completes it.
    ///
    /// # Errors
    ///
    /// Returns [`FastpathError::BadFd`] if the worker has shut down and is no longer draining its
    /// queue.
    pub fn submit(&self, cmd: Command) -> FastpathResult<Reply> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send((cmd, reply_tx))
            .map_err(|_| FastpathError::BadFd)?;
        reply_rx.recv().map_err(|_| FastpathError::BadFd)
    }

    /// Post `cmd` without waiting for completion, e.g. best-effort `ReplenishIdle`.
    pub fn post(&self, cmd: Command) {
        let (reply_tx, _reply_rx) = bounded(1);
        let _ = self.tx.send((cmd, reply_tx));
    }

    /// Worker side: drain one pending command, if any, without blocking.
    pub fn try_recv(&self) -> Option<(Command, Sender<Reply>)> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_without_a_drainer_does_not_panic_but_eventually_errors() {
        let q = RpcQueue::new(1);
        q.post(Command::ReplenishIdle);
        assert!(q.try_recv().is_some());
    }
}
