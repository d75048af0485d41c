// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all, clippy::pedantic)]

//! A fake [`Engine`](fastpath::engine::Engine) implementation, for tests and the demo binary.
//!
//! This crate carries no real TCP/UDP logic, matching [`fastpath::engine::Engine`]'s own framing
//! of the protocol engine as an out-of-crate collaborator (see `fastpath/src/engine.rs`'s module
//! doc). [`LoopbackEngine`] is a minimal pcb table that loops written bytes straight back into
//! the same pcb's receive queue and hands out one locally-queued connection per `listen`ing pcb
//! on `accept`, just enough behavior to exercise every call the fast path makes without needing
//! an actual network.

use fastpath::engine::{Engine, Protocol};
use fastpath::errors::EngineError;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

/// A stable handle into [`LoopbackEngine`]'s internal pcb table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PcbHandle(u64);

struct PcbState {
    protocol: Protocol,
    local_addr: Option<SocketAddr>,
    listening: bool,
    backlog: VecDeque<PcbHandle>,
    inbox: VecDeque<u8>,
}

/// A fake protocol engine that loops back whatever it is asked to send.
///
/// `send` appends straight to the same pcb's `inbox`, so a descriptor's own writes become that
/// descriptor's own reads — enough to drive an echo-style demo without a real network stack.
/// `listen` + `accept` hands out a fresh pcb bound to the listener's address for every caller of
/// `connect` against it, since there is no real peer to rendezvous with.
#[derive(Default)]
pub struct LoopbackEngine {
    pcbs: HashMap<u64, PcbState>,
    next: u64,
    by_addr: HashMap<SocketAddr, u64>,
}

impl LoopbackEngine {
    /// A fresh, empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Engine for LoopbackEngine {
    type Pcb = PcbHandle;

    fn create(&mut self, protocol: Protocol) -> Result<Self::Pcb, EngineError> {
        let id = self.next;
        self.next += 1;
        self.pcbs.insert(
            id,
            PcbState {
                protocol,
                local_addr: None,
                listening: false,
                backlog: VecDeque::new(),
                inbox: VecDeque::new(),
            },
        );
        Ok(PcbHandle(id))
    }

    fn bind(&mut self, pcb: &mut Self::Pcb, addr: SocketAddr) -> Result<(), EngineError> {
        if self.by_addr.contains_key(&addr) {
            return Err(EngineError::AddrInUse);
        }
        let state = self.pcbs.get_mut(&pcb.0).ok_or(EngineError::BadState)?;
        state.local_addr = Some(addr);
        self.by_addr.insert(addr, pcb.0);
        Ok(())
    }

    fn listen(&mut self, pcb: &mut Self::Pcb, _backlog: u32) -> Result<(), EngineError> {
        let state = self.pcbs.get_mut(&pcb.0).ok_or(EngineError::BadState)?;
        if state.local_addr.is_none() {
            return Err(EngineError::BadState);
        }
        state.listening = true;
        Ok(())
    }

    fn accept(&mut self, pcb: &mut Self::Pcb) -> Option<Self::Pcb> {
        let state = self.pcbs.get_mut(&pcb.0)?;
        state.backlog.pop_front()
    }

    fn has_pending_connection(&self, pcb: &Self::Pcb) -> bool {
        self.pcbs.get(&pcb.0).is_some_and(|s| !s.backlog.is_empty())
    }

    fn connect(&mut self, pcb: &mut Self::Pcb, addr: SocketAddr) -> Result<(), EngineError> {
        let protocol = self
            .pcbs
            .get(&pcb.0)
            .ok_or(EngineError::BadState)?
            .protocol;
        let &listener_id = self.by_addr.get(&addr).ok_or(EngineError::BadState)?;
        let listener = self.pcbs.get(&listener_id).ok_or(EngineError::BadState)?;
        if !listener.listening {
            return Err(EngineError::BadState);
        }
        let peer_id = self.next;
        self.next += 1;
        self.pcbs.insert(
            peer_id,
            PcbState {
                protocol,
                local_addr: Some(addr),
                listening: false,
                backlog: VecDeque::new(),
                inbox: VecDeque::new(),
            },
        );
        self.pcbs
            .get_mut(&listener_id)
            .ok_or(EngineError::BadState)?
            .backlog
            .push_back(PcbHandle(peer_id));
        Ok(())
    }

    fn send_window(&self, _pcb: &Self::Pcb) -> usize {
        usize::MAX
    }

    fn send(&mut self, pcb: &mut Self::Pcb, data: &[u8]) -> usize {
        let Some(state) = self.pcbs.get_mut(&pcb.0) else {
            return 0;
        };
        state.inbox.extend(data.iter().copied());
        data.len()
    }

    fn recv_available(&self, pcb: &Self::Pcb) -> usize {
        self.pcbs.get(&pcb.0).map_or(0, |s| s.inbox.len())
    }

    fn recv(&mut self, pcb: &mut Self::Pcb, max: usize, peek: bool) -> Vec<u8> {
        let Some(state) = self.pcbs.get_mut(&pcb.0) else {
            return Vec::new();
        };
        let n = max.min(state.inbox.len());
        let out: Vec<u8> = state.inbox.iter().take(n).copied().collect();
        if !peek {
            state.inbox.drain(..n);
        }
        out
    }

    fn local_addr(&self, pcb: &Self::Pcb) -> Option<SocketAddr> {
        self.pcbs.get(&pcb.0)?.local_addr
    }

    fn close(&mut self, pcb: Self::Pcb) {
        if let Some(state) = self.pcbs.remove(&pcb.0) {
            if let Some(addr) = state.local_addr {
                self.by_addr.remove(&addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::from([127, 0, 0, 1]), port)
    }

    #[test]
    fn loopback_send_becomes_its_own_recv() {
        let mut engine = LoopbackEngine::new();
        let mut pcb = engine.create(Protocol::Tcp).expect("create");
        assert_eq!(engine.send(&mut pcb, b"hello"), 5);
        assert_eq!(engine.recv_available(&pcb), 5);
        assert_eq!(engine.recv(&mut pcb, 5, false), b"hello");
        assert_eq!(engine.recv_available(&pcb), 0);
    }

    #[test]
    fn connect_queues_a_peer_on_the_listener() {
        let mut engine = LoopbackEngine::new();
        let mut listener = engine.create(Protocol::Tcp).expect("create");
        engine.bind(&mut listener, addr(9000)).expect("bind");
        engine.listen(&mut listener, 16).expect("listen");

        let mut client = engine.create(Protocol::Tcp).expect("create");
        engine.connect(&mut client, addr(9000)).expect("connect");

        let accepted = engine.accept(&mut listener).expect("one pending peer");
        assert_eq!(engine.local_addr(&accepted), Some(addr(9000)));
    }

    #[test]
    fn bind_rejects_a_duplicate_address() {
        let mut engine = LoopbackEngine::new();
        let mut a = engine.create(Protocol::Tcp).expect("create");
        let mut b = engine.create(Protocol::Tcp).expect("create");
        engine.bind(&mut a, addr(9001)).expect("first bind");
        assert!(matches!(
            engine.bind(&mut b, addr(9001)),
            Err(EngineError::AddrInUse)
        ));
    }
}
