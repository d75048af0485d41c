// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Type-erased entry point into a concrete [`fastpath::Stack<E>`].
//!
//! The shim's `#[no_mangle]` functions cannot be generic, but [`fastpath::Stack`] is generic over
//! its [`Engine`](fastpath::engine::Engine) collaborator. [`ErasedStack`] is the object-safe
//! boundary that lets a process install whichever concrete stack it was built with (the real
//! DPDK-backed engine in production, a fake loopback engine in the demo binary) behind one global
//! handle, mirroring the role `g_wrap_api`'s function-pointer table plays in the original
//! implementation this crate's POSIX surface is grounded on.

use config::Config;
use fastpath::descriptor::Fd;
use fastpath::engine::{Engine, Protocol};
use fastpath::errors::{EngineError, FastpathError, FastpathResult};
use fastpath::path::{self, Path};
use fastpath::rpc::{Command, Reply, ShutdownHow};
use fastpath::{Stack, dataplane, fanout};
use std::net::SocketAddr;
use std::sync::OnceLock;

static STACK: OnceLock<Box<dyn ErasedStack>> = OnceLock::new();

/// Install the process-wide stack. Must be called exactly once, before any intercepted POSIX call
/// arrives; later calls are ignored (mirrors `wrap_api_init`'s own "already initialized" guard).
pub fn install<E: Engine>(stack: Stack<E>) {
    let _ = STACK.set(Box::new(stack));
}

/// The installed stack, if [`install`] has run.
pub fn stack() -> Option<&'static dyn ErasedStack> {
    STACK.get().map(std::convert::AsRef::as_ref)
}

/// Object-safe, fd-keyed view of a [`fastpath::Stack`], used by every `do_*` dispatcher in
/// [`crate::posix`]. Every method here corresponds to one or more RPC commands or data-plane
/// pumps; the generic impl below is the only place that ever names a concrete `Engine::Pcb`.
pub trait ErasedStack: Send + Sync {
    /// Whether process initialization has completed (`Stack::is_ready`).
    fn is_ready(&self) -> bool;
    /// The process-wide configuration.
    fn config(&self) -> &Config;
    /// Create fast-path state for a freshly opened descriptor.
    fn create(&self, protocol: Protocol, fd: Fd) -> FastpathResult<()>;
    /// Bind, fanning out to every worker when shadow-listen is enabled.
    fn bind(&self, fd: Fd, addr: SocketAddr) -> FastpathResult<()>;
    /// Move to the listening state, fanning out across whatever ring `bind` built.
    fn listen(&self, fd: Fd, backlog: u32) -> FastpathResult<()>;
    /// Accept one connection, attaching `new_fd` (already minted by the caller) to it.
    fn accept(&self, fd: Fd, new_fd: Fd, blocking: bool) -> FastpathResult<()>;
    /// Begin connecting to a remote address.
    fn connect(&self, fd: Fd, addr: SocketAddr) -> FastpathResult<()>;
    /// Enqueue outbound data.
    fn write(&self, fd: Fd, data: &[u8]) -> FastpathResult<usize>;
    /// Copy out inbound data, optionally blocking until some arrives.
    fn read(&self, fd: Fd, out: &mut [u8], peek: bool, blocking: bool) -> FastpathResult<usize>;
    /// UDP `recvfrom` fan-out across a shadow ring.
    fn recvfrom(&self, fd: Fd, out: &mut [u8], peek: bool) -> FastpathResult<usize>;
    /// Shut down one or both halves.
    fn shutdown(&self, fd: Fd, how: ShutdownHow) -> FastpathResult<()>;
    /// Tear down fast-path state for a descriptor.
    fn close(&self, fd: Fd) -> FastpathResult<()>;
    /// The locally bound address, if any.
    fn local_addr(&self, fd: Fd) -> FastpathResult<Option<SocketAddr>>;
    /// Whether `fd` currently routes to the fast path (§4.1 per-descriptor predicate).
    fn is_fast(&self, fd: Fd) -> bool;
    /// Tag a descriptor host-only (the local-connect routing rule, §6).
    fn tag_host(&self, fd: Fd);
    /// Forget a fd's ownership entirely, without otherwise touching its descriptor.
    fn forget(&self, fd: Fd);
}

impl<E: Engine> ErasedStack for Stack<E> {
    fn is_ready(&self) -> bool {
        Stack::is_ready(self)
    }

    fn config(&self) -> &Config {
        &self.config
    }

    fn create(&self, protocol: Protocol, fd: Fd) -> FastpathResult<()> {
        let worker = self.registry.bind_worker();
        match self.registry.worker(worker).rpc.submit(Command::Create(protocol, fd))? {
            Reply::NewDescriptor(_) => {
                self.registry.bind_fd(fd, worker);
                Ok(())
            }
            Reply::Err(e) => Err(e),
            _ => Err(FastpathError::Engine(EngineError::BadState)),
        }
    }

    fn bind(&self, fd: Fd, addr: SocketAddr) -> FastpathResult<()> {
        let owner = self.registry.owner_of(fd).ok_or(FastpathError::BadFd)?;
        let desc = self.registry.worker(owner).by_fd(fd).ok_or(FastpathError::BadFd)?;
        if self.should_shadow() {
            return fanout::broadcast_bind(&self.registry, fd, &desc, addr);
        }
        match self.registry.worker(owner).rpc.submit(Command::Bind(desc.id, addr))? {
            Reply::Ok => Ok(()),
            Reply::Err(e) => Err(e),
            _ => Err(FastpathError::Engine(EngineError::BadState)),
        }
    }

    fn listen(&self, fd: Fd, backlog: u32) -> FastpathResult<()> {
        let owner = self.registry.owner_of(fd).ok_or(FastpathError::BadFd)?;
        let desc = self.registry.worker(owner).by_fd(fd).ok_or(FastpathError::BadFd)?;
        if path::is_shadow(&desc) {
            return fanout::broadcast_listen(&self.registry, &desc, backlog);
        }
        match self.registry.worker(owner).rpc.submit(Command::Listen(desc.id, backlog))? {
            Reply::Ok => Ok(()),
            Reply::Err(e) => Err(e),
            _ => Err(FastpathError::Engine(EngineError::BadState)),
        }
    }

    fn accept(&self, fd: Fd, new_fd: Fd, blocking: bool) -> FastpathResult<()> {
        let owner = self.registry.owner_of(fd).ok_or(FastpathError::BadFd)?;
        let desc = self.registry.worker(owner).by_fd(fd).ok_or(FastpathError::BadFd)?;
        let new_id = if path::is_shadow(&desc) {
            fanout::broadcast_accept(&self.registry, &desc, blocking)?
        } else {
            loop {
                match self.registry.worker(owner).rpc.submit(Command::Accept(desc.id))? {
                    Reply::NewDescriptor(id) => {
                        desc.wakeup.clear(fastpath::readiness::EVENT_IN);
                        break id;
                    }
                    Reply::Err(FastpathError::WouldBlock) if blocking => {
                        desc.wakeup.wait();
                    }
                    Reply::Err(e) => return Err(e),
                    _ => return Err(FastpathError::Engine(EngineError::BadState)),
                }
            }
        };
        let new_owner = self
            .registry
            .find(new_id)
            .map(|d| d.owner)
            .ok_or(FastpathError::BadFd)?;
        self.registry.worker(new_owner).attach_fd(new_fd, new_id);
        self.registry.bind_fd(new_fd, new_owner);
        Ok(())
    }

    fn connect(&self, fd: Fd, addr: SocketAddr) -> FastpathResult<()> {
        let owner = self.registry.owner_of(fd).ok_or(FastpathError::BadFd)?;
        let desc = self.registry.worker(owner).by_fd(fd).ok_or(FastpathError::BadFd)?;
        match self.registry.worker(owner).rpc.submit(Command::Connect(desc.id, addr))? {
            Reply::Ok => Ok(()),
            Reply::Err(e) => Err(e),
            _ => Err(FastpathError::Engine(EngineError::BadState)),
        }
    }

    fn write(&self, fd: Fd, data: &[u8]) -> FastpathResult<usize> {
        let owner = self.registry.owner_of(fd).ok_or(FastpathError::BadFd)?;
        let worker = self.registry.worker(owner);
        let desc = worker.by_fd(fd).ok_or(FastpathError::BadFd)?;
        dataplane::send_to_stack(worker, &desc, data)
    }

    fn read(&self, fd: Fd, out: &mut [u8], peek: bool, blocking: bool) -> FastpathResult<usize> {
        let owner = self.registry.owner_of(fd).ok_or(FastpathError::BadFd)?;
        let worker = self.registry.worker(owner);
        let desc = worker.by_fd(fd).ok_or(FastpathError::BadFd)?;
        loop {
            match dataplane::read_stack_data(worker, &desc, out, peek) {
                Err(FastpathError::WouldBlock) if blocking => desc.wakeup.wait(),
                other => return other,
            };
        }
    }

    fn recvfrom(&self, fd: Fd, out: &mut [u8], peek: bool) -> FastpathResult<usize> {
        let owner = self.registry.owner_of(fd).ok_or(FastpathError::BadFd)?;
        let desc = self.registry.worker(owner).by_fd(fd).ok_or(FastpathError::BadFd)?;
        fanout::udp_recvfrom(&self.registry, &desc, out, peek)
    }

    fn shutdown(&self, fd: Fd, how: ShutdownHow) -> FastpathResult<()> {
        let owner = self.registry.owner_of(fd).ok_or(FastpathError::BadFd)?;
        let desc = self.registry.worker(owner).by_fd(fd).ok_or(FastpathError::BadFd)?;
        fanout::broadcast_shutdown(&self.registry, &desc, how)
    }

    fn close(&self, fd: Fd) -> FastpathResult<()> {
        let owner = self.registry.owner_of(fd).ok_or(FastpathError::BadFd)?;
        let desc = self.registry.worker(owner).by_fd(fd).ok_or(FastpathError::BadFd)?;
        fanout::broadcast_close(&self.registry, &desc)?;
        self.registry.forget_fd(fd);
        Ok(())
    }

    fn local_addr(&self, fd: Fd) -> FastpathResult<Option<SocketAddr>> {
        let owner = self.registry.owner_of(fd).ok_or(FastpathError::BadFd)?;
        let desc = self.registry.worker(owner).by_fd(fd).ok_or(FastpathError::BadFd)?;
        Ok(*desc.local_addr.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn is_fast(&self, fd: Fd) -> bool {
        let Some(owner) = self.registry.owner_of(fd) else {
            return false;
        };
        let desc = self.registry.worker(owner).by_fd(fd);
        path::select_fd_path(desc.as_deref()) == Path::Fast
    }

    fn tag_host(&self, fd: Fd) {
        if let Some(owner) = self.registry.owner_of(fd) {
            if let Some(desc) = self.registry.worker(owner).by_fd(fd) {
                desc.host_tag.set();
            }
        }
    }

    fn forget(&self, fd: Fd) {
        self.registry.forget_fd(fd);
    }
}

trait ShadowGate {
    fn should_shadow(&self) -> bool;
}

impl<E: Engine> ShadowGate for Stack<E> {
    /// Whether a freshly bound listener should fan out across every worker (§4.6): gated on both
    /// config switches named in §4.8/§6, not just worker count — `tuple_filter` always forces a
    /// single-worker listen even when `listen_shadow` is set.
    fn should_shadow(&self) -> bool {
        self.config.listen_shadow && !self.config.tuple_filter && self.registry.worker_count() > 1
    }
}
