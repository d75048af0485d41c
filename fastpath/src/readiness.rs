// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Readiness and wakeup (C7): the object a blocked application thread waits on, and the
//! event-list bookkeeping `epoll`/`poll`/`select` consult.

use concurrency::sync::{Condvar, Mutex};
use std::time::Duration;

/// `EPOLLIN`-equivalent: the descriptor has data or an incoming connection to offer.
pub const EVENT_IN: u32 = 0x001;
/// `EPOLLOUT`-equivalent: the descriptor can accept more outbound data (`SEND-PLUS`, §4.4 step 5).
pub const EVENT_OUT: u32 = 0x004;
/// `EPOLLHUP`-equivalent: the peer went away.
pub const EVENT_HUP: u32 = 0x010;

/// Which multiplexing API a [`Wakeup`] is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupKind {
    /// Plain `poll`/blocking-call wait, not registered with any epoll instance.
    Poll,
    /// Registered with the epoll instance identified by this (kernel) epoll fd.
    Epoll(i32),
}

/// The notification object bound to one descriptor.
///
/// The specification describes an event list protected by a spinlock; this crate uses a
/// [`Mutex`] (from the same `std`/`loom`/`shuttle`-switchable re-export the rest of the crate
/// uses) guarding the ready-event bitmask, paired with a [`Condvar`] for the blocking-wait case —
/// the safe-Rust equivalent of a spin-then-park primitive.
pub struct Wakeup {
    kind: Mutex<WakeupKind>,
    events: Mutex<u32>,
    condvar: Condvar,
}

impl Wakeup {
    /// A wakeup not registered with any epoll instance.
    #[must_use]
    pub fn new_poll() -> Self {
        Self {
            kind: Mutex::new(WakeupKind::Poll),
            events: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    /// A wakeup registered with the given epoll instance.
    #[must_use]
    pub fn new_epoll(epfd: i32) -> Self {
        Self {
            kind: Mutex::new(WakeupKind::Epoll(epfd)),
            events: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    /// This wakeup's multiplexing kind.
    #[must_use]
    pub fn kind(&self) -> WakeupKind {
        *self.kind.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Re-point this wakeup at a (new) epoll instance, or detach it back to plain `Poll`.
    pub fn rebind(&self, kind: WakeupKind) {
        *self.kind.lock().unwrap_or_else(|e| e.into_inner()) = kind;
    }

    /// OR `mask` into the ready-event set and wake any thread blocked in [`Wakeup::wait`].
    pub fn raise(&self, mask: u32) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        *events |= mask;
        drop(events);
        self.condvar.notify_all();
    }

    /// Clear `mask` from the ready-event set (e.g. `EPOLLIN` once no further `ACCEPT-IN` is
    /// pending, §4.6).
    pub fn clear(&self, mask: u32) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        *events &= !mask;
    }

    /// Currently asserted events, without blocking.
    #[must_use]
    pub fn ready(&self) -> u32 {
        *self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until at least one event is asserted, with no timeout (blocking `accept`, blocking
    /// `recv`).
    #[must_use]
    pub fn wait(&self) -> u32 {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        while *events == 0 {
            events = self
                .condvar
                .wait(events)
                .unwrap_or_else(|e| e.into_inner());
        }
        *events
    }

    /// Block until at least one event is asserted or `timeout` elapses (`epoll_wait`/`poll`/
    /// `select`). `None` blocks indefinitely (a negative POSIX timeout); `Some(Duration::ZERO)` is
    /// an immediate poll.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Option<Duration>) -> u32 {
        let Some(timeout) = timeout else {
            return self.wait();
        };
        if timeout.is_zero() {
            return self.ready();
        }
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if *events == 0 {
            let (guard, _timed_out) = self
                .condvar
                .wait_timeout(events, timeout)
                .unwrap_or_else(|e| e.into_inner());
            events = guard;
        }
        *events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn raise_then_wait_returns_immediately() {
        let w = Wakeup::new_poll();
        w.raise(EVENT_IN);
        assert_eq!(w.wait(), EVENT_IN);
    }

    #[test]
    fn wait_timeout_zero_is_a_poll() {
        let w = Wakeup::new_poll();
        assert_eq!(w.wait_timeout(Some(Duration::ZERO)), 0);
    }

    #[test]
    fn clear_removes_only_requested_bits() {
        let w = Wakeup::new_poll();
        w.raise(EVENT_IN | EVENT_OUT);
        w.clear(EVENT_IN);
        assert_eq!(w.ready(), EVENT_OUT);
    }

    #[test]
    fn blocking_wait_wakes_on_raise_from_another_thread() {
        let w = Arc::new(Wakeup::new_poll());
        let w2 = w.clone();
        let handle = thread::spawn(move || w2.wait());
        thread::sleep(Duration::from_millis(20));
        w.raise(EVENT_IN);
        assert_eq!(handle.join().unwrap(), EVENT_IN);
    }
}
