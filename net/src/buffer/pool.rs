// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! A pool-backed [`PacketBuffer`](crate::buffer::PacketBuffer) implementation.
//!
//! This plays the role that a DPDK mempool and `rte_mbuf` play in a real kernel-bypass driver:
//! buffers are pre-allocated once, handed out on request, and returned to the pool's free list
//! when the last handle to them drops. Unlike a real mempool this is a plain heap-backed ring, not
//! huge-page-backed shared memory, since NIC I/O itself is out of scope here.

use crate::buffer::{
    Append, Headroom, MemoryBufferNotLongEnough, NotEnoughHeadRoom, NotEnoughTailRoom, Prepend,
    Tailroom, TrimFromEnd, TrimFromStart,
};
use concurrency::sync::{Arc, Mutex, Weak};
use std::fmt;
use tracing::trace;

struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    segment_size: u16,
    headroom: u16,
    tailroom: u16,
}

/// A fixed-size pool of pre-allocated packet buffers.
///
/// Mirrors the "idle ring" of a fast-path worker: a bounded set of empty, maximum-segment-size
/// buffers that are handed out to callers and returned on drop.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool of `capacity` buffers, each with `segment_size` usable octets plus the given
    /// headroom/tailroom reserve.
    #[must_use]
    pub fn new(capacity: usize, segment_size: u16, headroom: u16, tailroom: u16) -> Self {
        let total = segment_size as usize + headroom as usize + tailroom as usize;
        let free = (0..capacity).map(|_| vec![0_u8; total]).collect();
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                segment_size,
                headroom,
                tailroom,
            }),
        }
    }

    /// Number of buffers currently available (not checked out).
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.inner.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// The per-buffer payload capacity (maximum segment size) of this pool.
    #[must_use]
    pub fn segment_size(&self) -> u16 {
        self.inner.segment_size
    }

    /// Check out one empty buffer, or `None` if the pool is exhausted.
    #[must_use]
    pub fn try_alloc(&self) -> Option<PoolBuffer> {
        let data = self
            .inner
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()?;
        Some(PoolBuffer {
            data,
            headroom: self.inner.headroom,
            tailroom: self.inner.tailroom,
            home: Arc::downgrade(&self.inner),
        })
    }

    /// Check out up to `n` buffers, stopping early if the pool runs dry.
    pub fn alloc_bulk(&self, n: usize) -> Vec<PoolBuffer> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            match self.try_alloc() {
                Some(buf) => out.push(buf),
                None => break,
            }
        }
        out
    }
}

/// A single checked-out buffer from a [`BufferPool`].
///
/// Implements [`PacketBuffer`](crate::buffer::PacketBuffer) and
/// [`PacketBufferMut`](crate::buffer::PacketBufferMut). Returns its backing allocation to the pool
/// when dropped, playing the role of the custom free hook on a DPDK `rte_mbuf`.
pub struct PoolBuffer {
    data: Vec<u8>,
    headroom: u16,
    tailroom: u16,
    home: Weak<PoolInner>,
}

impl fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("len", &self.as_ref().len())
            .field("headroom", &self.headroom)
            .field("tailroom", &self.tailroom)
            .finish()
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        let Some(home) = self.home.upgrade() else {
            trace!("pool gone, dropping buffer without recycling");
            return;
        };
        let capacity = self.data.len();
        let mut data = std::mem::take(&mut self.data);
        data.clear();
        data.resize(capacity, 0);
        home.free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(data);
    }
}

impl AsRef<[u8]> for PoolBuffer {
    fn as_ref(&self) -> &[u8] {
        let start = self.headroom as usize;
        let end = self.data.len() - self.tailroom as usize;
        &self.data[start..end]
    }
}

impl AsMut<[u8]> for PoolBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        let start = self.headroom as usize;
        let end = self.data.len() - self.tailroom as usize;
        &mut self.data[start..end]
    }
}

impl Headroom for PoolBuffer {
    fn headroom(&self) -> u16 {
        self.headroom
    }
}

impl Tailroom for PoolBuffer {
    fn tailroom(&self) -> u16 {
        self.tailroom
    }
}

impl Prepend for PoolBuffer {
    type Error = NotEnoughHeadRoom;
    fn prepend(&mut self, len: u16) -> Result<&mut [u8], Self::Error> {
        if self.headroom < len {
            return Err(NotEnoughHeadRoom);
        }
        self.headroom -= len;
        Ok(self.as_mut())
    }
}

impl Append for PoolBuffer {
    type Error = NotEnoughTailRoom;
    fn append(&mut self, len: u16) -> Result<&mut [u8], Self::Error> {
        if self.tailroom < len {
            return Err(NotEnoughTailRoom);
        }
        self.tailroom -= len;
        Ok(self.as_mut())
    }
}

impl TrimFromStart for PoolBuffer {
    type Error = MemoryBufferNotLongEnough;
    fn trim_from_start(&mut self, len: u16) -> Result<&mut [u8], MemoryBufferNotLongEnough> {
        if (self.headroom + self.tailroom + len) as usize > self.data.len() {
            return Err(MemoryBufferNotLongEnough);
        }
        self.headroom += len;
        Ok(self.as_mut())
    }
}

impl TrimFromEnd for PoolBuffer {
    type Error = MemoryBufferNotLongEnough;
    fn trim_from_end(&mut self, len: u16) -> Result<&mut [u8], MemoryBufferNotLongEnough> {
        if (self.headroom + self.tailroom + len) as usize > self.data.len() {
            return Err(MemoryBufferNotLongEnough);
        }
        self.tailroom += len;
        Ok(self.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::BufferPool;

    #[test]
    fn alloc_and_recycle() {
        let pool = BufferPool::new(4, 256, 16, 16);
        assert_eq!(pool.free_count(), 4);
        let buf = pool.try_alloc().expect("pool should not be empty");
        assert_eq!(pool.free_count(), 3);
        drop(buf);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn exhaustion_returns_none() {
        let pool = BufferPool::new(1, 256, 0, 0);
        let _first = pool.try_alloc().expect("first alloc succeeds");
        assert!(pool.try_alloc().is_none());
    }

    #[test]
    fn alloc_bulk_stops_at_exhaustion() {
        let pool = BufferPool::new(2, 64, 0, 0);
        let bufs = pool.alloc_bulk(5);
        assert_eq!(bufs.len(), 2);
    }
}
