// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The idle (pre-allocated transmit) buffer ring (C5).
//!
//! Wraps [`net::buffer::BufferPool`] with the watermark/replenishment bookkeeping the
//! specification describes. In a real kernel-bypass driver the idle ring is topped off from a
//! separate, larger DPDK mempool; here the pool *is* the idle ring, since buffers already return
//! to it automatically when their last [`net::buffer::PoolBuffer`] handle drops. `replenish`
//! therefore degenerates to reporting the current free count rather than performing a bulk
//! allocation — the watermark/low-water logic it drives (§4.4 step 3, §4.5) is unchanged.

use net::buffer::{BufferPool, PoolBuffer};
use tracing::trace;

/// A worker's idle transmit-buffer ring plus its low-water replenishment threshold.
pub struct IdlePool {
    pool: BufferPool,
    watermark: u32,
}

impl IdlePool {
    /// Build an idle pool of `capacity` buffers of `segment_size` bytes, replenished once free
    /// count drops to `watermark`.
    #[must_use]
    pub fn new(capacity: u32, segment_size: u16, watermark: u32) -> Self {
        Self {
            pool: BufferPool::new(capacity as usize, segment_size, 0, 0),
            watermark,
        }
    }

    /// Check out one empty transmit buffer, or `None` if the ring is exhausted.
    #[must_use]
    pub fn try_alloc(&self) -> Option<PoolBuffer> {
        self.pool.try_alloc()
    }

    /// Current number of free (not checked out) buffers.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.pool.free_count()
    }

    /// Whether free count has dropped to or below the low-water threshold (§4.4 step 3).
    #[must_use]
    pub fn below_watermark(&self) -> bool {
        self.free_count() <= self.watermark as usize
    }

    /// Handle a `ReplenishIdle` RPC: report the current free count, logging if the ring is still
    /// running dry after whatever application-side drops have already returned buffers.
    pub fn replenish(&self) -> usize {
        let free = self.free_count();
        if free <= self.watermark as usize {
            trace!(free, watermark = self.watermark, "idle ring below watermark");
        }
        free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_watermark_reflects_free_count() {
        let pool = IdlePool::new(4, 256, 1);
        assert!(!pool.below_watermark());
        let bufs: Vec<_> = (0..3).map(|_| pool.try_alloc().unwrap()).collect();
        assert!(pool.below_watermark());
        drop(bufs);
        assert!(!pool.below_watermark());
    }
}
