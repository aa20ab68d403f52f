//! A fixed-size ring of device buffers backed by a bounded free pool. Ring
//! depth is set by `HARMONICS_DEVICE_RING_SIZE` (default 3); the pool cap is
//! set by `HARMONICS_DEVICE_POOL_LIMIT` (default twice the ring size). When
//! a ring slot's buffer is too small for the next copy, it is handed to the
//! pool and a larger buffer takes its place — preferring a pool buffer that
//! is already big enough over a fresh allocation. Buffers pushed past the
//! pool's cap are freed outright.

use std::env;

use super::{DeviceBuffer, HostBuffer};

const DEFAULT_RING_SIZE: usize = 3;
const DEFAULT_POOL_MULTIPLIER: usize = 2;

fn env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|v| v.parse().ok()).filter(|&n: &usize| n > 0)
}

fn ring_size_from_env() -> usize {
    env_usize("HARMONICS_DEVICE_RING_SIZE").unwrap_or(DEFAULT_RING_SIZE)
}

/// Bounded free list of device buffers evicted from the ring. `acquire`
/// reuses the smallest sufficiently large buffer already in the pool before
/// falling back to a fresh allocation; `release` frees outright once the
/// pool is at capacity.
pub struct DevicePool {
    capacity: usize,
    free: Vec<HostBuffer>,
}

impl DevicePool {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), free: Vec::new() }
    }

    /// Sized from `HARMONICS_DEVICE_POOL_LIMIT`, defaulting to twice
    /// `ring_size`.
    pub fn from_env(ring_size: usize) -> Self {
        Self::new(env_usize("HARMONICS_DEVICE_POOL_LIMIT").unwrap_or(ring_size * DEFAULT_POOL_MULTIPLIER))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// Takes a buffer of capacity >= `needed` from the pool if one exists,
    /// else allocates a fresh one sized exactly to `needed`.
    pub fn acquire(&mut self, needed: usize) -> HostBuffer {
        if let Some(pos) = self.free.iter().position(|b| b.capacity() >= needed) {
            self.free.remove(pos)
        } else {
            HostBuffer::new(needed)
        }
    }

    /// Returns a buffer to the pool, freeing it instead when the pool is
    /// already at its cap.
    pub fn release(&mut self, buf: HostBuffer) {
        if self.free.len() < self.capacity {
            self.free.push(buf);
        }
    }

    pub fn clear_all(&mut self) {
        self.free.clear();
    }
}

/// Round-robins over a fixed set of buffers. `acquire(needed)` returns the
/// next slot, growing it through the backing [`DevicePool`] first if it is
/// too small for the requested byte count.
pub struct DeviceRing {
    slots: Vec<HostBuffer>,
    cursor: usize,
    pool: DevicePool,
}

impl DeviceRing {
    /// `buffer_capacity` is the initial byte capacity of each ring slot.
    pub fn from_env(buffer_capacity: usize) -> Self {
        let ring_size = ring_size_from_env();
        let pool = DevicePool::from_env(ring_size);
        Self::new(ring_size, pool, buffer_capacity)
    }

    pub fn new(ring_size: usize, pool: DevicePool, buffer_capacity: usize) -> Self {
        let slots = (0..ring_size.max(1)).map(|_| HostBuffer::new(buffer_capacity)).collect();
        Self { slots, cursor: 0, pool }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn pool_capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    /// Returns the next buffer in round-robin order, big enough to hold
    /// `needed` bytes. If the slot currently in rotation is too small, it is
    /// released to the pool and replaced by a buffer drawn from (or, on a
    /// pool miss, allocated fresh for) the pool.
    pub fn acquire(&mut self, needed: usize) -> &mut dyn DeviceBuffer {
        let idx = self.cursor;
        self.cursor = (self.cursor + 1) % self.slots.len();
        if self.slots[idx].capacity() < needed {
            let grown = self.pool.acquire(needed);
            let evicted = std::mem::replace(&mut self.slots[idx], grown);
            self.pool.release(evicted);
        }
        &mut self.slots[idx]
    }

    /// Drops every ring and pool buffer; used between cycles that must not
    /// retain stale device state.
    pub fn clear_all(&mut self) {
        for slot in &mut self.slots {
            let capacity = slot.capacity();
            *slot = HostBuffer::new(capacity);
        }
        self.cursor = 0;
        self.pool.clear_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_three_slots_without_env() {
        std::env::remove_var("HARMONICS_DEVICE_RING_SIZE");
        std::env::remove_var("HARMONICS_DEVICE_POOL_LIMIT");
        let ring = DeviceRing::from_env(64);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.pool_capacity(), 6);
    }

    #[test]
    fn cursor_wraps_around() {
        let mut ring = DeviceRing::new(2, DevicePool::new(4), 16);
        let _ = ring.acquire(8);
        let _ = ring.acquire(8);
        let _ = ring.acquire(8);
        assert_eq!(ring.cursor, 1);
    }

    #[test]
    fn undersized_slot_is_evicted_to_pool_and_grown() {
        let mut ring = DeviceRing::new(1, DevicePool::new(4), 4);
        let _ = ring.acquire(4);
        assert_eq!(ring.pool_len(), 0);
        let _ = ring.acquire(64);
        assert_eq!(ring.pool_len(), 1, "the too-small 4-byte buffer should have been pooled");
        assert!(ring.slots[0].capacity() >= 64);
    }

    #[test]
    fn pool_reuses_buffer_over_fresh_allocation() {
        let mut pool = DevicePool::new(2);
        pool.release(HostBuffer::new(128));
        let buf = pool.acquire(64);
        assert_eq!(buf.capacity(), 128, "should reuse the pooled 128-byte buffer rather than allocate exactly 64");
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn pool_frees_past_capacity_instead_of_growing_unbounded() {
        let mut pool = DevicePool::new(1);
        pool.release(HostBuffer::new(16));
        pool.release(HostBuffer::new(32));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn clear_all_empties_ring_and_pool() {
        let mut ring = DeviceRing::new(1, DevicePool::new(4), 4);
        let _ = ring.acquire(64);
        assert_eq!(ring.pool_len(), 1);
        ring.clear_all();
        assert_eq!(ring.pool_len(), 0);
        assert_eq!(ring.slots[0].capacity(), 4);
    }
}
