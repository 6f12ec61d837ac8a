//! Lock-free packet buffer pool
//!
//! Buffers are sized to the maximum proxy packet size (MTU minus IPv4 and
//! UDP header lengths) and recycled through a `crossbeam-queue::ArrayQueue`
//! so concurrent relay tasks never contend on a lock. When the free list is
//! empty the pool allocates; when it is full, returned buffers are dropped.
//!
//! # Ownership
//!
//! A [`PooledBuffer`] has a single owner from checkout to return. Returning
//! happens in `Drop`, so every code path that abandons a packet (decrypt
//! failure, full send queue, shutdown) gives the buffer back exactly once.
//!
//! # Example
//!
//! ```
//! use swgp_relay::io::PacketBufferPool;
//! use std::sync::Arc;
//!
//! let pool = Arc::new(PacketBufferPool::new(1392));
//!
//! let buffer = pool.acquire();
//! assert_eq!(buffer.len(), 1392);
//!
//! // Returned to the pool when dropped.
//! drop(buffer);
//! assert_eq!(pool.stats().returns(), 1);
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Default free-list capacity (number of buffers kept at rest)
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Statistics for the buffer pool
#[derive(Debug)]
pub struct BufferPoolStats {
    /// Number of new buffer allocations (free list was empty)
    allocations: AtomicU64,
    /// Number of buffer reuses from the free list
    reuses: AtomicU64,
    /// Number of buffers returned to the free list
    returns: AtomicU64,
    /// Number of buffers dropped on return (free list was full)
    drops: AtomicU64,
}

impl BufferPoolStats {
    fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
            returns: AtomicU64::new(0),
            drops: AtomicU64::new(0),
        }
    }

    /// Get the number of allocations
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Get the number of reuses
    #[must_use]
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    /// Get the number of returns
    #[must_use]
    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    /// Get the number of drops
    #[must_use]
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all stats
    #[must_use]
    pub fn snapshot(&self) -> BufferPoolStatsSnapshot {
        BufferPoolStatsSnapshot {
            allocations: self.allocations(),
            reuses: self.reuses(),
            returns: self.returns(),
            drops: self.drops(),
        }
    }
}

/// Snapshot of buffer pool statistics
#[derive(Debug, Clone, Copy)]
pub struct BufferPoolStatsSnapshot {
    /// Number of new buffer allocations
    pub allocations: u64,
    /// Number of buffer reuses
    pub reuses: u64,
    /// Number of buffers returned
    pub returns: u64,
    /// Number of buffers dropped (free list full)
    pub drops: u64,
}

/// A lock-free pool of fixed-size packet buffers.
#[derive(Debug)]
pub struct PacketBufferPool {
    /// Lock-free free list
    buffers: ArrayQueue<Vec<u8>>,
    /// Size of each buffer
    buffer_size: usize,
    /// Pool statistics
    stats: BufferPoolStats,
}

impl PacketBufferPool {
    /// Create a pool of `buffer_size`-byte buffers with the default
    /// free-list capacity.
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY, buffer_size)
    }

    /// Create a pool with an explicit free-list capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize, buffer_size: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(capacity),
            buffer_size,
            stats: BufferPoolStats::new(),
        }
    }

    /// Get a buffer from the free list or allocate a new one.
    ///
    /// Reused buffers are not zeroed: the receive syscall overwrites the
    /// data, so a memset per packet would be wasted work on the hot path.
    #[must_use]
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buffer = if let Some(mut buf) = self.buffers.pop() {
            self.stats.reuses.fetch_add(1, Ordering::Relaxed);
            buf.clear();
            if buf.capacity() >= self.buffer_size {
                // Safety: capacity was allocated at buffer_size and the
                // contents are only ever used as a receive target.
                unsafe { buf.set_len(self.buffer_size) };
            } else {
                buf.resize(self.buffer_size, 0);
            }
            buf
        } else {
            self.stats.allocations.fetch_add(1, Ordering::Relaxed);
            vec![0u8; self.buffer_size]
        };

        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(self),
        }
    }

    /// Return a buffer to the free list, dropping it if the list is full.
    fn release(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        match self.buffers.push(buffer) {
            Ok(()) => {
                self.stats.returns.fetch_add(1, Ordering::Relaxed);
            }
            Err(_buf) => {
                self.stats.drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Get the buffer size
    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Get the current number of buffers at rest
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    /// Get pool statistics
    #[must_use]
    pub fn stats(&self) -> &BufferPoolStats {
        &self.stats
    }
}

/// A buffer checked out of the pool.
///
/// Returns to the pool when dropped.
#[derive(Debug)]
pub struct PooledBuffer {
    /// The underlying buffer (Option for taking on drop)
    buffer: Option<Vec<u8>>,
    /// The owning pool
    pool: Arc<PacketBufferPool>,
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buffer.take() {
            self.pool.release(buf);
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buffer.as_ref().map_or(&[], Vec::as_slice)
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buffer.as_mut().map_or(&mut [], Vec::as_mut_slice)
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl AsMut<[u8]> for PooledBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_creation() {
        let pool = Arc::new(PacketBufferPool::with_capacity(10, 1392));
        assert_eq!(pool.buffer_size(), 1392);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_acquire_and_return() {
        let pool = Arc::new(PacketBufferPool::with_capacity(10, 1392));

        // First acquire allocates
        let buf1 = pool.acquire();
        assert_eq!(buf1.len(), 1392);
        assert_eq!(pool.stats().allocations(), 1);
        assert_eq!(pool.stats().reuses(), 0);

        // Drop returns to the pool
        drop(buf1);
        assert_eq!(pool.stats().returns(), 1);
        assert_eq!(pool.available(), 1);

        // Second acquire reuses
        let _buf2 = pool.acquire();
        assert_eq!(pool.stats().allocations(), 1);
        assert_eq!(pool.stats().reuses(), 1);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_pool_full_drops() {
        let pool = Arc::new(PacketBufferPool::with_capacity(1, 64));

        let buf1 = pool.acquire();
        let buf2 = pool.acquire();
        drop(buf1);
        drop(buf2);

        // Only one slot; the second return is dropped
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.stats().returns(), 1);
        assert_eq!(pool.stats().drops(), 1);
    }

    #[test]
    fn test_reused_buffer_is_full_length() {
        let pool = Arc::new(PacketBufferPool::with_capacity(10, 256));

        let mut buf = pool.acquire();
        buf[0] = 0xAA;
        drop(buf);

        let buf = pool.acquire();
        assert_eq!(buf.len(), 256);
    }

    #[test]
    fn test_deref_and_write() {
        let pool = Arc::new(PacketBufferPool::with_capacity(10, 128));

        let mut buf = pool.acquire();
        buf[0] = 1;
        buf[127] = 2;
        assert_eq!(buf[0], 1);
        assert_eq!(buf.as_ref()[127], 2);
    }

    #[test]
    fn test_stats_snapshot() {
        let pool = Arc::new(PacketBufferPool::with_capacity(10, 64));

        let buf = pool.acquire();
        drop(buf);
        let _buf2 = pool.acquire();

        let snapshot = pool.stats().snapshot();
        assert_eq!(snapshot.allocations, 1);
        assert_eq!(snapshot.reuses, 1);
        assert_eq!(snapshot.returns, 1);
    }

    #[test]
    fn test_concurrent_access() {
        use std::thread;

        let pool = Arc::new(PacketBufferPool::with_capacity(100, 1392));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let mut buf = pool.acquire();
                        buf[0] = 42;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = pool.stats().snapshot();
        assert_eq!(stats.allocations + stats.reuses, 800);
    }
}
