//! I/O utilities for swgp-relay
//!
//! The hot path of the relay never allocates per packet: every datagram
//! read from the proxy listener lands in a recycled buffer from
//! [`PacketBufferPool`], travels through a session's send queue, and is
//! returned to the pool when the sender worker finishes with it.

mod buffer_pool;

pub use buffer_pool::{
    BufferPoolStats, BufferPoolStatsSnapshot, PacketBufferPool, PooledBuffer,
    DEFAULT_POOL_CAPACITY,
};
