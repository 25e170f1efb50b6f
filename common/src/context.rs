//! Shared context.
//!
//! Owns the byte and sample pools every pipeline allocates from. One
//! context is typically created per process and shared by all senders and
//! receivers.

use crate::pool::BufferPool;
use crate::sample::Sample;

/// Context pool parameters.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Size of one byte buffer; must hold the largest packet.
    pub max_packet_size: usize,

    /// Size of one sample buffer, in samples (all channels).
    pub max_frame_size: usize,

    /// Cap on live byte buffers (0 means unlimited).
    pub packet_pool_size: usize,

    /// Cap on live sample buffers (0 means unlimited).
    pub frame_pool_size: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        // ---
        Self {
            max_packet_size: 2048,
            max_frame_size: 640,
            packet_pool_size: 0,
            frame_pool_size: 0,
        }
    }
}

/// Process-wide pools shared by pipelines.
#[derive(Clone)]
pub struct Context {
    byte_pool: BufferPool<u8>,
    sample_pool: BufferPool<Sample>,
}

impl Context {
    // ---
    /// Creates a context with its pools.
    pub fn new(config: &ContextConfig) -> Self {
        // ---
        Self {
            byte_pool: BufferPool::new("bytes", config.max_packet_size, config.packet_pool_size),
            sample_pool: BufferPool::new("samples", config.max_frame_size, config.frame_pool_size),
        }
    }

    /// Returns the byte buffer pool.
    pub fn byte_pool(&self) -> &BufferPool<u8> {
        &self.byte_pool
    }

    /// Returns the sample buffer pool.
    pub fn sample_pool(&self) -> &BufferPool<Sample> {
        &self.sample_pool
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(&ContextConfig::default())
    }
}
