//! Fixed-size buffer pools.
//!
//! All byte and sample buffers used by the pipelines come from pools created
//! at context setup. Exhaustion is a soft error: the allocation returns
//! `None`, the caller logs and degrades (drops the frame remainder, produces
//! silence). Buffers return to their pool when the last owner drops them.

use std::sync::{Arc, Mutex};
use tracing::error;

struct PoolInner<T> {
    free: Mutex<Vec<Vec<T>>>,
    buffer_size: usize,
    max_buffers: usize,
    allocated: Mutex<usize>,
}

/// Pool of equally sized buffers with a hard cap on live allocations.
pub struct BufferPool<T> {
    inner: Arc<PoolInner<T>>,
    name: &'static str,
}

impl<T> Clone for BufferPool<T> {
    fn clone(&self) -> Self {
        // ---
        Self {
            inner: Arc::clone(&self.inner),
            name: self.name,
        }
    }
}

impl<T: Default + Clone> BufferPool<T> {
    // ---
    /// Creates a pool handing out buffers of `buffer_size` elements,
    /// with at most `max_buffers` live at a time (0 means unlimited).
    pub fn new(name: &'static str, buffer_size: usize, max_buffers: usize) -> Self {
        // ---
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                buffer_size,
                max_buffers,
                allocated: Mutex::new(0),
            }),
            name,
        }
    }

    /// Returns the element count of buffers from this pool.
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Allocates a zeroed buffer.
    ///
    /// Returns `None` when the pool cap is reached; the failure is logged
    /// here so callers only need to handle the degraded path.
    pub fn allocate(&self) -> Option<PooledBuffer<T>> {
        // ---
        {
            let mut allocated = self.inner.allocated.lock().unwrap();
            if self.inner.max_buffers != 0 && *allocated >= self.inner.max_buffers {
                error!("pool {}: exhausted: max_buffers={}", self.name, self.inner.max_buffers);
                return None;
            }
            *allocated += 1;
        }

        let mut data = self
            .inner
            .free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_default();

        data.clear();
        data.resize(self.inner.buffer_size, T::default());

        Some(PooledBuffer {
            data,
            pool: Arc::clone(&self.inner),
        })
    }
}

/// A buffer owned by the caller and returned to its pool on drop.
pub struct PooledBuffer<T> {
    data: Vec<T>,
    pool: Arc<PoolInner<T>>,
}

impl<T> PooledBuffer<T> {
    // ---
    /// Shrinks the buffer to `len` elements.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Returns the current element count.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl<T> std::ops::Deref for PooledBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.data
    }
}

impl<T> std::ops::DerefMut for PooledBuffer<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T> Drop for PooledBuffer<T> {
    fn drop(&mut self) {
        // ---
        let data = std::mem::take(&mut self.data);
        self.pool.free.lock().unwrap().push(data);
        *self.pool.allocated.lock().unwrap() -= 1;
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for PooledBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.data.fmt(f)
    }
}
