//! Bounded pool of reusable byte buffers for serialization scratch space.
//!
//! A buffer is acquired for the span of one operation and handed back when the
//! guard drops, on every exit path. Buffers that grew past the pool's capacity
//! limit are discarded instead of being returned.

use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

/// Largest buffer capacity kept for reuse (256 KiB, room for a log line with
/// a full stack trace).
pub const MAX_POOLED_CAPACITY: usize = 256 * 1024;

/// Maximum number of idle buffers retained.
pub const MAX_POOLED_BUFFERS: usize = 64;

/// Initial capacity of freshly allocated buffers.
const INITIAL_CAPACITY: usize = 1024;

static SHARED: BufferPool = BufferPool::new(MAX_POOLED_BUFFERS, MAX_POOLED_CAPACITY);

/// Acquire a cleared buffer from the process-wide pool.
pub fn acquire() -> PooledBuffer<'static> {
    SHARED.acquire()
}

/// A bounded free-list of byte buffers.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_buffers: usize,
    max_capacity: usize,
}

impl BufferPool {
    /// Create an empty pool retaining at most `max_buffers` buffers of at most
    /// `max_capacity` bytes each.
    pub const fn new(max_buffers: usize, max_capacity: usize) -> Self {
        Self {
            free: parking_lot::const_mutex(Vec::new()),
            max_buffers,
            max_capacity,
        }
    }

    /// Take a cleared buffer, allocating one if the pool is empty.
    pub fn acquire(&self) -> PooledBuffer<'_> {
        let buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(INITIAL_CAPACITY));

        PooledBuffer { pool: self, buf }
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() > self.max_capacity {
            return;
        }
        buf.clear();

        let mut free = self.free.lock();
        if free.len() < self.max_buffers {
            free.push(buf);
        }
    }
}

/// A buffer on loan from a [`BufferPool`]; returned on drop.
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buf: Vec<u8>,
}

impl Deref for PooledBuffer<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}
