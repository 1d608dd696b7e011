//! Scratch buffer pool for large assemblies
//!
//! Buffers are borrowed through a guard that returns them on drop, so every
//! exit path (including errors) releases the buffer.

use crossbeam::queue::ArrayQueue;
use std::ops::{Deref, DerefMut};

/// Buffers that grew past this are dropped instead of pooled
const MAX_POOLED_CAPACITY: usize = 1 << 20;

#[derive(Debug)]
pub struct BufferPool {
    buffers: Option<ArrayQueue<String>>,
}

impl BufferPool {
    pub fn new(size: usize) -> Self {
        Self {
            buffers: (size > 0).then(|| ArrayQueue::new(size)),
        }
    }

    /// Borrow a cleared buffer with at least `capacity` bytes reserved
    pub fn acquire(&self, capacity: usize) -> PooledBuffer<'_> {
        let mut buffer = self
            .buffers
            .as_ref()
            .and_then(ArrayQueue::pop)
            .unwrap_or_default();
        buffer.clear();
        buffer.reserve(capacity);
        PooledBuffer { pool: self, buffer }
    }

    fn release(&self, buffer: String) {
        if buffer.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        if let Some(buffers) = &self.buffers {
            // Full pool: the buffer is simply dropped
            let _ = buffers.push(buffer);
        }
    }

    pub fn available(&self) -> usize {
        self.buffers.as_ref().map_or(0, ArrayQueue::len)
    }
}

/// Borrowed scratch buffer, returned to its pool on drop
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buffer: String,
}

impl Deref for PooledBuffer<'_> {
    type Target = String;

    fn deref(&self) -> &String {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut String {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buffer));
    }
}
