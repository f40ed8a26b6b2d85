//! Process-wide buffer pool for body pumps.
//!
//! # Design Decisions
//! - Fixed 64 KiB buffers; the size is a compile-time constant, not a
//!   config knob
//! - Bounded free list: beyond the cap, returned buffers are simply freed
//! - RAII: dropping a `PooledBuffer` returns it to the pool

use std::ops::{Deref, DerefMut};
use std::sync::{LazyLock, Mutex};

/// Size of every pooled copy buffer.
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Upper bound on retained free buffers.
const MAX_FREE_BUFFERS: usize = 64;

static GLOBAL_POOL: LazyLock<BufferPool> = LazyLock::new(BufferPool::new);

/// The shared process-wide pool.
pub fn global_pool() -> &'static BufferPool {
    &GLOBAL_POOL
}

/// A thread-safe pool of fixed-size copy buffers.
pub struct BufferPool {
    free: Mutex<Vec<Box<[u8]>>>,
}

impl BufferPool {
    fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Take a buffer from the pool, allocating if the free list is empty.
    pub fn acquire(&'static self) -> PooledBuffer {
        let recycled = {
            let mut free = self.free.lock().expect("buffer pool mutex poisoned");
            free.pop()
        };
        let buf = recycled.unwrap_or_else(|| vec![0u8; COPY_BUFFER_SIZE].into_boxed_slice());
        PooledBuffer {
            buf: Some(buf),
            pool: self,
        }
    }

    fn release(&self, buf: Box<[u8]>) {
        let mut free = self.free.lock().expect("buffer pool mutex poisoned");
        if free.len() < MAX_FREE_BUFFERS {
            free.push(buf);
        }
    }

    #[cfg(test)]
    fn free_count(&self) -> usize {
        self.free.lock().expect("buffer pool mutex poisoned").len()
    }
}

/// A buffer on loan from the pool. Returned on drop.
pub struct PooledBuffer {
    buf: Option<Box<[u8]>>,
    pool: &'static BufferPool,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buf.as_deref().expect("buffer already returned")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_deref_mut().expect("buffer already returned")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
