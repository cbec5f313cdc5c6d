//! Reusable fixed-size encode buffers
//!
//! A job checks a buffer out, encodes rows into it, hands the filled prefix to
//! the bulk writer and checks the buffer back in. The pool keeps at most
//! `capacity` idle buffers; anything returned beyond that is dropped.
//!
//! Buffers are not zeroed between uses. Only bytes written up to the
//! caller's tracked offset are meaningful.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// 1 MiB per buffer
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Idle buffers retained by the pool
pub const DEFAULT_POOL_CAPACITY: usize = 4;

pub type PooledBuffer = Box<[u8]>;

#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    capacity: usize,
    idle: Mutex<Vec<PooledBuffer>>,
}

impl BufferPool {
    pub fn new(buffer_size: usize, capacity: usize) -> Self {
        Self {
            buffer_size,
            capacity,
            idle: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Check out an idle buffer, allocating one when the pool is empty
    pub fn take_buffer(&self) -> PooledBuffer {
        if let Some(buf) = self.idle().pop() {
            return buf;
        }
        tracing::trace!(size = self.buffer_size, "Allocating encode buffer");
        vec![0u8; self.buffer_size].into_boxed_slice()
    }

    /// Check a buffer back in
    ///
    /// Dropped instead when the pool is full or the buffer has a foreign size.
    pub fn return_buffer(&self, buf: PooledBuffer) {
        if buf.len() != self.buffer_size {
            return;
        }
        let mut idle = self.idle();
        if idle.len() < self.capacity {
            idle.push(buf);
        }
    }

    /// Number of idle buffers currently held
    pub fn idle_count(&self) -> usize {
        self.idle().len()
    }

    fn idle(&self) -> MutexGuard<'_, Vec<PooledBuffer>> {
        // push and pop leave the vector consistent
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_POOL_CAPACITY)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_empty_pool_allocates_exact_size() {
        let pool = BufferPool::new(4096, 4);
        let buf = pool.take_buffer();
        assert_eq!(buf.len(), 4096);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_default_sizes() {
        let pool = BufferPool::default();
        assert_eq!(pool.take_buffer().len(), 1024 * 1024);
        assert_eq!(pool.capacity(), 4);
    }

    #[test]
    fn test_pool_never_exceeds_capacity() {
        let pool = BufferPool::new(64, 4);
        let taken: Vec<_> = (0..10).map(|_| pool.take_buffer()).collect();
        for buf in taken {
            pool.return_buffer(buf);
            assert!(pool.idle_count() <= 4);
        }
        assert_eq!(pool.idle_count(), 4);

        // Interleaved take/return keeps the bound too
        for round in 0..20 {
            let a = pool.take_buffer();
            let b = pool.take_buffer();
            if round % 2 == 0 {
                pool.return_buffer(a);
            }
            pool.return_buffer(b);
            assert!(pool.idle_count() <= 4);
        }
    }

    #[test]
    fn test_returned_buffer_is_reused() {
        let pool = BufferPool::new(16, 2);
        let mut buf = pool.take_buffer();
        buf[0] = 0xAB;
        pool.return_buffer(buf);

        let again = pool.take_buffer();
        // not zeroed on reuse
        assert_eq!(again[0], 0xAB);
    }

    #[test]
    fn test_foreign_size_is_discarded() {
        let pool = BufferPool::new(16, 2);
        pool.return_buffer(vec![0u8; 8].into_boxed_slice());
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_concurrent_checkout() {
        let pool = Arc::new(BufferPool::new(32, 4));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let buf = pool.take_buffer();
                        assert_eq!(buf.len(), 32);
                        pool.return_buffer(buf);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.idle_count() <= 4);
    }
}
