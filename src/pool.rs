//! Reusable byte and `u64` buffers for the decode paths.
//!
//! Pools are plain values threaded through constructors (usually inside an `Arc`), so tests
//! can use isolated pools. Returning a buffer is optional: a buffer that is never released
//! only costs a later allocation.

use crate::telemetry::reader_metrics;
use std::sync::Mutex;

/// A bounded free-list of `Vec<T>` buffers.
#[derive(Debug)]
pub struct SlicePool<T> {
    free: Mutex<Vec<Vec<T>>>,
    max_retained: usize,
}

impl<T: Copy + Default> SlicePool<T> {
    pub fn new(max_retained: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_retained,
        }
    }

    /// Returns a buffer of exactly `len` default-initialized elements.
    pub fn acquire(&self, len: usize) -> Vec<T> {
        let mut buf = self.acquire_empty(len);
        buf.resize(len, T::default());
        buf
    }

    /// Returns an empty buffer with capacity for at least `capacity` elements.
    pub fn acquire_empty(&self, capacity: usize) -> Vec<T> {
        let reused = self.free.lock().ok().and_then(|mut free| free.pop());
        match reused {
            Some(mut buf) => {
                reader_metrics::record_pool_hit();
                buf.clear();
                buf.reserve(capacity);
                buf
            }
            None => {
                reader_metrics::record_pool_miss();
                Vec::with_capacity(capacity)
            }
        }
    }

    /// Hands a buffer back. Dropped instead when the pool is full.
    pub fn release(&self, buf: Vec<T>) {
        if buf.capacity() == 0 {
            return;
        }
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.max_retained {
                free.push(buf);
            }
        }
    }

    /// Number of buffers currently parked in the pool.
    pub fn retained(&self) -> usize {
        self.free.lock().map(|f| f.len()).unwrap_or(0)
    }
}

/// The pools shared by every reader of a process (or of a test).
#[derive(Debug)]
pub struct BufferPools {
    pub bytes: SlicePool<u8>,
    pub u64s: SlicePool<u64>,
}

impl BufferPools {
    pub fn new(max_retained: usize) -> Self {
        Self {
            bytes: SlicePool::new(max_retained),
            u64s: SlicePool::new(max_retained),
        }
    }
}

impl Default for BufferPools {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_released_buffer_is_reused() {
        let pool: SlicePool<u8> = SlicePool::new(4);
        let mut buf = pool.acquire(1024);
        assert_eq!(buf.len(), 1024);
        buf[0] = 7;
        let ptr = buf.as_ptr();
        pool.release(buf);
        assert_eq!(pool.retained(), 1);

        let again = pool.acquire(16);
        assert_eq!(again.len(), 16);
        assert_eq!(again[0], 0, "reused buffer must be re-initialized");
        assert_eq!(again.as_ptr(), ptr);
        assert_eq!(pool.retained(), 0);
    }

    #[test]
    fn test_pool_caps_retained_buffers() {
        let pool: SlicePool<u64> = SlicePool::new(2);
        for _ in 0..5 {
            pool.release(Vec::with_capacity(8));
        }
        assert_eq!(pool.retained(), 2);
    }

    #[test]
    fn test_empty_buffers_are_not_retained() {
        let pool: SlicePool<u64> = SlicePool::new(2);
        pool.release(Vec::new());
        assert_eq!(pool.retained(), 0);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pools = Arc::new(BufferPools::new(8));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pools = Arc::clone(&pools);
                thread::spawn(move || {
                    for n in 0..200 {
                        let mut b = pools.u64s.acquire_empty(n + 1);
                        b.push(i as u64);
                        assert_eq!(b.len(), 1);
                        pools.u64s.release(b);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(pools.u64s.retained() <= 8);
    }
}
