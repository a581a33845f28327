//! Process-wide admission control for open file descriptors.
//!
//! Reader sets acquire their whole descriptor budget up front and hold an [`FdPermit`]
//! until they close. Acquisition retries with a bounded backoff and then fails with
//! [`ReadError::FdBudgetExhausted`], which callers may retry later.

use crate::error::{ReadError, Result};
use crate::telemetry::{reader_metrics, ReaderEvent, ReaderEventListener};

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Debug)]
pub struct FdLimiter {
    capacity: usize,
    in_use: Mutex<usize>,
    released: Condvar,
}

impl FdLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_use: Mutex::new(0),
            released: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.in_use
            .lock()
            .map(|used| self.capacity.saturating_sub(*used))
            .unwrap_or(0)
    }

    /// Takes `count` descriptors from the budget without waiting.
    pub fn try_acquire(self: &Arc<Self>, count: usize) -> Result<Option<FdPermit>> {
        let mut used = self.in_use.lock()?;
        if self.capacity.saturating_sub(*used) >= count {
            *used += count;
            return Ok(Some(FdPermit {
                limiter: Arc::clone(self),
                count,
            }));
        }
        Ok(None)
    }

    /// Takes `count` descriptors, waiting up to `backoff` between each of `retries` attempts.
    pub fn acquire(
        self: &Arc<Self>,
        count: usize,
        retries: u32,
        backoff: Duration,
        events: &dyn ReaderEventListener,
    ) -> Result<FdPermit> {
        if count > self.capacity {
            reader_metrics::record_fd_acquire_failure();
            return Err(ReadError::FdBudgetExhausted {
                requested: count,
                available: self.capacity,
            });
        }

        let mut used = self.in_use.lock()?;
        let mut attempt = 0u32;
        loop {
            let available = self.capacity.saturating_sub(*used);
            if available >= count {
                *used += count;
                return Ok(FdPermit {
                    limiter: Arc::clone(self),
                    count,
                });
            }
            if attempt >= retries {
                reader_metrics::record_fd_acquire_failure();
                return Err(ReadError::FdBudgetExhausted {
                    requested: count,
                    available,
                });
            }
            attempt += 1;
            events.on_event(ReaderEvent::FdAcquireRetry {
                requested: count,
                available,
                attempt,
            });
            // Linear backoff; a release wakes waiters early.
            let wait = backoff.saturating_mul(attempt);
            let (guard, _timeout) = self.released.wait_timeout(used, wait)?;
            used = guard;
        }
    }

    fn release(&self, count: usize) {
        if let Ok(mut used) = self.in_use.lock() {
            *used = used.saturating_sub(count);
        }
        self.released.notify_all();
    }
}

/// A held share of the descriptor budget, returned on drop.
#[derive(Debug)]
pub struct FdPermit {
    limiter: Arc<FdLimiter>,
    count: usize,
}

impl FdPermit {
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Drop for FdPermit {
    fn drop(&mut self) {
        self.limiter.release(self.count);
    }
}
