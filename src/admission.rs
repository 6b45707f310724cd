//! Process-wide admission control for tree reads and writes
//!
//! Two counting semaphores bound how many reads and writes may be in flight
//! across every tree in the process. A caller that cannot get a permit within
//! the fast-path timeout runs a callback (the tree flushes its caches to hand
//! buffers back to the shared pool) and then waits without a deadline.

use crate::config::TreeConfig;
use crate::error::Result;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::warn;

/// Reference permit capacity for each semaphore
pub const ACCESS_COUNT_MAX: usize = 5;
/// Reference fast-path wait
pub const ACCESS_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct SemaphoreState {
    available: usize,
    peak_in_use: usize,
}

/// Counting semaphore with timed and blocking acquisition
#[derive(Debug)]
pub struct AccessSemaphore {
    capacity: usize,
    state: Mutex<SemaphoreState>,
    released: Condvar,
}

impl AccessSemaphore {
    pub fn new(capacity: usize) -> Self {
        AccessSemaphore {
            capacity,
            state: Mutex::new(SemaphoreState {
                available: capacity,
                peak_in_use: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Try to take a permit, waiting at most `timeout`
    pub fn try_acquire_for(&self, timeout: Duration) -> Option<AccessPermit<'_>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        while state.available == 0 {
            if self.released.wait_until(&mut state, deadline).timed_out() && state.available == 0 {
                return None;
            }
        }

        self.take(&mut state);
        Some(AccessPermit { semaphore: self })
    }

    /// Take a permit, waiting as long as necessary
    pub fn acquire(&self) -> AccessPermit<'_> {
        let mut state = self.state.lock();
        while state.available == 0 {
            self.released.wait(&mut state);
        }

        self.take(&mut state);
        AccessPermit { semaphore: self }
    }

    fn take(&self, state: &mut SemaphoreState) {
        state.available -= 1;
        state.peak_in_use = state.peak_in_use.max(self.capacity - state.available);
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.available += 1;
        debug_assert!(state.available <= self.capacity);
        self.released.notify_one();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently held
    pub fn in_use(&self) -> usize {
        self.capacity - self.state.lock().available
    }

    /// Most permits ever held at once
    pub fn peak(&self) -> usize {
        self.state.lock().peak_in_use
    }
}

/// Held permit; released on drop, on every exit path
#[derive(Debug)]
pub struct AccessPermit<'a> {
    semaphore: &'a AccessSemaphore,
}

impl Drop for AccessPermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

/// Read and write semaphores shared by every tree that holds the pair
#[derive(Debug)]
pub struct AccessSemaphorePair {
    read: AccessSemaphore,
    write: AccessSemaphore,
    timeout: Duration,
}

impl AccessSemaphorePair {
    pub fn new(capacity: usize, timeout: Duration) -> Arc<Self> {
        Arc::new(AccessSemaphorePair {
            read: AccessSemaphore::new(capacity),
            write: AccessSemaphore::new(capacity),
            timeout,
        })
    }

    /// Private pair sized by a [`TreeConfig`]
    pub fn from_config(config: &TreeConfig) -> Arc<Self> {
        Self::new(config.access_count_max, config.access_timeout())
    }

    /// The process-wide pair, created with the reference limits on first use
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<AccessSemaphorePair>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Self::new(ACCESS_COUNT_MAX, ACCESS_TIMEOUT)))
    }

    pub fn read(&self) -> &AccessSemaphore {
        &self.read
    }

    pub fn write(&self) -> &AccessSemaphore {
        &self.write
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Acquire a read permit, running `on_timeout` if the fast path times out
    pub fn acquire_read<F>(&self, on_timeout: F) -> Result<AccessPermit<'_>>
    where
        F: FnOnce() -> Result<()>,
    {
        Self::acquire_with_fallback(&self.read, self.timeout, "read", on_timeout)
    }

    /// Acquire a write permit, running `on_timeout` if the fast path times out
    pub fn acquire_write<F>(&self, on_timeout: F) -> Result<AccessPermit<'_>>
    where
        F: FnOnce() -> Result<()>,
    {
        Self::acquire_with_fallback(&self.write, self.timeout, "write", on_timeout)
    }

    fn acquire_with_fallback<'a, F>(
        semaphore: &'a AccessSemaphore,
        timeout: Duration,
        kind: &str,
        on_timeout: F,
    ) -> Result<AccessPermit<'a>>
    where
        F: FnOnce() -> Result<()>,
    {
        if let Some(permit) = semaphore.try_acquire_for(timeout) {
            return Ok(permit);
        }

        warn!(
            "{} admission timed out after {:?}, flushing caches before waiting",
            kind, timeout
        );
        on_timeout()?;
        Ok(semaphore.acquire())
    }
}
