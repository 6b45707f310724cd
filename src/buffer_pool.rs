//! Scratch buffer pool shared by the level caches
//!
//! The pool owns a byte budget rather than the memory itself. Each
//! [`PooledBuffer`] charges its length against the budget while alive and
//! returns it on drop, so a single pool bounds the cache memory of every
//! tree that shares it.

use crate::error::{IntegrityError, Result};
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Buffer pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Total byte budget
    pub capacity: usize,
    /// Bytes currently handed out
    pub allocated: usize,
    /// Highest value `allocated` has reached
    pub peak: usize,
    /// Allocations refused for lack of budget
    pub failures: u64,
}

impl BufferPoolStats {
    /// Fraction of the budget in use, as a percentage
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            (self.allocated as f64 / self.capacity as f64) * 100.0
        }
    }
}

#[derive(Debug)]
struct PoolState {
    allocated: usize,
    peak: usize,
    failures: u64,
}

/// Byte-budgeted scratch buffer pool
#[derive(Debug)]
pub struct BufferPool {
    capacity: usize,
    state: Mutex<PoolState>,
}

impl BufferPool {
    /// Create a pool with a budget of `capacity` bytes
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(BufferPool {
            capacity,
            state: Mutex::new(PoolState {
                allocated: 0,
                peak: 0,
                failures: 0,
            }),
        })
    }

    /// Allocate a zeroed buffer of `size` bytes
    pub fn allocate(self: &Arc<Self>, size: usize) -> Result<PooledBuffer> {
        {
            let mut state = self.state.lock();
            let available = self.capacity - state.allocated;
            if size > available {
                state.failures += 1;
                return Err(IntegrityError::BufferAllocationFailed {
                    requested: size,
                    available,
                });
            }
            state.allocated += size;
            state.peak = state.peak.max(state.allocated);
        }

        Ok(PooledBuffer {
            data: vec![0; size],
            pool: Arc::clone(self),
        })
    }

    fn release(&self, size: usize) {
        let mut state = self.state.lock();
        state.allocated -= size;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BufferPoolStats {
        let state = self.state.lock();
        BufferPoolStats {
            capacity: self.capacity,
            allocated: state.allocated,
            peak: state.peak,
            failures: state.failures,
        }
    }
}

/// Buffer charged against a [`BufferPool`] budget until dropped
pub struct PooledBuffer {
    data: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(self.data.len());
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .finish()
    }
}
