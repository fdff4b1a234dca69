//! # Bounded Memory Pool
//!
//! Caps the amount of in-flight request memory to apply backpressure on
//! producers.
//!
//! The pool does not recycle physical memory; it bounds how much may be
//! live concurrently. When no capacity is available, `allocate` blocks the
//! *caller's own* thread (never a carrier thread) until capacity is
//! reclaimed or the configured maximum block time elapses, at which point
//! the allocation fails with a typed error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Configuration for the bounded memory pool.
#[derive(Debug, Clone)]
pub struct MemoryPoolConfig {
    /// Total capacity in bytes.
    pub capacity: usize,
    /// Maximum time an allocation may block waiting for capacity.
    pub max_block_time: Duration,
}

impl Default for MemoryPoolConfig {
    fn default() -> Self {
        Self {
            capacity: 16 * 1024 * 1024, // 16 MiB
            max_block_time: Duration::from_secs(1),
        }
    }
}

impl MemoryPoolConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> MemoryPoolConfigBuilder {
        MemoryPoolConfigBuilder::default()
    }
}

/// Builder for [`MemoryPoolConfig`].
#[derive(Debug, Default)]
pub struct MemoryPoolConfigBuilder {
    capacity: Option<usize>,
    max_block_time: Option<Duration>,
}

impl MemoryPoolConfigBuilder {
    /// Sets the total capacity in bytes.
    #[must_use]
    pub fn capacity(mut self, bytes: usize) -> Self {
        self.capacity = Some(bytes);
        self
    }

    /// Sets the maximum block time for allocations.
    #[must_use]
    pub fn max_block_time(mut self, duration: Duration) -> Self {
        self.max_block_time = Some(duration);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> MemoryPoolConfig {
        MemoryPoolConfig {
            capacity: self.capacity.unwrap_or(16 * 1024 * 1024),
            max_block_time: self.max_block_time.unwrap_or(Duration::from_secs(1)),
        }
    }
}

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The request can never be satisfied.
    #[error("requested {requested} bytes exceeds pool capacity {capacity}")]
    RequestTooLarge {
        /// Requested size in bytes.
        requested: usize,
        /// Total pool capacity in bytes.
        capacity: usize,
    },

    /// No capacity became available within the maximum block time.
    #[error("allocation of {requested} bytes timed out after {waited:?}")]
    CapacityExhausted {
        /// Requested size in bytes.
        requested: usize,
        /// How long the caller waited.
        waited: Duration,
    },
}

/// A block of memory accounted against the pool.
///
/// Return it with [`BoundedMemoryPool::reclaim`] to release its capacity;
/// dropping it without reclaiming leaks capacity for the pool's lifetime.
#[derive(Debug)]
pub struct PooledBlock {
    data: Vec<u8>,
}

impl PooledBlock {
    /// Returns the block size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the block is zero-sized.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the block contents.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Returns the block contents mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Counters for pool activity.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    allocations: AtomicU64,
    failures: AtomicU64,
    waits: AtomicU64,
}

impl PoolMetrics {
    fn record_allocation(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_wait(&self) {
        self.waits.fetch_add(1, Ordering::Relaxed);
    }

    /// Total successful allocations.
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Allocations that failed after the block-time deadline.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Times an allocation had to wait for reclaimed capacity.
    #[must_use]
    pub fn waits(&self) -> u64 {
        self.waits.load(Ordering::Relaxed)
    }

    /// Returns a point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            allocations: self.allocations(),
            failures: self.failures(),
            waits: self.waits(),
        }
    }
}

/// Snapshot of pool metrics for reporting.
#[derive(Debug, Clone, Copy)]
pub struct PoolMetricsSnapshot {
    /// Total successful allocations.
    pub allocations: u64,
    /// Allocations that failed after the deadline.
    pub failures: u64,
    /// Times an allocation waited.
    pub waits: u64,
}

/// Fixed-capacity memory accounting with blocking allocation.
pub struct BoundedMemoryPool {
    available: Mutex<usize>,
    reclaimed: Condvar,
    capacity: usize,
    max_block_time: Duration,
    metrics: PoolMetrics,
}

impl BoundedMemoryPool {
    /// Creates a pool with the given configuration.
    #[must_use]
    pub fn new(config: MemoryPoolConfig) -> Self {
        Self {
            available: Mutex::new(config.capacity),
            reclaimed: Condvar::new(),
            capacity: config.capacity,
            max_block_time: config.max_block_time,
            metrics: PoolMetrics::default(),
        }
    }

    /// Returns the total pool capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the currently available capacity in bytes.
    #[must_use]
    pub fn available(&self) -> usize {
        *self.available.lock()
    }

    /// Returns the pool metrics.
    #[must_use]
    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    /// Reserves `size` bytes, blocking until capacity is available or the
    /// maximum block time elapses.
    ///
    /// Re-checks on every reclaim signal. Blocks the calling thread; never
    /// call this from a job on a carrier thread.
    ///
    /// # Errors
    ///
    /// [`PoolError::RequestTooLarge`] if `size` exceeds the pool capacity;
    /// [`PoolError::CapacityExhausted`] if the deadline elapses first.
    pub fn allocate(&self, size: usize) -> Result<PooledBlock, PoolError> {
        if size > self.capacity {
            return Err(PoolError::RequestTooLarge {
                requested: size,
                capacity: self.capacity,
            });
        }

        let start = Instant::now();
        let deadline = start + self.max_block_time;
        let mut available = self.available.lock();

        loop {
            if *available >= size {
                *available -= size;
                drop(available);
                self.metrics.record_allocation();
                tracing::trace!(size, "allocated");
                return Ok(PooledBlock {
                    data: vec![0; size],
                });
            }

            if Instant::now() >= deadline {
                drop(available);
                self.metrics.record_failure();
                tracing::trace!(size, "allocation timed out");
                return Err(PoolError::CapacityExhausted {
                    requested: size,
                    waited: start.elapsed(),
                });
            }

            self.metrics.record_wait();
            // Timeout here is re-checked against the deadline above.
            let _ = self.reclaimed.wait_until(&mut available, deadline);
        }
    }

    /// Returns a block's capacity to the pool and wakes all waiters so
    /// they re-check availability.
    pub fn reclaim(&self, block: PooledBlock) {
        let size = block.len();
        {
            let mut available = self.available.lock();
            *available = (*available + size).min(self.capacity);
        }
        tracing::trace!(size, "reclaimed");
        self.reclaimed.notify_all();
    }
}

impl std::fmt::Debug for BoundedMemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedMemoryPool")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .field("max_block_time", &self.max_block_time)
            .finish_non_exhaustive()
    }
}
