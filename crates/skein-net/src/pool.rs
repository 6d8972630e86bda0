//! Size-classed buffer pool backing all send and receive buffers.
//!
//! [`BufferPool::rent`] hands out a [`Segment`] from the smallest size class
//! that fits the request. Each class keeps a free list and a fixed
//! allocation budget; once the budget is spent, further rents fall back to
//! plain heap allocations that are never pooled. Requests above the largest
//! class are a caller bug and fail fast.
//!
//! A [`Segment`] is owned exclusively by whichever buffer wraps it until it
//! is handed back through [`BufferPool::ret`]. Segments are tagged with the
//! id of the pool that produced them, so a segment from another pool is
//! rejected instead of corrupting a free list.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Pooled segment size classes, smallest to largest.
pub const SIZE_CLASSES: [usize; 12] = [
    16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768,
];

/// Largest rentable size.
pub const MAX_POOLED_SIZE: usize = SIZE_CLASSES[SIZE_CLASSES.len() - 1];

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Errors from [`BufferPool::rent`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    /// A zero-byte rent is a contract violation.
    #[error("cannot rent an empty segment")]
    EmptyRequest,
    /// The request exceeds the largest size class.
    #[error("requested {requested} bytes exceeds maximum pooled size {max}")]
    RequestTooLarge {
        /// Bytes requested.
        requested: usize,
        /// Largest size class available.
        max: usize,
    },
}

/// Configuration for [`BufferPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Byte budget per size class; rents beyond it become unpooled heap
    /// allocations. Default: 16 MiB.
    pub class_budget_bytes: usize,
    /// Zero segment contents when they return to the free list. Default: false.
    pub zero_on_return: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            class_budget_bytes: 16 * 1024 * 1024,
            zero_on_return: false,
        }
    }
}

/// A slice of memory drawn from one pool size class (or, past the class
/// budget, from the heap). Moves by value; there is no way to return the
/// same segment twice.
pub struct Segment {
    data: Box<[u8]>,
    class: Option<usize>,
    pool_id: u64,
}

impl Segment {
    /// Capacity in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the segment has zero capacity (never true for pool output).
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read access to the whole segment.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Write access to the whole segment.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

struct ClassPool {
    size: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    allocated: AtomicUsize,
    max_segments: usize,
}

/// Counters exposed for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Segments handed out by [`BufferPool::rent`].
    pub rented: u64,
    /// Pooled segments accepted back by [`BufferPool::ret`].
    pub returned: u64,
    /// Rents served by unpooled heap allocation after a class ran dry.
    pub heap_fallbacks: u64,
    /// Returns rejected because the segment did not belong to this pool.
    pub foreign_rejected: u64,
}

/// Size-classed segment allocator. Shared across all connections of a
/// server via `Arc`.
pub struct BufferPool {
    id: u64,
    config: PoolConfig,
    classes: Vec<ClassPool>,
    rented: AtomicU64,
    returned: AtomicU64,
    heap_fallbacks: AtomicU64,
    foreign_rejected: AtomicU64,
}

impl BufferPool {
    /// Create a pool with the given configuration.
    pub fn new(config: PoolConfig) -> Self {
        let classes = SIZE_CLASSES
            .iter()
            .map(|&size| ClassPool {
                size,
                free: Mutex::new(Vec::new()),
                allocated: AtomicUsize::new(0),
                max_segments: (config.class_budget_bytes / size).max(1),
            })
            .collect();

        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            config,
            classes,
            rented: AtomicU64::new(0),
            returned: AtomicU64::new(0),
            heap_fallbacks: AtomicU64::new(0),
            foreign_rejected: AtomicU64::new(0),
        }
    }

    /// Rent a segment of at least `min_size` bytes from the smallest class
    /// that fits.
    pub fn rent(&self, min_size: usize) -> Result<Segment, PoolError> {
        if min_size == 0 {
            return Err(PoolError::EmptyRequest);
        }
        if min_size > MAX_POOLED_SIZE {
            return Err(PoolError::RequestTooLarge {
                requested: min_size,
                max: MAX_POOLED_SIZE,
            });
        }

        let class_index = SIZE_CLASSES
            .iter()
            .position(|&size| size >= min_size)
            .unwrap_or(SIZE_CLASSES.len() - 1);
        let class = &self.classes[class_index];

        self.rented.fetch_add(1, Ordering::Relaxed);

        if let Some(data) = class.free.lock().unwrap().pop() {
            return Ok(Segment {
                data,
                class: Some(class_index),
                pool_id: self.id,
            });
        }

        if class.allocated.load(Ordering::Relaxed) < class.max_segments {
            class.allocated.fetch_add(1, Ordering::Relaxed);
            return Ok(Segment {
                data: vec![0u8; class.size].into_boxed_slice(),
                class: Some(class_index),
                pool_id: self.id,
            });
        }

        // Class budget spent; serve from the heap and never pool it.
        self.heap_fallbacks.fetch_add(1, Ordering::Relaxed);
        Ok(Segment {
            data: vec![0u8; class.size].into_boxed_slice(),
            class: None,
            pool_id: self.id,
        })
    }

    /// Return a segment to its class's free list. Segments from another
    /// pool are rejected and dropped; unpooled fallback segments are simply
    /// freed.
    pub fn ret(&self, segment: Segment) {
        if segment.pool_id != self.id {
            self.foreign_rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                pool = self.id,
                segment_pool = segment.pool_id,
                "rejected return of segment from another pool"
            );
            return;
        }

        let Some(class_index) = segment.class else {
            return; // unpooled fallback, let it drop
        };

        let class = &self.classes[class_index];
        if segment.data.len() != class.size {
            self.foreign_rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                pool = self.id,
                len = segment.data.len(),
                class = class.size,
                "rejected return of segment with mismatched class size"
            );
            return;
        }

        let mut data = segment.data;
        if self.config.zero_on_return {
            data.fill(0);
        }
        class.free.lock().unwrap().push(data);
        self.returned.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            rented: self.rented.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            heap_fallbacks: self.heap_fallbacks.load(Ordering::Relaxed),
            foreign_rejected: self.foreign_rejected.load(Ordering::Relaxed),
        }
    }
}
