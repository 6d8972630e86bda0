//! Pooled send and receive buffers.
//!
//! A [`SendBuffer`] is an immutable, reference-counted payload: it is built
//! through the unique [`SendBufferMut`] stage, frozen, and then cloned once
//! per additional consumer (broadcast fan-out). The backing [`Segment`]
//! goes back to the pool exactly once, when the last clone drops.
//!
//! A [`ReceiveBuffer`] wraps a single segment for the lifetime of one
//! connection. The socket task writes into `[write_pos, capacity)` and the
//! frame parser reads from `[read_pos, write_pos)`; both cursors only move
//! through bounds-checked commits. [`ReceiveBuffer::reset`] compacts any
//! unread tail to offset 0 so a partial trailing frame survives across
//! socket reads.

use std::sync::Arc;

use crate::pool::{BufferPool, PoolError, Segment};

/// Exclusive write stage of a send buffer. Freeze it into a [`SendBuffer`]
/// once the payload is written.
pub struct SendBufferMut {
    segment: Option<Segment>,
    len: usize,
    pool: Arc<BufferPool>,
}

impl SendBufferMut {
    /// Rent a segment of at least `len` bytes and expose exactly `len` of
    /// them for writing.
    pub fn rent(pool: &Arc<BufferPool>, len: usize) -> Result<Self, PoolError> {
        let segment = pool.rent(len)?;
        Ok(Self {
            segment: Some(segment),
            len,
            pool: Arc::clone(pool),
        })
    }

    /// Writable payload region.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.segment {
            Some(seg) => &mut seg.as_mut_slice()[..self.len],
            None => &mut [],
        }
    }

    /// Freeze into an immutable, shareable [`SendBuffer`].
    pub fn freeze(mut self) -> SendBuffer {
        SendBuffer {
            inner: Arc::new(SendBufferInner {
                segment: self.segment.take(),
                len: self.len,
                pool: Arc::clone(&self.pool),
            }),
        }
    }
}

impl Drop for SendBufferMut {
    fn drop(&mut self) {
        if let Some(segment) = self.segment.take() {
            self.pool.ret(segment);
        }
    }
}

struct SendBufferInner {
    segment: Option<Segment>,
    len: usize,
    pool: Arc<BufferPool>,
}

impl Drop for SendBufferInner {
    fn drop(&mut self) {
        if let Some(segment) = self.segment.take() {
            self.pool.ret(segment);
        }
    }
}

/// Immutable pooled payload. `clone` adds a reference; the segment returns
/// to the pool when the last reference drops.
#[derive(Clone)]
pub struct SendBuffer {
    inner: Arc<SendBufferInner>,
}

impl SendBuffer {
    /// Payload bytes.
    pub fn as_slice(&self) -> &[u8] {
        match &self.inner.segment {
            Some(seg) => &seg.as_slice()[..self.inner.len],
            None => &[],
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Number of live references, including this one.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl std::fmt::Debug for SendBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendBuffer")
            .field("len", &self.inner.len)
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Per-connection receive buffer with single-producer, single-consumer
/// cursors.
pub struct ReceiveBuffer {
    segment: Option<Segment>,
    pool: Arc<BufferPool>,
    read_pos: usize,
    write_pos: usize,
}

impl ReceiveBuffer {
    /// Rent a segment of at least `size` bytes for the connection's
    /// lifetime.
    pub fn new(pool: &Arc<BufferPool>, size: usize) -> Result<Self, PoolError> {
        let segment = pool.rent(size)?;
        Ok(Self {
            segment: Some(segment),
            pool: Arc::clone(pool),
            read_pos: 0,
            write_pos: 0,
        })
    }

    /// Total capacity of the backing segment.
    pub fn capacity(&self) -> usize {
        self.segment.as_ref().map(Segment::len).unwrap_or(0)
    }

    /// Bytes buffered and not yet consumed by the parser.
    pub fn data_len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Bytes available for the next socket read.
    pub fn free_len(&self) -> usize {
        self.capacity() - self.write_pos
    }

    /// Unread region `[read_pos, write_pos)`.
    pub fn read_slice(&self) -> &[u8] {
        match &self.segment {
            Some(seg) => &seg.as_slice()[self.read_pos..self.write_pos],
            None => &[],
        }
    }

    /// Free region `[write_pos, capacity)` for the next socket read.
    pub fn write_slice(&mut self) -> &mut [u8] {
        let write_pos = self.write_pos;
        match &mut self.segment {
            Some(seg) => &mut seg.as_mut_slice()[write_pos..],
            None => &mut [],
        }
    }

    /// Advance the write cursor after a socket read. Returns false if the
    /// advance would overrun capacity.
    pub fn commit_write(&mut self, n: usize) -> bool {
        if n > self.free_len() {
            return false;
        }
        self.write_pos += n;
        true
    }

    /// Advance the read cursor after the parser consumed `n` bytes.
    /// Returns false if the advance would overrun buffered data.
    pub fn commit_read(&mut self, n: usize) -> bool {
        if n > self.data_len() {
            return false;
        }
        self.read_pos += n;
        true
    }

    /// Compact the unread tail to offset 0 and reset the cursors. Required
    /// before each socket read so a partial trailing frame is not lost.
    pub fn reset(&mut self) {
        let data_len = self.data_len();
        if data_len == 0 {
            self.read_pos = 0;
            self.write_pos = 0;
            return;
        }

        let read_pos = self.read_pos;
        if let Some(seg) = &mut self.segment {
            seg.as_mut_slice().copy_within(read_pos..read_pos + data_len, 0);
        }
        self.read_pos = 0;
        self.write_pos = data_len;
    }
}

impl Drop for ReceiveBuffer {
    fn drop(&mut self) {
        if let Some(segment) = self.segment.take() {
            self.pool.ret(segment);
        }
    }
}
