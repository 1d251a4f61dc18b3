//! Pooled socket buffers.
//!
//! Every socket read in a dump lands in a chunk checked out from this pool, so
//! receive buffer memory is fixed at `chunk_size * chunk_count`. Value
//! payloads are copied out of the chunk and held on the heap until written;
//! that memory is bounded per worker by about `chunk_size` of completed values
//! plus `2 * dump.max_item_size` for the value being parsed and the largest
//! completed one.
//!
//! # Design
//!
//! - One allocation at startup, split into fixed-size chunks
//! - Chunks are handed out as owned [`Chunk`] values and never resized
//! - Dropping a chunk returns it to the free list
//! - An exhausted pool reports `None` instead of blocking

use bytes::BytesMut;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// A fixed pool of equally sized buffers, shared between worker threads.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free_list: Mutex<Vec<BytesMut>>,
    chunk_size: usize,
    chunk_count: usize,
}

impl BufferPool {
    /// Allocate `chunk_count` chunks of `chunk_size` bytes in one allocation.
    pub fn preallocate(chunk_size: usize, chunk_count: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be positive");

        let mut storage = BytesMut::zeroed(chunk_size * chunk_count);
        let mut free_list = Vec::with_capacity(chunk_count);
        for _ in 0..chunk_count {
            free_list.push(storage.split_to(chunk_size));
        }

        Self {
            inner: Arc::new(PoolInner {
                free_list: Mutex::new(free_list),
                chunk_size,
                chunk_count,
            }),
        }
    }

    /// Get the chunk size.
    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    /// Get the total number of chunks.
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.inner.chunk_count
    }

    /// Get the number of free chunks available.
    pub fn free_count(&self) -> usize {
        self.inner.free_list.lock().len()
    }

    /// Get the number of chunks currently checked out.
    pub fn checked_out_count(&self) -> usize {
        self.chunk_count() - self.free_count()
    }

    /// Check out a chunk from the pool.
    ///
    /// Returns `None` if the pool is exhausted.
    pub fn acquire(&self) -> Option<Chunk> {
        let buf = self.inner.free_list.lock().pop()?;
        Some(Chunk {
            buf,
            pool: self.inner.clone(),
        })
    }

    /// Return a chunk to the pool. Equivalent to dropping it.
    pub fn release(&self, chunk: Chunk) {
        debug_assert!(Arc::ptr_eq(&self.inner, &chunk.pool), "chunk from another pool");
        drop(chunk);
    }
}

/// A checked-out buffer. Returned to its pool on drop.
pub struct Chunk {
    buf: BytesMut,
    pool: Arc<PoolInner>,
}

impl Deref for Chunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for Chunk {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.free_list.lock().push(buf);
    }
}
