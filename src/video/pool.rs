//! Bounded pool of reusable frame buffers
//!
//! Buffers return to the pool when the last reference to them is dropped,
//! including after they were frozen into `Bytes` and shared downstream.

use bytes::Bytes;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    outstanding: AtomicUsize,
    capacity: usize,
}

/// Frame buffer pool
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool allowing at most `capacity` buffers in flight
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::with_capacity(capacity)),
                outstanding: AtomicUsize::new(0),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Take a zeroed buffer of `len` bytes, or None when every buffer is in use
    pub fn acquire(&self, len: usize) -> Option<PooledBuffer> {
        let inner = &self.inner;
        let mut current = inner.outstanding.load(Ordering::Acquire);
        loop {
            if current >= inner.capacity {
                return None;
            }
            match inner.outstanding.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let mut buf = inner.free.lock().pop().unwrap_or_default();
        buf.clear();
        buf.resize(len, 0);

        Some(PooledBuffer {
            buf,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Buffers currently handed out
    pub fn in_use(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Maximum number of buffers in flight
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Buffers sitting idle, ready for reuse
    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }
}

/// A buffer on loan from a [`BufferPool`]
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// Freeze into shareable `Bytes`; the buffer returns to the pool when
    /// the last clone is dropped
    pub fn freeze(self) -> Bytes {
        Bytes::from_owner(self)
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        {
            let mut free = self.pool.free.lock();
            if free.len() < self.pool.capacity {
                free.push(buf);
            }
        }
        self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}
