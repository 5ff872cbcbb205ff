//! Reusable packet buffers for the transmit path.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

struct PoolShared {
    // ---
    free: Mutex<Vec<Vec<u8>>>,
    buffer_capacity: usize,
    max_idle: usize,
    outstanding: AtomicUsize,
}

/// Pool of byte buffers; rented buffers go back to the pool when dropped.
#[derive(Clone)]
pub struct BufferPool {
    // ---
    shared: Arc<PoolShared>,
}

impl BufferPool {
    // ---
    /// `buffer_capacity` is the initial capacity of freshly allocated
    /// buffers; at most `max_idle` buffers are kept for reuse.
    pub fn new(buffer_capacity: usize, max_idle: usize) -> Self {
        // ---
        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(Vec::with_capacity(max_idle)),
                buffer_capacity,
                max_idle,
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Takes an empty buffer from the pool, allocating if none is idle.
    pub fn rent(&self) -> PooledBuffer {
        // ---
        let buf = self
            .shared
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.shared.buffer_capacity));

        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        PooledBuffer {
            buf,
            shared: self.shared.clone(),
        }
    }

    /// Buffers rented and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// Buffers waiting for reuse.
    pub fn idle(&self) -> usize {
        self.shared.free.lock().len()
    }
}

/// A rented buffer. Derefs to `Vec<u8>`.
pub struct PooledBuffer {
    // ---
    buf: Vec<u8>,
    shared: Arc<PoolShared>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        // ---
        self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        let mut free = self.shared.free.lock();
        if free.len() < self.shared.max_idle {
            free.push(buf);
        }
    }
}
