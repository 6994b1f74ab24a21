// Bounded free list of payload buffers.
//
// Publishes copy the caller's bytes into a rented buffer; once the writer has
// serialized the command the buffer returns here, so a steady publish load
// settles into zero allocations.
use bytes::BytesMut;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

pub(crate) struct BufferPool {
    slots: Mutex<Vec<BytesMut>>,
    max_idle: usize,
}

impl BufferPool {
    pub(crate) fn new(max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(Vec::new()),
            max_idle,
        })
    }

    pub(crate) fn rent(self: &Arc<Self>, payload: &[u8]) -> PooledBuf {
        let mut buf = self
            .slots
            .lock()
            .expect("buffer pool lock poisoned")
            .pop()
            .unwrap_or_default();
        buf.clear();
        buf.extend_from_slice(payload);
        PooledBuf {
            buf: Some(buf),
            pool: Some(Arc::clone(self)),
        }
    }

    fn give_back(&self, buf: BytesMut) {
        let mut slots = self.slots.lock().expect("buffer pool lock poisoned");
        if slots.len() < self.max_idle {
            slots.push(buf);
        }
    }

    #[cfg(test)]
    pub(crate) fn idle(&self) -> usize {
        self.slots.lock().expect("buffer pool lock poisoned").len()
    }
}

/// A payload buffer that returns to its pool on drop.
pub(crate) struct PooledBuf {
    buf: Option<BytesMut>,
    pool: Option<Arc<BufferPool>>,
}

impl PooledBuf {
    /// A buffer with no backing pool, for payloads produced outside the
    /// publish hot path (request-handler replies, tests).
    pub(crate) fn detached(payload: &[u8]) -> Self {
        Self {
            buf: Some(BytesMut::from(payload)),
            pool: None,
        }
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf").field("len", &self.len()).finish()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let (Some(buf), Some(pool)) = (self.buf.take(), self.pool.take()) {
            pool.give_back(buf);
        }
    }
}
