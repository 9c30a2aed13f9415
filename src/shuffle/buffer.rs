//! Buffer pool and the data/event distinction carried through the shuffle
//! input path.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

/// Tag carried alongside every buffer a channel returns, distinguishing
/// ordinary records from in-band control events on the priority path, and
/// from the dedicated end-of-partition marker: "channel empty right now"
/// (`get_next_buffer` returning `Ok(None)`) and "no further data will ever
/// arrive" (an `EndOfPartition`-tagged buffer) are never the same signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Data,
    Event,
    Priority,
    EndOfPartition,
}

struct PoolState {
    free: Mutex<VecDeque<Vec<u8>>>,
    buffer_size: usize,
}

/// A pooled chunk of bytes. Cloning an instance shares the backing
/// allocation via `Arc`; the allocation is returned to its pool only when
/// the last clone drops (Rust's own strong-count stands in for the
/// final-release check).
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

struct BufferInner {
    payload: Vec<u8>,
    pool: Option<Arc<PoolState>>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let mut payload = std::mem::take(&mut self.payload);
            payload.clear();
            pool.free.lock().push_back(payload);
        }
    }
}

impl Buffer {
    /// A buffer not backed by any pool (e.g. deserialized off the wire).
    pub fn unpooled(payload: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(BufferInner { payload, pool: None }),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.inner.payload
    }

    pub fn len(&self) -> usize {
        self.inner.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.payload.is_empty()
    }
}

/// Fixed-capacity recycling pool for one task's exclusive buffer budget.
/// Credit accounting (how many outstanding checkouts a remote channel may
/// have) lives in [`crate::shuffle::transport`]; this pool only handles the
/// allocation recycling itself.
pub struct BufferPool {
    state: Arc<PoolState>,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            state: Arc::new(PoolState {
                free: Mutex::new(VecDeque::new()),
                buffer_size,
            }),
        }
    }

    /// Checks out a buffer, filling it from `fill` (given a correctly sized
    /// scratch `Vec<u8>` to write into and return).
    pub fn checkout_with(&self, fill: impl FnOnce(&mut Vec<u8>)) -> Buffer {
        let mut payload = self
            .state
            .free
            .lock()
            .pop_front()
            .unwrap_or_else(|| Vec::with_capacity(self.state.buffer_size));
        fill(&mut payload);
        Buffer {
            inner: Arc::new(BufferInner {
                payload,
                pool: Some(self.state.clone()),
            }),
        }
    }

    pub fn free_count(&self) -> usize {
        self.state.free.lock().len()
    }
}
