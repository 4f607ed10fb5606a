//! Bounded chunk queue between the packet-routing path and the encoder
//! pacing worker.

use std::collections::VecDeque;
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::Notify;

/// Chunks held at most before the oldest is evicted. A stuck encoder must
/// not grow memory without bound.
pub const QUEUE_CAPACITY: usize = 256;

/// Multi-producer, single-consumer queue of opaque chunk buffers.
/// Arrival order is preserved; overflow evicts the oldest chunk.
pub struct FrameQueue {
    inner: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    capacity: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Append a chunk. Returns the evicted chunk when the queue was full.
    pub fn push(&self, chunk: Bytes) -> Option<Bytes> {
        let evicted = {
            let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let evicted = if queue.len() >= self.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(chunk);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    /// Wait for the next chunk.
    pub async fn recv(&self) -> Bytes {
        loop {
            let notified = self.notify.notified();
            if let Some(chunk) = self.try_pop() {
                return chunk;
            }
            notified.await;
        }
    }

    fn try_pop(&self) -> Option<Bytes> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
