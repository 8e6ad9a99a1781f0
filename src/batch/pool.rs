//! Reusable buffer pools.
//!
//! Batch commits drain articles into scratch vectors at a high rate;
//! recycling them through a bounded channel keeps allocation churn off
//! the hot path. `put` is non-blocking: when the pool is full the
//! buffer just drops to the allocator.

use async_channel::{bounded, Receiver, Sender};

pub struct BufferPool<T> {
    tx: Sender<Vec<T>>,
    rx: Receiver<Vec<T>>,
    capacity: usize,
}

impl<T> BufferPool<T> {
    pub fn new(pool_size: usize, capacity: usize) -> Self {
        let (tx, rx) = bounded(pool_size.max(1));
        Self { tx, rx, capacity }
    }

    /// A cleared buffer, recycled or fresh.
    pub fn get(&self) -> Vec<T> {
        match self.rx.try_recv() {
            Ok(mut buf) => {
                buf.clear();
                buf
            }
            Err(_) => Vec::with_capacity(self.capacity),
        }
    }

    /// Return a buffer; dropped silently when the pool is full.
    pub fn put(&self, buf: Vec<T>) {
        let _ = self.tx.try_send(buf);
    }
}
