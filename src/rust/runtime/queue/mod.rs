// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::crossbeam_channel::{
    Receiver,
    RecvTimeoutError,
    Sender,
};
use ::crossbeam_queue::{
    ArrayQueue,
    SegQueue,
};
use ::libc::EINVAL;
use ::std::time::Duration;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Lock-free multi-producer/multi-consumer queue with a fixed, power-of-two capacity.
pub struct BoundedQueue<T> {
    inner: ArrayQueue<T>,
}

/// Lock-free multi-producer/multi-consumer queue without a capacity limit. Nodes are allocated in blocks and recycled,
/// so steady-state pushes do not hit the allocator.
pub struct UnboundedQueue<T> {
    inner: SegQueue<T>,
}

/// Counting wake signal. Every [Signal::post] releases exactly one [Signal::wait].
#[derive(Clone)]
pub struct Signal {
    tx: Sender<()>,
    rx: Receiver<()>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Result<Self, Fail> {
        if capacity == 0 || !capacity.is_power_of_two() {
            let cause: String = format!("queue capacity must be a power of two (capacity={})", capacity);
            error!("new(): {}", cause);
            return Err(Fail::new(EINVAL, &cause));
        }
        Ok(Self {
            inner: ArrayQueue::new(capacity),
        })
    }

    /// Attempts to enqueue `item`. If the queue is full, the item is handed back to the caller, who owns the drop.
    pub fn push(&self, item: T) -> Result<(), T> {
        self.inner.push(item)
    }

    /// Dequeues the oldest item, or returns `None` when the queue is empty.
    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

impl<T> UnboundedQueue<T> {
    pub fn new() -> Self {
        Self { inner: SegQueue::new() }
    }

    pub fn push(&self, item: T) {
        self.inner.push(item)
    }

    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Signal {
    pub fn new() -> Self {
        let (tx, rx): (Sender<()>, Receiver<()>) = ::crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    /// Increments the signal, waking one waiter.
    pub fn post(&self) {
        // Both ends live in `self`, so the channel cannot be disconnected here.
        let _ = self.tx.send(());
    }

    /// Blocks until the signal is positive, then decrements it.
    pub fn wait(&self) {
        let _ = self.rx.recv();
    }

    /// Like [Signal::wait] but gives up after `timeout`. Returns whether the signal was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Number of pending posts not yet consumed.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<T> Default for UnboundedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        BoundedQueue,
        Signal,
        UnboundedQueue,
    };
    use crate::ensure_eq;
    use ::anyhow::Result;
    use ::std::{
        sync::Arc,
        thread,
        time::Duration,
    };

    #[test]
    fn bounded_queue_rejects_bad_capacity() -> Result<()> {
        anyhow::ensure!(BoundedQueue::<u32>::new(0).is_err());
        anyhow::ensure!(BoundedQueue::<u32>::new(6).is_err());
        ensure_eq!(BoundedQueue::<u32>::new(8)?.capacity(), 8);
        Ok(())
    }

    #[test]
    fn bounded_queue_reports_full_and_empty() -> Result<()> {
        let queue: BoundedQueue<u32> = BoundedQueue::new(2)?;
        ensure_eq!(queue.pop(), None);
        ensure_eq!(queue.push(1), Ok(()));
        ensure_eq!(queue.push(2), Ok(()));
        ensure_eq!(queue.push(3), Err(3));
        ensure_eq!(queue.pop(), Some(1));
        ensure_eq!(queue.pop(), Some(2));
        anyhow::ensure!(queue.is_empty());
        Ok(())
    }

    #[test]
    fn unbounded_queue_survives_concurrent_producers() -> Result<()> {
        const PRODUCERS: usize = 4;
        const ITEMS: usize = 1000;
        let queue: Arc<UnboundedQueue<usize>> = Arc::new(UnboundedQueue::new());
        let handles: Vec<thread::JoinHandle<()>> = (0..PRODUCERS)
            .map(|p| {
                let queue: Arc<UnboundedQueue<usize>> = queue.clone();
                thread::spawn(move || {
                    for i in 0..ITEMS {
                        queue.push(p * ITEMS + i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().map_err(|_| anyhow::anyhow!("producer panicked"))?;
        }
        ensure_eq!(queue.len(), PRODUCERS * ITEMS);
        let mut seen: Vec<usize> = std::iter::from_fn(|| queue.pop()).collect();
        seen.sort_unstable();
        ensure_eq!(seen, (0..PRODUCERS * ITEMS).collect::<Vec<usize>>());
        Ok(())
    }

    #[test]
    fn signal_counts_posts() -> Result<()> {
        let signal: Signal = Signal::new();
        signal.post();
        signal.post();
        ensure_eq!(signal.pending(), 2);
        signal.wait();
        anyhow::ensure!(signal.wait_timeout(Duration::from_millis(10)));
        anyhow::ensure!(!signal.wait_timeout(Duration::from_millis(10)));
        Ok(())
    }
}
