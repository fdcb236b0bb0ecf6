// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    queue::{
        BoundedQueue,
        Signal,
        UnboundedQueue,
    },
    scheduler::Task,
};
use ::libc::{
    EAGAIN,
    ECANCELED,
};
use ::std::sync::atomic::{
    AtomicBool,
    AtomicUsize,
    Ordering,
};

//======================================================================================================================
// Structures
//======================================================================================================================

enum Backing {
    Bounded(BoundedQueue<Task>),
    Unbounded(UnboundedQueue<Task>),
}

/// A queue of tasks paired with the signal its draining threads sleep on.
///
/// The unbounded flavour feeds the global worker pool. The bounded flavour is a mailbox: it backs every reassembly
/// partition and listening port, where a hard backpressure limit is part of correctness and where exactly one thread
/// drains the queue so tasks run in submission order.
pub struct TaskQueue {
    name: String,
    backing: Backing,
    signal: Signal,
    live: AtomicBool,
    dropped: AtomicUsize,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl TaskQueue {
    pub fn unbounded(name: &str) -> Self {
        Self::with_backing(name, Backing::Unbounded(UnboundedQueue::new()))
    }

    pub fn bounded(name: &str, capacity: usize) -> Result<Self, Fail> {
        Ok(Self::with_backing(name, Backing::Bounded(BoundedQueue::new(capacity)?)))
    }

    fn with_backing(name: &str, backing: Backing) -> Self {
        Self {
            name: name.to_string(),
            backing,
            signal: Signal::new(),
            live: AtomicBool::new(true),
            dropped: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues `task` and wakes one draining thread.
    pub fn enqueue(&self, task: Task) -> Result<(), Fail> {
        if !self.is_live() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let cause: String = format!("queue is shut down (queue={}, task={})", self.name, task.name());
            debug!("enqueue(): {}", cause);
            return Err(Fail::new(ECANCELED, &cause));
        }
        match self.backing {
            Backing::Unbounded(ref queue) => queue.push(task),
            Backing::Bounded(ref queue) => {
                if let Err(task) = queue.push(task) {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    let cause: String = format!("queue full (queue={}, task={})", self.name, task.name());
                    warn!("enqueue(): {}", cause);
                    return Err(Fail::new(EAGAIN, &cause));
                }
            },
        }
        self.signal.post();
        Ok(())
    }

    /// Dequeues the oldest task without blocking.
    pub fn try_dequeue(&self) -> Option<Task> {
        match self.backing {
            Backing::Unbounded(ref queue) => queue.pop(),
            Backing::Bounded(ref queue) => queue.pop(),
        }
    }

    /// Runs tasks until the queue is shut down. Sleeps on the signal whenever the queue is empty. A task that is
    /// running when shutdown is requested completes; queued tasks are abandoned.
    pub fn drain(&self) {
        while self.is_live() {
            match self.try_dequeue() {
                Some(task) => task.run(),
                None => self.signal.wait(),
            }
        }
        trace!("drain(): {} stopped with {} tasks abandoned", self.name, self.len());
    }

    /// Stops the draining threads after their current task. `waiters` is the number of threads draining this queue.
    pub fn shutdown(&self, waiters: usize) {
        self.live.store(false, Ordering::Release);
        for _ in 0..waiters {
            self.signal.post();
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        match self.backing {
            Backing::Unbounded(ref queue) => queue.len(),
            Backing::Bounded(ref queue) => queue.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tasks refused because the queue was full or shut down.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}
