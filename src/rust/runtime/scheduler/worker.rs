// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::TaskQueue,
};
use ::std::{
    sync::Arc,
    thread::{
        self,
        JoinHandle,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A fixed set of named threads draining one [TaskQueue].
pub struct WorkerGroup {
    queue: Arc<TaskQueue>,
    handles: Vec<JoinHandle<()>>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl WorkerGroup {
    /// Spawns `count` threads named `<prefix>-<index>` that drain `queue`.
    pub fn spawn(prefix: &str, count: usize, queue: Arc<TaskQueue>) -> Result<Self, Fail> {
        let mut group: WorkerGroup = Self {
            queue,
            handles: Vec::with_capacity(count),
        };
        for i in 0..count {
            let queue: Arc<TaskQueue> = group.queue.clone();
            let handle: JoinHandle<()> = match thread::Builder::new()
                .name(format!("{}-{}", prefix, i))
                .spawn(move || queue.drain())
            {
                Ok(handle) => handle,
                Err(e) => {
                    error!("spawn(): failed to spawn {}-{} ({:?})", prefix, i, e);
                    group.shutdown();
                    return Err(Fail::from(e));
                },
            };
            group.handles.push(handle);
        }
        Ok(group)
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stops pulling new tasks and joins every thread. Safe to call from one of the group's own threads, which is
    /// then detached instead of joined.
    pub fn shutdown(&mut self) {
        self.queue.shutdown(self.handles.len());
        let current: thread::ThreadId = thread::current().id();
        for handle in self.handles.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("shutdown(): a thread of {} panicked", self.queue.name());
            }
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for WorkerGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}
