// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::{
        Task,
        TaskQueue,
        WorkerGroup,
    },
};
use ::libc::EINVAL;
use ::std::sync::{
    Arc,
    Mutex,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Fixed pool of worker threads pulling from one unbounded queue.
///
/// There is no priority and no cancellation of dispatched tasks; shutdown lets each worker finish its current task.
pub struct Scheduler {
    queue: Arc<TaskQueue>,
    workers: Mutex<Option<WorkerGroup>>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Scheduler {
    pub fn new(worker_threads: usize) -> Result<Self, Fail> {
        if worker_threads == 0 {
            return Err(Fail::new(EINVAL, "scheduler needs at least one worker thread"));
        }
        let queue: Arc<TaskQueue> = Arc::new(TaskQueue::unbounded("scheduler"));
        let workers: WorkerGroup = WorkerGroup::spawn("tapstack-worker", worker_threads, queue.clone())?;
        info!("new(): started {} worker threads", worker_threads);
        Ok(Self {
            queue,
            workers: Mutex::new(Some(workers)),
        })
    }

    /// Builds a task bound to the worker pool.
    pub fn task<F>(&self, name: &'static str, function: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task::new(name, self.queue.clone(), function)
    }

    /// Submits `function` for execution on one of the workers.
    pub fn submit<F>(&self, name: &'static str, function: F) -> Result<(), Fail>
    where
        F: FnOnce() + Send + 'static,
    {
        self.task(name, function).dispatch()
    }

    /// The queue feeding the workers.
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Number of tasks waiting for a worker.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Stops the workers after their current task and joins them. Idempotent.
    pub fn shutdown(&self) {
        let workers: Option<WorkerGroup> = match self.workers.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut workers) = workers {
            workers.shutdown();
            info!("shutdown(): workers stopped");
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
