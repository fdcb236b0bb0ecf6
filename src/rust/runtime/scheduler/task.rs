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
    fmt,
    sync::Arc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// An opaque unit of work bound to the queue that must execute it.
///
/// Binding the target into the task lets the same primitive carry work to the global worker pool, to a reassembly
/// partition or to a listening port: whoever holds a task (including a timer thread) delivers it with
/// [Task::dispatch] without knowing which kind of queue is on the other side.
pub struct Task {
    name: &'static str,
    target: Arc<TaskQueue>,
    function: Box<dyn FnOnce() + Send + 'static>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Task {
    pub fn new<F>(name: &'static str, target: Arc<TaskQueue>, function: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            name,
            target,
            function: Box::new(function),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Queue this task is bound to.
    pub fn target(&self) -> &Arc<TaskQueue> {
        &self.target
    }

    /// Enqueues the task on its target queue. On failure the task, and everything it captured, is dropped.
    pub fn dispatch(self) -> Result<(), Fail> {
        let target: Arc<TaskQueue> = self.target.clone();
        target.enqueue(self)
    }

    /// Executes the task on the calling thread.
    pub fn run(self) {
        trace!("run(): {}", self.name);
        (self.function)()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("target", &self.target.name())
            .finish()
    }
}
