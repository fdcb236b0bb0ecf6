// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod queue;
mod scheduler;
mod task;
mod worker;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    queue::TaskQueue,
    scheduler::Scheduler,
    task::Task,
    worker::WorkerGroup,
};
