// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod buffer;
mod pool;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    buffer::Buffer,
    pool::BufferPool,
};
