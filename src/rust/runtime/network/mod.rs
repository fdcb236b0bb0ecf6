// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

#[cfg(target_os = "linux")]
pub mod tap;
pub mod types;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    memory::{
        Buffer,
        BufferPool,
    },
};
use ::libc::EAGAIN;
use ::std::sync::atomic::{
    AtomicBool,
    Ordering,
};

//======================================================================================================================
// Traits
//======================================================================================================================

/// API for the Physical Layer for any underlying device that moves raw Ethernet frames (e.g., a TAP interface, or a
/// loopback channel in tests). Frames are transmitted concurrently from every worker thread.
pub trait PhysicalLayer: Send + Sync + 'static {
    /// Transmits a single frame. The buffer is released once the frame is handed to the device.
    fn transmit(&self, frame: Buffer) -> Result<(), Fail>;

    /// Blocks until one frame is read into `buf`, for a bounded amount of time. Returns the frame length, or `EAGAIN`
    /// when nothing arrived in time.
    fn receive(&self, buf: &mut Buffer) -> Result<usize, Fail>;
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Reads frames from `device` into pool buffers and hands each one to `deliver`, until `live` is cleared. A frame that
/// `deliver` refuses is dropped with a log line; a device error ends the loop.
pub fn receive_loop<F>(device: &dyn PhysicalLayer, pool: &BufferPool, live: &AtomicBool, mut deliver: F) -> Result<(), Fail>
where
    F: FnMut(Buffer) -> Result<(), Fail>,
{
    while live.load(Ordering::Acquire) {
        let mut buf: Buffer = pool.acquire_max();
        let nbytes: usize = match device.receive(&mut buf) {
            Ok(nbytes) => nbytes,
            Err(e) if e.errno == EAGAIN => continue,
            Err(e) => {
                error!("receive_loop(): device failed ({:?})", e);
                return Err(e);
            },
        };
        let excess: usize = buf.len() - nbytes.min(buf.len());
        buf.trim(excess)?;
        if let Err(e) = deliver(buf) {
            warn!("receive_loop(): dropping frame ({:?})", e);
        }
    }
    Ok(())
}
