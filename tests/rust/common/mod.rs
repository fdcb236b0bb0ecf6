// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![allow(dead_code)]

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::std::{
    sync::Arc,
    thread,
    time::{
        Duration,
        Instant,
    },
};
use ::tapstack::{
    inetstack::test_helpers::{
        self,
        LoopbackDevice,
    },
    runtime::logging,
    Buffer,
    Config,
    InetStack,
};

//======================================================================================================================
// Constants
//======================================================================================================================

pub const MTU: u16 = 1500;
pub const TIMEOUT: Duration = Duration::from_secs(5);

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Brings up a stack playing Alice on a loopback device.
pub fn new_alice(mtu: u16) -> Result<(Arc<InetStack>, Arc<LoopbackDevice>)> {
    logging::initialize();
    let config: Config = test_helpers::alice_config(mtu)?;
    let device: Arc<LoopbackDevice> = Arc::new(LoopbackDevice::new());
    let stack: Arc<InetStack> = InetStack::new(&config, device.clone())?;
    Ok((stack, device))
}

/// Polls `condition` until it holds, giving up after [TIMEOUT].
pub fn wait_for<F: Fn() -> bool>(condition: F) -> Result<()> {
    let deadline: Instant = Instant::now() + TIMEOUT;
    while !condition() {
        if Instant::now() > deadline {
            anyhow::bail!("condition did not hold within {:?}", TIMEOUT);
        }
        thread::sleep(Duration::from_millis(5));
    }
    Ok(())
}

/// Waits for the next frame the stack transmits.
pub fn next_frame(device: &LoopbackDevice) -> Result<Buffer> {
    match device.pop_timeout(TIMEOUT) {
        Some(frame) => Ok(frame),
        None => anyhow::bail!("no frame was transmitted within {:?}", TIMEOUT),
    }
}
