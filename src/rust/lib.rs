// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

#[macro_use]
extern crate log;

pub mod inetstack;
pub mod runtime;

pub use self::{
    inetstack::{
        InetStack,
        StackCounters,
    },
    runtime::{
        config::Config,
        fail::Fail,
        memory::{
            Buffer,
            BufferPool,
        },
        network::types::MacAddress,
        scheduler::{
            Scheduler,
            Task,
        },
        timer::{
            DelayedTask,
            TimerHandle,
            TimerService,
        },
    },
};

//======================================================================================================================
// Macros
//======================================================================================================================

/// Ensures that two expressions are equivalent or bails out of the enclosing `anyhow::Result` function.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr $(,)?) => ({
        match (&$left, &$right) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    anyhow::bail!(
                        "ensure failed: `(left == right)` left: `{:?}`, right: `{:?}` at {}:{}",
                        left_val,
                        right_val,
                        file!(),
                        line!()
                    )
                }
            }
        }
    });
}

/// Ensures that two expressions are not equivalent or bails out of the enclosing `anyhow::Result` function.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr $(,)?) => ({
        match (&$left, &$right) {
            (left_val, right_val) => {
                if *left_val == *right_val {
                    anyhow::bail!(
                        "ensure failed: `(left != right)` left: `{:?}`, right: `{:?}` at {}:{}",
                        left_val,
                        right_val,
                        file!(),
                        line!()
                    )
                }
            }
        }
    });
}
