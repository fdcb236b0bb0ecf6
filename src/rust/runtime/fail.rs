// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::libc::{
    c_int,
    EIO,
};
use ::std::{
    error,
    fmt,
    io,
};

//==============================================================================
// Structures
//==============================================================================

/// Failure
#[derive(Clone, PartialEq, Eq)]
pub struct Fail {
    /// Error code.
    pub errno: c_int,
    /// Cause.
    pub cause: String,
    /// Layers that forwarded this failure, innermost first.
    pub trace: Vec<&'static str>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate Functions for Failures
impl Fail {
    /// Creates a new Failure
    pub fn new(errno: i32, cause: &str) -> Self {
        Self {
            errno,
            cause: cause.to_string(),
            trace: Vec::new(),
        }
    }

    /// Appends the tag of a layer that could not handle this failure and is forwarding it to its caller.
    pub fn context(mut self, layer: &'static str) -> Self {
        self.trace.push(layer);
        self
    }

    /// Returns the layer that originated this failure, if any layer tagged it.
    pub fn origin(&self) -> Option<&'static str> {
        self.trace.first().copied()
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Display Trait Implementation for Failures
impl fmt::Display for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.errno, self.cause)?;
        if !self.trace.is_empty() {
            write!(f, " [{}]", self.trace.join(" <- "))?;
        }
        Ok(())
    }
}

/// Debug trait Implementation for Failures
impl fmt::Debug for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Error Trait Implementation for Failures
impl error::Error for Fail {}

/// Conversion Trait Implementation for Fail
impl From<io::Error> for Fail {
    fn from(e: io::Error) -> Self {
        Self {
            errno: e.raw_os_error().unwrap_or(EIO),
            cause: format!("I/O error: {}", e),
            trace: Vec::new(),
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
