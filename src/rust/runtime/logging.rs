// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::flexi_logger::Logger;
use ::std::sync::Once;

//==============================================================================
// Static Variables
//==============================================================================

/// Guardian to the logging initialize function.
static INIT_LOG: Once = Once::new();

//==============================================================================
// Standalone Functions
//==============================================================================

/// Initializes logging features. The log filter is read from `RUST_LOG` and defaults to warnings only.
pub fn initialize() {
    INIT_LOG.call_once(|| {
        let logger = match Logger::try_with_env_or_str("warn") {
            Ok(logger) => logger,
            Err(e) => {
                eprintln!("initialize(): invalid log filter ({:?})", e);
                return;
            },
        };
        // The handle must outlive the process, otherwise the logger is shut down on drop.
        match logger.start() {
            Ok(handle) => ::std::mem::forget(handle),
            Err(e) => eprintln!("initialize(): failed to start logger ({:?})", e),
        }
    });
}
