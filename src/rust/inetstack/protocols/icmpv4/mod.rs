// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod header;
mod peer;
mod protocol;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    header::{
        Icmpv4Header,
        ICMPV4_HEADER_SIZE,
    },
    peer::Icmpv4Peer,
    protocol::Icmpv4Type,
};
