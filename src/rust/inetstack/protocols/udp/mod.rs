// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod header;
mod peer;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    header::{
        UdpHeader,
        UDP_HEADER_SIZE,
    },
    peer::{
        UdpCallback,
        UdpHandle,
        UdpPeer,
        UDP_PAYLOAD_MAX_SIZE,
    },
};
