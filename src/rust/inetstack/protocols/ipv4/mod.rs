// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod header;
mod peer;
mod protocol;
mod reassembly;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    header::{
        Ipv4Header,
        IPV4_DATAGRAM_MAX_SIZE,
        IPV4_HEADER_MIN_SIZE,
    },
    peer::Ipv4Peer,
    protocol::IpProtocol,
    reassembly::{
        DatagramHandler,
        ReassemblyOutcome,
        ReassemblySettings,
        Reassembler,
    },
};
