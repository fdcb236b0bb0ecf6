// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod connection;
mod header;
mod isn_generator;
mod peer;
mod sequence_number;
pub mod server;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    connection::{
        TcpConnection,
        TcpState,
    },
    header::{
        TcpHeader,
        MIN_TCP_HEADER_SIZE,
    },
    isn_generator::IsnGenerator,
    peer::TcpPeer,
    sequence_number::SeqNumber,
    server::{
        ConnectionKey,
        ServerLimits,
        TcpCallback,
        TcpHandle,
        TcpServer,
    },
};
