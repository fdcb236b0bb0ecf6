// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod header;
mod peer;

pub use self::{
    header::{
        ArpHeader,
        ArpOperation,
        ARP_MESSAGE_SIZE,
    },
    peer::ArpPeer,
};
