// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    inetstack::protocols::{
        icmpv4::{
            Icmpv4Header,
            Icmpv4Type,
        },
        ipv4::{
            IpProtocol,
            Ipv4Header,
            Ipv4Peer,
        },
    },
    runtime::{
        fail::Fail,
        memory::Buffer,
    },
};
use ::std::sync::Arc;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Answers echo requests. Every other message is logged and dropped.
pub struct Icmpv4Peer {
    ipv4: Arc<Ipv4Peer>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Icmpv4Peer {
    pub fn new(ipv4: Arc<Ipv4Peer>) -> Self {
        Self { ipv4 }
    }

    pub fn receive(&self, ipv4_header: &Ipv4Header, mut buf: Buffer) -> Result<(), Fail> {
        let header: Icmpv4Header = Icmpv4Header::parse_and_strip(&mut buf)?;
        match header.get_type() {
            Icmpv4Type::EchoRequest { id, seq_num } => {
                let dst_addr = ipv4_header.get_src_addr();
                trace!("receive(): echo request from {} (id={}, seq={})", dst_addr, id, seq_num);
                // The request body is echoed back as is.
                Icmpv4Header::new(Icmpv4Type::EchoReply { id, seq_num }, 0).serialize_and_attach(&mut buf)?;
                self.ipv4.send(dst_addr, IpProtocol::ICMPv4, buf)
            },
            other => {
                debug!("receive(): ignoring {:?} from {}", other, ipv4_header.get_src_addr());
                Ok(())
            },
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
