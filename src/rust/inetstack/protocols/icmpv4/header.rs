// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    inetstack::protocols::{
        compute_generic_checksum,
        fold16,
        icmpv4::Icmpv4Type,
    },
    runtime::{
        fail::Fail,
        memory::Buffer,
    },
};
use ::libc::EBADMSG;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Size of ICMPv4 Headers (in bytes)
pub const ICMPV4_HEADER_SIZE: usize = 8;

//======================================================================================================================
// Structures
//======================================================================================================================

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Icmpv4Header {
    icmpv4_type: Icmpv4Type,
    code: u8,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Icmpv4Header {
    pub fn new(icmpv4_type: Icmpv4Type, code: u8) -> Self {
        Self { icmpv4_type, code }
    }

    /// Strips and parses the ICMP header from the packet in [buf]. The checksum covers the whole message.
    pub fn parse_and_strip(buf: &mut Buffer) -> Result<Self, Fail> {
        if buf.len() < ICMPV4_HEADER_SIZE {
            return Err(Fail::new(EBADMSG, "ICMPv4 datagram too small for header"));
        }
        if fold16(compute_generic_checksum(&buf[..], None)) != 0 {
            return Err(Fail::new(EBADMSG, "ICMPv4 checksum mismatch"));
        }
        let type_byte: u8 = buf[0];
        let code: u8 = buf[1];
        let rest_of_header: [u8; 4] = [buf[4], buf[5], buf[6], buf[7]];
        let icmpv4_type: Icmpv4Type = Icmpv4Type::parse(type_byte, &rest_of_header)?;

        buf.adjust(ICMPV4_HEADER_SIZE)?;
        Ok(Self { icmpv4_type, code })
    }

    /// Serializes and prepends the ICMP header onto the message body in [buf].
    pub fn serialize_and_attach(&self, buf: &mut Buffer) -> Result<(), Fail> {
        buf.prepend(ICMPV4_HEADER_SIZE)?;
        let (type_byte, rest_of_header) = self.icmpv4_type.serialize();
        buf[0] = type_byte;
        buf[1] = self.code;
        buf[2..4].copy_from_slice(&[0, 0]);
        buf[4..8].copy_from_slice(&rest_of_header);
        let checksum: u16 = fold16(compute_generic_checksum(&buf[..], None));
        buf[2..4].copy_from_slice(&checksum.to_be_bytes());
        Ok(())
    }

    pub fn get_type(&self) -> Icmpv4Type {
        self.icmpv4_type
    }

    pub fn get_code(&self) -> u8 {
        self.code
    }
}
