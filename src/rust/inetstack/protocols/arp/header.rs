// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    memory::Buffer,
    network::types::MacAddress,
};
use ::libc::{
    EBADMSG,
    ENOTSUP,
};
use ::std::net::Ipv4Addr;

//======================================================================================================================
// Constants
//======================================================================================================================

const ARP_HTYPE_ETHER2: u16 = 1;
const ARP_HLEN_ETHER2: u8 = 6;
const ARP_PTYPE_IPV4: u16 = 0x800;
const ARP_PLEN_IPV4: u8 = 4;
pub const ARP_MESSAGE_SIZE: usize = 28;

//======================================================================================================================
// Enumerations
//======================================================================================================================

#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArpOperation {
    Request = 1,
    Reply = 2,
}

//======================================================================================================================
// Structures
//======================================================================================================================

///
/// # Protocol Data Unit (PDU) for ARP
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArpHeader {
    // We only support Ethernet/Ipv4, so omit the type and length fields.
    operation: ArpOperation,
    sender_hardware_addr: MacAddress,
    sender_protocol_addr: Ipv4Addr,
    target_hardware_addr: MacAddress,
    target_protocol_addr: Ipv4Addr,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ArpHeader {
    pub fn new(
        op: ArpOperation,
        local_link_addr: MacAddress,
        local_ipv4_addr: Ipv4Addr,
        remote_link_addr: MacAddress,
        remote_ipv4_addr: Ipv4Addr,
    ) -> Self {
        Self {
            operation: op,
            sender_hardware_addr: local_link_addr,
            sender_protocol_addr: local_ipv4_addr,
            target_hardware_addr: remote_link_addr,
            target_protocol_addr: remote_ipv4_addr,
        }
    }

    pub fn parse(buf: &Buffer) -> Result<Self, Fail> {
        if buf.len() < ARP_MESSAGE_SIZE {
            return Err(Fail::new(EBADMSG, "ARP message too short"));
        }
        let buf: &[u8] = &buf[..ARP_MESSAGE_SIZE];
        if u16::from_be_bytes([buf[0], buf[1]]) != ARP_HTYPE_ETHER2 {
            return Err(Fail::new(ENOTSUP, "unsupported HTYPE"));
        }
        if u16::from_be_bytes([buf[2], buf[3]]) != ARP_PTYPE_IPV4 {
            return Err(Fail::new(ENOTSUP, "unsupported PTYPE"));
        }
        if buf[4] != ARP_HLEN_ETHER2 {
            return Err(Fail::new(ENOTSUP, "unsupported HLEN"));
        }
        if buf[5] != ARP_PLEN_IPV4 {
            return Err(Fail::new(ENOTSUP, "unsupported PLEN"));
        }
        let operation: ArpOperation = ArpOperation::try_from(u16::from_be_bytes([buf[6], buf[7]]))?;
        Ok(Self {
            operation,
            sender_hardware_addr: MacAddress::from_bytes(&buf[8..14])?,
            sender_protocol_addr: Ipv4Addr::new(buf[14], buf[15], buf[16], buf[17]),
            target_hardware_addr: MacAddress::from_bytes(&buf[18..24])?,
            target_protocol_addr: Ipv4Addr::new(buf[24], buf[25], buf[26], buf[27]),
        })
    }

    /// Builds a buffer holding this PDU, with `headroom` bytes left in front for the link header.
    pub fn to_buffer(&self, headroom: usize) -> Buffer {
        let mut buf: Buffer = Buffer::new_heap(headroom, ARP_MESSAGE_SIZE);
        buf[0..2].copy_from_slice(&ARP_HTYPE_ETHER2.to_be_bytes());
        buf[2..4].copy_from_slice(&ARP_PTYPE_IPV4.to_be_bytes());
        buf[4] = ARP_HLEN_ETHER2;
        buf[5] = ARP_PLEN_IPV4;
        buf[6..8].copy_from_slice(&(self.operation as u16).to_be_bytes());
        buf[8..14].copy_from_slice(self.sender_hardware_addr.as_bytes());
        buf[14..18].copy_from_slice(&self.sender_protocol_addr.octets());
        buf[18..24].copy_from_slice(self.target_hardware_addr.as_bytes());
        buf[24..28].copy_from_slice(&self.target_protocol_addr.octets());
        buf
    }

    pub fn get_operation(&self) -> ArpOperation {
        self.operation
    }

    pub fn get_sender_hardware_addr(&self) -> MacAddress {
        self.sender_hardware_addr
    }

    pub fn get_sender_protocol_addr(&self) -> Ipv4Addr {
        self.sender_protocol_addr
    }

    pub fn get_destination_hardware_addr(&self) -> MacAddress {
        self.target_hardware_addr
    }

    pub fn get_destination_protocol_addr(&self) -> Ipv4Addr {
        self.target_protocol_addr
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl TryFrom<u16> for ArpOperation {
    type Error = Fail;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ArpOperation::Request),
            2 => Ok(ArpOperation::Reply),
            _ => Err(Fail::new(ENOTSUP, "unsupported ARP operation")),
        }
    }
}
