// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    inetstack::protocols::{
        compute_generic_checksum,
        compute_pseudo_header_checksum,
        fold16,
        ipv4::IpProtocol,
    },
    runtime::{
        fail::Fail,
        memory::Buffer,
    },
};
use ::libc::EBADMSG;
use ::std::net::Ipv4Addr;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Size of a UDP header (in bytes).
pub const UDP_HEADER_SIZE: usize = 8;

//======================================================================================================================
// Structures
//======================================================================================================================

/// UDP Datagram Header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    /// Port used on sender side (optional).
    src_port: u16,
    /// Port used receiver side.
    dest_port: u16,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl UdpHeader {
    pub fn new(src_port: u16, dest_port: u16) -> Self {
        Self { src_port, dest_port }
    }

    pub fn src_port(&self) -> u16 {
        self.src_port
    }

    pub fn dest_port(&self) -> u16 {
        self.dest_port
    }

    /// Parses and strips the UDP header off of the datagram in [buf]. A zero checksum means the sender did not
    /// compute one and is not verified.
    pub fn parse_and_strip(src_ipv4_addr: &Ipv4Addr, dst_ipv4_addr: &Ipv4Addr, buf: &mut Buffer) -> Result<Self, Fail> {
        if buf.len() < UDP_HEADER_SIZE {
            return Err(Fail::new(EBADMSG, "UDP segment too small"));
        }
        let src_port: u16 = u16::from_be_bytes([buf[0], buf[1]]);
        let dest_port: u16 = u16::from_be_bytes([buf[2], buf[3]]);
        let length: usize = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        if length != buf.len() {
            return Err(Fail::new(EBADMSG, "UDP length mismatch"));
        }
        let checksum: u16 = u16::from_be_bytes([buf[6], buf[7]]);
        if checksum != 0 && Self::checksum(src_ipv4_addr, dst_ipv4_addr, &buf[..]) != 0 {
            return Err(Fail::new(EBADMSG, "UDP checksum mismatch"));
        }

        buf.adjust(UDP_HEADER_SIZE)?;
        Ok(Self::new(src_port, dest_port))
    }

    /// Serializes and prepends the UDP header on to the payload in [buf].
    pub fn serialize_and_attach(
        &self,
        buf: &mut Buffer,
        src_ipv4_addr: &Ipv4Addr,
        dst_ipv4_addr: &Ipv4Addr,
    ) -> Result<(), Fail> {
        buf.prepend(UDP_HEADER_SIZE)?;
        let length: usize = buf.len();
        if length > u16::MAX as usize {
            return Err(Fail::new(EBADMSG, "UDP datagram too large"));
        }
        buf[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        buf[2..4].copy_from_slice(&self.dest_port.to_be_bytes());
        buf[4..6].copy_from_slice(&(length as u16).to_be_bytes());
        buf[6..8].copy_from_slice(&[0, 0]);
        let checksum: u16 = match Self::checksum(src_ipv4_addr, dst_ipv4_addr, &buf[..]) {
            // Zero on the wire means "no checksum".
            0 => 0xffff,
            checksum => checksum,
        };
        buf[6..8].copy_from_slice(&checksum.to_be_bytes());
        trace!("serialize_and_attach(): {:?} ({} bytes)", self, length);
        Ok(())
    }

    /// Computes the checksum of a whole UDP datagram, header included, over the IPv4 pseudo header. Yields zero
    /// for an intact datagram that carries its checksum.
    fn checksum(src_ipv4_addr: &Ipv4Addr, dst_ipv4_addr: &Ipv4Addr, datagram: &[u8]) -> u16 {
        let state: u32 = compute_pseudo_header_checksum(src_ipv4_addr, dst_ipv4_addr, IpProtocol::UDP, datagram.len());
        fold16(compute_generic_checksum(datagram, Some(state)))
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
