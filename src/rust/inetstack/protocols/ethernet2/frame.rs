// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    inetstack::protocols::ethernet2::EtherType2,
    runtime::{
        fail::Fail,
        memory::Buffer,
        network::types::MacAddress,
    },
};
use ::libc::EBADMSG;

//======================================================================================================================
// Constants
//======================================================================================================================

pub const ETHERNET2_HEADER_SIZE: usize = 14;
pub const MIN_PAYLOAD_SIZE: usize = 46;

//======================================================================================================================
// Structures
//======================================================================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ethernet2Header {
    // Bytes 0..6
    dst_addr: MacAddress,
    // Bytes 6..12
    src_addr: MacAddress,
    // Bytes 12..14
    ether_type: EtherType2,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Ethernet2Header {
    /// Creates a header for an Ethernet frame.
    pub fn new(dst_addr: MacAddress, src_addr: MacAddress, ether_type: EtherType2) -> Self {
        Self {
            dst_addr,
            src_addr,
            ether_type,
        }
    }

    /// Parse and strip the ethernet header from the packet in [buf].
    pub fn parse_and_strip(buf: &mut Buffer) -> Result<Self, Fail> {
        if buf.len() < ETHERNET2_HEADER_SIZE {
            return Err(Fail::new(EBADMSG, "frame too small"));
        }
        let hdr_buf: &[u8] = &buf[..ETHERNET2_HEADER_SIZE];
        let dst_addr: MacAddress = MacAddress::from_bytes(&hdr_buf[0..6])?;
        let src_addr: MacAddress = MacAddress::from_bytes(&hdr_buf[6..12])?;
        let ether_type: EtherType2 = EtherType2::try_from(u16::from_be_bytes([hdr_buf[12], hdr_buf[13]]))?;

        buf.adjust(ETHERNET2_HEADER_SIZE)?;
        Ok(Self {
            dst_addr,
            src_addr,
            ether_type,
        })
    }

    /// Create and prepend the ethernet header onto the packet in [buf].
    pub fn serialize_and_attach(&self, buf: &mut Buffer) -> Result<(), Fail> {
        buf.prepend(ETHERNET2_HEADER_SIZE)?;
        buf[0..6].copy_from_slice(self.dst_addr.as_bytes());
        buf[6..12].copy_from_slice(self.src_addr.as_bytes());
        buf[12..14].copy_from_slice(&(self.ether_type as u16).to_be_bytes());
        Ok(())
    }

    pub fn dst_addr(&self) -> MacAddress {
        self.dst_addr
    }

    pub fn src_addr(&self) -> MacAddress {
        self.src_addr
    }

    pub fn ether_type(&self) -> EtherType2 {
        self.ether_type
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensure_eq;
    use ::anyhow::Result;

    #[test]
    fn strips_and_attaches_header() -> Result<()> {
        let dst: MacAddress = MacAddress::new([0x12, 0x23, 0x45, 0x67, 0x89, 0xab]);
        let src: MacAddress = MacAddress::new([0x12, 0x23, 0x45, 0x67, 0x89, 0xac]);
        let mut buf: Buffer = Buffer::from_slice_with_headroom(ETHERNET2_HEADER_SIZE, &[1, 2, 3]);
        Ethernet2Header::new(dst, src, EtherType2::Ipv4).serialize_and_attach(&mut buf)?;
        ensure_eq!(buf.len(), ETHERNET2_HEADER_SIZE + 3);
        ensure_eq!(&buf[12..14], &[0x08, 0x00]);

        let hdr: Ethernet2Header = Ethernet2Header::parse_and_strip(&mut buf)?;
        ensure_eq!(hdr.dst_addr(), dst);
        ensure_eq!(hdr.src_addr(), src);
        ensure_eq!(hdr.ether_type(), EtherType2::Ipv4);
        ensure_eq!(&buf[..], &[1, 2, 3]);
        Ok(())
    }

    #[test]
    fn rejects_short_frame_and_unknown_ethertype() -> Result<()> {
        let mut short: Buffer = Buffer::from_slice(&[0u8; 10]);
        ensure_eq!(Ethernet2Header::parse_and_strip(&mut short).unwrap_err().errno, libc::EBADMSG);

        let mut frame: [u8; 14] = [0xff; 14];
        frame[12..14].copy_from_slice(&0x88ccu16.to_be_bytes());
        let mut unknown: Buffer = Buffer::from_slice(&frame);
        ensure_eq!(Ethernet2Header::parse_and_strip(&mut unknown).unwrap_err().errno, libc::ENOTSUP);
        Ok(())
    }
}
