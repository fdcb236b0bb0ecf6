// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    inetstack::protocols::ipv4::IpProtocol,
    runtime::{
        fail::Fail,
        memory::Buffer,
    },
};
use ::libc::{
    EBADMSG,
    ENOTSUP,
};
use ::std::{
    convert::TryFrom,
    net::Ipv4Addr,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Minimum size of IPv4 header (in bytes).
pub const IPV4_HEADER_MIN_SIZE: usize = 20;

/// Largest datagram the total length field can describe (in bytes).
pub const IPV4_DATAGRAM_MAX_SIZE: usize = u16::MAX as usize;

/// IPv4 header length when no options are present (in 32-bit words).
const IPV4_IHL_NO_OPTIONS: u8 = (IPV4_HEADER_MIN_SIZE as u8) / 4;

/// Default time to live value.
const DEFAULT_IPV4_TTL: u8 = 255;

/// Version number for IPv4.
const IPV4_VERSION: u8 = 4;

/// IPv4 Control Flag: Datagram has evil intent (see RFC 3514).
const IPV4_CTRL_FLAG_EVIL: u8 = 0x4;

/// IPv4 Control Flag: Don't Fragment.
const IPV4_CTRL_FLAG_DF: u8 = 0x2;

/// IPv4 Control Flag: More Fragments.
const IPV4_CTRL_FLAG_MF: u8 = 0x1;

//======================================================================================================================
// Structures
//======================================================================================================================

/// IPv4 Datagram Header
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Internet header version (4 bits).
    version: u8,
    /// Internet Header Length. (4 bits).
    ihl: u8,
    /// Differentiated Services Code Point (6 bits).
    dscp: u8,
    /// Explicit Congestion Notification (2 bits).
    ecn: u8,
    /// Total length of the packet including header and data (16 bits).
    total_length: u16,
    /// Used to identify the datagram to which a fragment belongs (16 bits).
    identification: u16,
    /// Control flags (3 bits).
    flags: u8,
    /// Fragment offset, in 8-byte units (13 bits).
    fragment_offset: u16,
    /// Time to Live indicates the maximum remaining time the datagram is allowed to be in the network (8 bits).
    ttl: u8,
    /// Protocol used in the data portion of the datagram (8 bits).
    protocol: IpProtocol,
    // Source IP address (32 bits).
    src_addr: Ipv4Addr,
    /// Destination IP address (32 bits).
    dst_addr: Ipv4Addr,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Ipv4Header {
    /// Instantiates a header for an unfragmented datagram.
    pub fn new(src_addr: Ipv4Addr, dst_addr: Ipv4Addr, protocol: IpProtocol) -> Self {
        Self {
            version: IPV4_VERSION,
            ihl: IPV4_IHL_NO_OPTIONS,
            dscp: 0,
            ecn: 0,
            total_length: IPV4_HEADER_MIN_SIZE as u16,
            identification: 0,
            flags: IPV4_CTRL_FLAG_DF,
            fragment_offset: 0,
            ttl: DEFAULT_IPV4_TTL,
            protocol,
            src_addr,
            dst_addr,
        }
    }

    /// Computes the size of the target IPv4 header.
    pub fn compute_size(&self) -> usize {
        (self.ihl as usize) << 2
    }

    /// Parses and strips the IPv4 header off the datagram in [buf]. Link-layer padding is trimmed as well, so the
    /// buffer is left holding exactly the payload. Fragments are accepted; see [Ipv4Header::is_fragment].
    pub fn parse_and_strip(buf: &mut Buffer) -> Result<Self, Fail> {
        // The datagram should be as big as the header.
        if buf.len() < IPV4_HEADER_MIN_SIZE {
            return Err(Fail::new(EBADMSG, "ipv4 datagram too small"));
        }

        // IP version number.
        let version: u8 = buf[0] >> 4;
        if version != IPV4_VERSION {
            return Err(Fail::new(ENOTSUP, "unsupported IP version"));
        }

        // Internet header length.
        let ihl: u8 = buf[0] & 0xF;
        let hdr_size: usize = (ihl as usize) << 2;
        if hdr_size < IPV4_HEADER_MIN_SIZE {
            return Err(Fail::new(EBADMSG, "ipv4 IHL is too small"));
        }
        if buf.len() < hdr_size {
            return Err(Fail::new(EBADMSG, "ipv4 datagram too small to fit in header"));
        }
        let hdr_buf: &[u8] = &buf[..hdr_size];

        // Differentiated services code point.
        let dscp: u8 = hdr_buf[1] >> 2;
        if dscp != 0 {
            warn!("ignoring dscp field (dscp={:?})", dscp);
        }

        // Explicit congestion notification.
        let ecn: u8 = hdr_buf[1] & 3;
        if ecn != 0 {
            warn!("ignoring ecn field (ecn={:?})", ecn);
        }

        // Total length.
        let total_length: u16 = u16::from_be_bytes([hdr_buf[2], hdr_buf[3]]);
        if (total_length as usize) < hdr_size {
            return Err(Fail::new(EBADMSG, "ipv4 datagram smaller than header"));
        }
        // NOTE: there may be padding bytes in the buffer.
        if (total_length as usize) > buf.len() {
            return Err(Fail::new(EBADMSG, "ipv4 datagram size mismatch"));
        }

        // Identification. Required to be unique per (source, destination, protocol) for every datagram that may be
        // fragmented.
        let identification: u16 = u16::from_be_bytes([hdr_buf[4], hdr_buf[5]]);

        // Control flags.
        let flags: u8 = hdr_buf[6] >> 5;
        // Don't accept evil datagrams (see RFC 3514).
        if flags & IPV4_CTRL_FLAG_EVIL != 0 {
            return Err(Fail::new(EBADMSG, "ipv4 datagram is marked as evil"));
        }

        // Fragment offset.
        let fragment_offset: u16 = u16::from_be_bytes([hdr_buf[6], hdr_buf[7]]) & 0x1fff;
        if flags & IPV4_CTRL_FLAG_DF != 0 && (flags & IPV4_CTRL_FLAG_MF != 0 || fragment_offset != 0) {
            return Err(Fail::new(EBADMSG, "ipv4 fragment has the don't fragment flag set"));
        }

        // Time to live.
        let time_to_live: u8 = hdr_buf[8];
        if time_to_live == 0 {
            return Err(Fail::new(EBADMSG, "ipv4 datagram too old"));
        }

        // Protocol.
        let protocol: IpProtocol = IpProtocol::try_from(hdr_buf[9])?;

        // Header checksum.
        let header_checksum: u16 = u16::from_be_bytes([hdr_buf[10], hdr_buf[11]]);
        if header_checksum == 0xffff {
            return Err(Fail::new(EBADMSG, "ipv4 checksum invalid"));
        }
        if header_checksum != Self::compute_checksum(hdr_buf) {
            return Err(Fail::new(EBADMSG, "ipv4 checksum mismatch"));
        }

        // Source address.
        let src_addr: Ipv4Addr = Ipv4Addr::new(hdr_buf[12], hdr_buf[13], hdr_buf[14], hdr_buf[15]);

        // Destination address.
        let dst_addr: Ipv4Addr = Ipv4Addr::new(hdr_buf[16], hdr_buf[17], hdr_buf[18], hdr_buf[19]);

        // Truncate datagram.
        let padding_bytes: usize = buf.len() - (total_length as usize);
        buf.adjust(hdr_size)?;
        buf.trim(padding_bytes)?;

        Ok(Self {
            version,
            ihl,
            dscp,
            ecn,
            total_length,
            identification,
            flags,
            fragment_offset,
            ttl: time_to_live,
            protocol,
            src_addr,
            dst_addr,
        })
    }

    /// Serializes the header and prepends it to the payload in [buf]. Options are never emitted.
    pub fn serialize_and_attach(&self, buf: &mut Buffer) -> Result<(), Fail> {
        let total_length: usize = IPV4_HEADER_MIN_SIZE + buf.len();
        if total_length > IPV4_DATAGRAM_MAX_SIZE {
            return Err(Fail::new(EBADMSG, "ipv4 datagram too large"));
        }
        buf.prepend(IPV4_HEADER_MIN_SIZE)?;
        let hdr_buf: &mut [u8] = &mut buf[..IPV4_HEADER_MIN_SIZE];

        // Version + IHL.
        hdr_buf[0] = (self.version << 4) | IPV4_IHL_NO_OPTIONS;

        // DSCP + ECN.
        hdr_buf[1] = (self.dscp << 2) | (self.ecn & 3);

        // Total Length.
        hdr_buf[2..4].copy_from_slice(&(total_length as u16).to_be_bytes());

        // Identification.
        hdr_buf[4..6].copy_from_slice(&self.identification.to_be_bytes());

        // Flags and Fragment Offset.
        hdr_buf[6..8].copy_from_slice(&((self.flags as u16) << 13 | self.fragment_offset & 0x1fff).to_be_bytes());

        // Time to Live.
        hdr_buf[8] = self.ttl;

        // Protocol.
        hdr_buf[9] = self.protocol as u8;

        // Source Address.
        hdr_buf[12..16].copy_from_slice(&self.src_addr.octets());

        // Destination Address.
        hdr_buf[16..20].copy_from_slice(&self.dst_addr.octets());

        // Header Checksum, computed last.
        let checksum: u16 = Self::compute_checksum(hdr_buf);
        hdr_buf[10..12].copy_from_slice(&checksum.to_be_bytes());
        Ok(())
    }

    /// Returns the source address field stored in the target IPv4 header.
    pub fn get_src_addr(&self) -> Ipv4Addr {
        self.src_addr
    }

    /// Returns the destination address field stored in the target IPv4 header.
    pub fn get_dest_addr(&self) -> Ipv4Addr {
        self.dst_addr
    }

    /// Returns the protocol field stored in the target IPv4 header.
    pub fn get_protocol(&self) -> IpProtocol {
        self.protocol
    }

    pub fn get_identification(&self) -> u16 {
        self.identification
    }

    /// Total length, header included, as read off the wire.
    pub fn get_total_length(&self) -> usize {
        self.total_length as usize
    }

    /// Whether more fragments of this datagram follow.
    pub fn more_fragments(&self) -> bool {
        self.flags & IPV4_CTRL_FLAG_MF != 0
    }

    /// Offset of this fragment's payload within the original datagram payload, in bytes.
    pub fn fragment_offset(&self) -> usize {
        (self.fragment_offset as usize) << 3
    }

    /// Whether this header describes a piece of a larger datagram.
    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset != 0
    }

    pub fn set_identification(&mut self, identification: u16) {
        self.identification = identification;
    }

    /// Marks the header as the fragment at `offset` bytes. `offset` must be a multiple of 8.
    pub fn set_fragment(&mut self, offset: usize, more_fragments: bool) {
        debug_assert_eq!(offset % 8, 0);
        self.fragment_offset = (offset >> 3) as u16;
        self.flags = if more_fragments { IPV4_CTRL_FLAG_MF } else { 0 };
    }

    /// Turns a fragment's header into the header of the reassembled datagram carrying `payload_len` bytes.
    pub fn into_reassembled(mut self, payload_len: usize) -> Self {
        self.fragment_offset = 0;
        self.flags = 0;
        self.ihl = IPV4_IHL_NO_OPTIONS;
        self.total_length = (IPV4_HEADER_MIN_SIZE + payload_len).min(IPV4_DATAGRAM_MAX_SIZE) as u16;
        self
    }

    /// Computes the checksum of the target IPv4 header.
    pub fn compute_checksum(buf: &[u8]) -> u16 {
        let mut state: u32 = 0xffff;
        let hdr_size: usize = ((buf[0] & 0xF) as usize) << 2;
        for i in 0..(hdr_size / 2) {
            // Octets 10-12 are the header checksum, whose value should be zero when computing a checksum.
            if i == 5 {
                continue;
            }
            state += u16::from_be_bytes([buf[2 * i], buf[2 * i + 1]]) as u32;
        }
        while state > 0xffff {
            state -= 0xffff;
        }
        !state as u16
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
