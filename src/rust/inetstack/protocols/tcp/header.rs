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
        tcp::SeqNumber,
    },
    runtime::{
        fail::Fail,
        memory::Buffer,
    },
};
use ::libc::EBADMSG;
use ::std::{
    fmt,
    net::Ipv4Addr,
};

//======================================================================================================================
// Constants
//======================================================================================================================

pub const MIN_TCP_HEADER_SIZE: usize = 20;
pub const MAX_TCP_HEADER_SIZE: usize = 60;

const FLAG_FIN: u8 = 1 << 0;
const FLAG_SYN: u8 = 1 << 1;
const FLAG_RST: u8 = 1 << 2;
const FLAG_PSH: u8 = 1 << 3;
const FLAG_ACK: u8 = 1 << 4;

/// Receive window advertised on every segment. Data is handed to the listener as it arrives, so the window never
/// shrinks.
pub const DEFAULT_WINDOW_SIZE: u16 = 0xffff;

//======================================================================================================================
// Structures
//======================================================================================================================

/// TCP segment header. Options are skipped when parsing and never emitted.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_num: SeqNumber,
    pub ack_num: SeqNumber,
    // Octet 13: [ CWR ] [ ECE ] [ URG ] [ ACK ] [ PSH ] [ RST ] [ SYN ] [ FIN ]
    // Only the flags this stack acts upon are kept.
    pub ack: bool,
    pub psh: bool,
    pub rst: bool,
    pub syn: bool,
    pub fin: bool,
    pub window_size: u16,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl TcpHeader {
    pub fn new(src_port: u16, dst_port: u16) -> Self {
        Self {
            src_port,
            dst_port,
            seq_num: SeqNumber::from(0),
            ack_num: SeqNumber::from(0),
            ack: false,
            psh: false,
            rst: false,
            syn: false,
            fin: false,
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }

    /// Parses and strips the TCP header, options included, off the segment in [buf].
    pub fn parse_and_strip(src_ipv4_addr: &Ipv4Addr, dst_ipv4_addr: &Ipv4Addr, buf: &mut Buffer) -> Result<Self, Fail> {
        if buf.len() < MIN_TCP_HEADER_SIZE {
            return Err(Fail::new(EBADMSG, "TCP segment too small"));
        }
        let data_offset: usize = (buf[12] >> 4) as usize * 4;
        if buf.len() < data_offset {
            return Err(Fail::new(EBADMSG, "TCP segment smaller than data offset"));
        }
        if data_offset < MIN_TCP_HEADER_SIZE {
            return Err(Fail::new(EBADMSG, "TCP data offset too small"));
        }
        if data_offset > MAX_TCP_HEADER_SIZE {
            return Err(Fail::new(EBADMSG, "TCP data offset too large"));
        }
        if Self::checksum(src_ipv4_addr, dst_ipv4_addr, &buf[..]) != 0 {
            return Err(Fail::new(EBADMSG, "TCP checksum mismatch"));
        }

        let hdr_buf: &[u8] = &buf[..MIN_TCP_HEADER_SIZE];
        let flags: u8 = hdr_buf[13];
        let header: TcpHeader = Self {
            src_port: u16::from_be_bytes([hdr_buf[0], hdr_buf[1]]),
            dst_port: u16::from_be_bytes([hdr_buf[2], hdr_buf[3]]),
            seq_num: SeqNumber::from(u32::from_be_bytes([hdr_buf[4], hdr_buf[5], hdr_buf[6], hdr_buf[7]])),
            ack_num: SeqNumber::from(u32::from_be_bytes([hdr_buf[8], hdr_buf[9], hdr_buf[10], hdr_buf[11]])),
            ack: flags & FLAG_ACK != 0,
            psh: flags & FLAG_PSH != 0,
            rst: flags & FLAG_RST != 0,
            syn: flags & FLAG_SYN != 0,
            fin: flags & FLAG_FIN != 0,
            window_size: u16::from_be_bytes([hdr_buf[14], hdr_buf[15]]),
        };

        buf.adjust(data_offset)?;
        Ok(header)
    }

    /// Serializes and prepends the header on to the segment payload in [buf].
    pub fn serialize_and_attach(
        &self,
        buf: &mut Buffer,
        src_ipv4_addr: &Ipv4Addr,
        dst_ipv4_addr: &Ipv4Addr,
    ) -> Result<(), Fail> {
        buf.prepend(MIN_TCP_HEADER_SIZE)?;
        let hdr_buf: &mut [u8] = &mut buf[..MIN_TCP_HEADER_SIZE];
        hdr_buf[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        hdr_buf[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        hdr_buf[4..8].copy_from_slice(&u32::from(self.seq_num).to_be_bytes());
        hdr_buf[8..12].copy_from_slice(&u32::from(self.ack_num).to_be_bytes());
        hdr_buf[12] = ((MIN_TCP_HEADER_SIZE / 4) as u8) << 4;
        hdr_buf[13] = self.flags();
        hdr_buf[14..16].copy_from_slice(&self.window_size.to_be_bytes());
        // Checksum and urgent pointer.
        hdr_buf[16..20].copy_from_slice(&[0; 4]);

        let checksum: u16 = Self::checksum(src_ipv4_addr, dst_ipv4_addr, &buf[..]);
        buf[16..18].copy_from_slice(&checksum.to_be_bytes());
        Ok(())
    }

    /// Sequence space the segment occupies: its payload, plus one for each of SYN and FIN.
    pub fn segment_len(&self, payload_len: usize) -> u32 {
        payload_len as u32 + self.syn as u32 + self.fin as u32
    }

    fn flags(&self) -> u8 {
        let mut flags: u8 = 0;
        if self.ack {
            flags |= FLAG_ACK;
        }
        if self.psh {
            flags |= FLAG_PSH;
        }
        if self.rst {
            flags |= FLAG_RST;
        }
        if self.syn {
            flags |= FLAG_SYN;
        }
        if self.fin {
            flags |= FLAG_FIN;
        }
        flags
    }

    /// Checksum over the IPv4 pseudo header and the whole segment. Yields zero for an intact segment.
    fn checksum(src_ipv4_addr: &Ipv4Addr, dst_ipv4_addr: &Ipv4Addr, segment: &[u8]) -> u16 {
        let state: u32 = compute_pseudo_header_checksum(src_ipv4_addr, dst_ipv4_addr, IpProtocol::TCP, segment.len());
        fold16(compute_generic_checksum(segment, Some(state)))
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Debug for TcpHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: [(bool, &str); 5] = [
            (self.syn, "SYN"),
            (self.fin, "FIN"),
            (self.rst, "RST"),
            (self.psh, "PSH"),
            (self.ack, "ACK"),
        ];
        let flags: Vec<&str> = names.iter().filter(|(set, _)| *set).map(|(_, name)| *name).collect();
        write!(
            f,
            "TcpHeader {{ {} -> {}, [{}], seq={}, ack={} }}",
            self.src_port,
            self.dst_port,
            flags.join("|"),
            self.seq_num,
            self.ack_num
        )
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
