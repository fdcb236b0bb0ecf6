// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    inetstack::protocols::{
        ethernet2::{
            EtherType2,
            Ethernet2Header,
        },
        ipv4::{
            IpProtocol,
            Ipv4Header,
        },
        tcp::TcpHeader,
        udp::UdpHeader,
    },
    runtime::{
        config::Config,
        fail::Fail,
        memory::Buffer,
        network::{
            types::MacAddress,
            PhysicalLayer,
        },
    },
};
use ::crossbeam_channel::{
    Receiver,
    RecvTimeoutError,
    Sender,
};
use ::libc::{
    EAGAIN,
    EMSGSIZE,
    ENOTCONN,
};
use ::std::{
    net::{
        Ipv4Addr,
        SocketAddrV4,
    },
    time::Duration,
};

//======================================================================================================================
// Constants
//======================================================================================================================

pub const ALICE_MAC: MacAddress = MacAddress::new([0x12, 0x23, 0x45, 0x67, 0x89, 0xab]);
pub const ALICE_IPV4: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
pub const BOB_MAC: MacAddress = MacAddress::new([0xab, 0x89, 0x67, 0x45, 0x23, 0x12]);
pub const BOB_IPV4: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 2);

/// Room left in front of hand-built frames. Matches the default header reserve of the pool.
const HEADROOM: usize = 128;

/// How long [LoopbackDevice::receive] blocks before reporting `EAGAIN`.
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

//======================================================================================================================
// Structures
//======================================================================================================================

/// In-memory link. Tests push inbound frames and pop the frames the stack transmitted.
pub struct LoopbackDevice {
    inbound_tx: Sender<Buffer>,
    inbound_rx: Receiver<Buffer>,
    outbound_tx: Sender<Buffer>,
    outbound_rx: Receiver<Buffer>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl LoopbackDevice {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx): (Sender<Buffer>, Receiver<Buffer>) = crossbeam_channel::unbounded();
        let (outbound_tx, outbound_rx): (Sender<Buffer>, Receiver<Buffer>) = crossbeam_channel::unbounded();
        Self {
            inbound_tx,
            inbound_rx,
            outbound_tx,
            outbound_rx,
        }
    }

    /// Queues a frame for the stack to receive.
    pub fn push(&self, frame: Buffer) {
        // Both channel ends live in self, so sending cannot fail.
        let _ = self.inbound_tx.send(frame);
    }

    /// Takes the oldest transmitted frame, if any.
    pub fn pop(&self) -> Option<Buffer> {
        self.outbound_rx.try_recv().ok()
    }

    /// Waits up to `timeout` for a transmitted frame.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Buffer> {
        self.outbound_rx.recv_timeout(timeout).ok()
    }

    /// Number of transmitted frames not popped yet.
    pub fn pending(&self) -> usize {
        self.outbound_rx.len()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for LoopbackDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicalLayer for LoopbackDevice {
    /// Copies the frame out so that pool buffers go back to their pool right away.
    fn transmit(&self, frame: Buffer) -> Result<(), Fail> {
        let copy: Buffer = Buffer::from_slice(&frame);
        self.outbound_tx
            .send(copy)
            .map_err(|_| Fail::new(ENOTCONN, "loopback device is gone"))
    }

    fn receive(&self, buf: &mut Buffer) -> Result<usize, Fail> {
        let frame: Buffer = match self.inbound_rx.recv_timeout(RECEIVE_TIMEOUT) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => return Err(Fail::new(EAGAIN, "no frame")),
            Err(RecvTimeoutError::Disconnected) => return Err(Fail::new(ENOTCONN, "loopback device is gone")),
        };
        if frame.len() > buf.len() {
            return Err(Fail::new(EMSGSIZE, "frame does not fit in receive buffer"));
        }
        buf[..frame.len()].copy_from_slice(&frame);
        Ok(frame.len())
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Configuration for a stack playing Alice, with Bob in its ARP table.
pub fn alice_config(mtu: u16) -> Result<Config, Fail> {
    alice_config_with_reserve(mtu, HEADROOM)
}

/// Same as [alice_config], with `header_reserve` bytes kept in front of every pooled buffer.
pub fn alice_config_with_reserve(mtu: u16, header_reserve: usize) -> Result<Config, Fail> {
    let yaml: String = format!(
        "tapstack:\n  local_ipv4_addr: {}\n  local_link_addr: \"{}\"\n  mtu: {}\n  arp_table:\n    \"{}\": \"{}\"\n\
         scheduler:\n  worker_threads: 2\n  timer_threads: 1\n\
         memory:\n  pool_buffers: 256\n  buffer_size: 2048\n  header_reserve: {}\n\
         reassembly:\n  partitions: 2\n  base_ttl_micros: 100000\n  giveup_ttl_micros: 400000\n",
        ALICE_IPV4,
        ALICE_MAC,
        mtu,
        BOB_IPV4,
        BOB_MAC,
        header_reserve,
    );
    Config::from_str(&yaml)
}

/// Wraps an IPv4 datagram into a frame from Bob to Alice.
pub fn ethernet_frame(mut datagram: Buffer) -> Result<Buffer, Fail> {
    Ethernet2Header::new(ALICE_MAC, BOB_MAC, EtherType2::Ipv4).serialize_and_attach(&mut datagram)?;
    Ok(datagram)
}

/// Builds a UDP datagram from `src` to `dst`, without the IPv4 header.
pub fn udp_segment(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Result<Buffer, Fail> {
    let mut buf: Buffer = Buffer::from_slice_with_headroom(HEADROOM, payload);
    UdpHeader::new(src.port(), dst.port()).serialize_and_attach(&mut buf, src.ip(), dst.ip())?;
    Ok(buf)
}

/// Builds a complete, unfragmented UDP frame from `src` to `dst`.
pub fn udp_frame(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Result<Buffer, Fail> {
    let mut buf: Buffer = udp_segment(src, dst, payload)?;
    Ipv4Header::new(*src.ip(), *dst.ip(), IpProtocol::UDP).serialize_and_attach(&mut buf)?;
    ethernet_frame(buf)
}

/// Builds a complete TCP frame from `src` to `dst`.
pub fn tcp_frame(src: SocketAddrV4, dst: SocketAddrV4, header: &TcpHeader, payload: &[u8]) -> Result<Buffer, Fail> {
    let mut buf: Buffer = Buffer::from_slice_with_headroom(HEADROOM, payload);
    header.serialize_and_attach(&mut buf, src.ip(), dst.ip())?;
    Ipv4Header::new(*src.ip(), *dst.ip(), IpProtocol::TCP).serialize_and_attach(&mut buf)?;
    ethernet_frame(buf)
}

/// Splits `payload` into fragment frames of `chunk` bytes (a multiple of 8), all sharing `identification`.
pub fn fragment_frames(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: IpProtocol,
    identification: u16,
    payload: &[u8],
    chunk: usize,
) -> Result<Vec<Buffer>, Fail> {
    let mut frames: Vec<Buffer> = Vec::new();
    let mut header: Ipv4Header = Ipv4Header::new(src, dst, protocol);
    header.set_identification(identification);
    let mut offset: usize = 0;
    while offset < payload.len() {
        let end: usize = (offset + chunk).min(payload.len());
        let mut buf: Buffer = Buffer::from_slice_with_headroom(HEADROOM, &payload[offset..end]);
        header.set_fragment(offset, end < payload.len());
        header.serialize_and_attach(&mut buf)?;
        frames.push(ethernet_frame(buf)?);
        offset = end;
    }
    Ok(frames)
}

/// Strips the link and network headers off a transmitted frame.
pub fn strip_frame(mut frame: Buffer) -> Result<(Ethernet2Header, Ipv4Header, Buffer), Fail> {
    let eth: Ethernet2Header = Ethernet2Header::parse_and_strip(&mut frame)?;
    let ipv4: Ipv4Header = Ipv4Header::parse_and_strip(&mut frame)?;
    Ok((eth, ipv4, frame))
}
