// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    inetstack::{
        counters::StackCounters,
        protocols::{
            arp::{
                ArpHeader,
                ArpPeer,
            },
            ethernet2::{
                EtherType2,
                Ethernet2Header,
                ETHERNET2_HEADER_SIZE,
                MIN_PAYLOAD_SIZE,
            },
            ipv4::{
                header::{
                    IPV4_DATAGRAM_MAX_SIZE,
                    IPV4_HEADER_MIN_SIZE,
                },
                IpProtocol,
                Ipv4Header,
            },
        },
    },
    runtime::{
        fail::Fail,
        memory::{
            Buffer,
            BufferPool,
        },
        network::{
            types::MacAddress,
            PhysicalLayer,
        },
    },
};
use ::libc::{
    EAGAIN,
    EHOSTUNREACH,
    EMSGSIZE,
};
use ::std::{
    net::Ipv4Addr,
    sync::{
        atomic::{
            AtomicU16,
            Ordering,
        },
        Arc,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Room a datagram needs in front of its payload for the headers this peer attaches.
const HEADERS_SIZE: usize = ETHERNET2_HEADER_SIZE + IPV4_HEADER_MIN_SIZE;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Network layer endpoint: validates inbound datagrams and frames outbound ones, fragmenting those that exceed the MTU.
pub struct Ipv4Peer {
    local_link_addr: MacAddress,
    local_ipv4_addr: Ipv4Addr,
    mtu: usize,
    next_identification: AtomicU16,
    arp: Arc<ArpPeer>,
    device: Arc<dyn PhysicalLayer>,
    pool: BufferPool,
    counters: Arc<StackCounters>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Ipv4Peer {
    pub fn new(
        local_link_addr: MacAddress,
        local_ipv4_addr: Ipv4Addr,
        mtu: usize,
        arp: Arc<ArpPeer>,
        device: Arc<dyn PhysicalLayer>,
        pool: BufferPool,
        counters: Arc<StackCounters>,
    ) -> Self {
        Self {
            local_link_addr,
            local_ipv4_addr,
            mtu,
            next_identification: AtomicU16::new(rand::random::<u16>()),
            arp,
            device,
            pool,
            counters,
        }
    }

    pub fn local_ipv4_addr(&self) -> Ipv4Addr {
        self.local_ipv4_addr
    }

    pub fn local_link_addr(&self) -> MacAddress {
        self.local_link_addr
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn arp(&self) -> &Arc<ArpPeer> {
        &self.arp
    }

    /// Strips the IPv4 header off `buf` and checks that the datagram is addressed to this host.
    pub fn receive(&self, buf: &mut Buffer) -> Result<Ipv4Header, Fail> {
        let header: Ipv4Header = Ipv4Header::parse_and_strip(buf)?;
        let dst_addr: Ipv4Addr = header.get_dest_addr();
        if dst_addr != self.local_ipv4_addr && !dst_addr.is_broadcast() {
            let cause: String = format!("datagram addressed to {}", dst_addr);
            return Err(Fail::new(EHOSTUNREACH, &cause));
        }
        Ok(header)
    }

    /// Sends `payload` to `dst_addr`. Payloads larger than the MTU allows go out as fragments.
    ///
    /// Fails with `EAGAIN` when the link address of `dst_addr` is not known yet; an ARP request is sent out and the
    /// caller may retry later.
    pub fn send(&self, dst_addr: Ipv4Addr, protocol: IpProtocol, payload: Buffer) -> Result<(), Fail> {
        let link_addr: MacAddress = self.resolve(dst_addr)?;
        if IPV4_HEADER_MIN_SIZE + payload.len() > IPV4_DATAGRAM_MAX_SIZE {
            return Err(Fail::new(EMSGSIZE, "payload does not fit in one datagram"));
        }
        let mut header: Ipv4Header = Ipv4Header::new(self.local_ipv4_addr, dst_addr, protocol);
        header.set_identification(self.next_identification.fetch_add(1, Ordering::Relaxed));

        let max_payload: usize = self.mtu - IPV4_HEADER_MIN_SIZE;
        if payload.len() <= max_payload {
            let mut datagram: Buffer = self.with_headroom(payload);
            header.serialize_and_attach(&mut datagram)?;
            return self.transmit_frame(link_addr, EtherType2::Ipv4, datagram);
        }

        // Every fragment but the last carries a multiple of 8 bytes.
        let chunk: usize = max_payload & !7;
        let mut offset: usize = 0;
        trace!(
            "send(): fragmenting {} bytes to {} in chunks of {}",
            payload.len(),
            dst_addr,
            chunk
        );
        while offset < payload.len() {
            let end: usize = (offset + chunk).min(payload.len());
            let mut fragment: Buffer = self.pool.acquire(end - offset);
            fragment.copy_from_slice(&payload[offset..end]);
            header.set_fragment(offset, end < payload.len());
            header.serialize_and_attach(&mut fragment)?;
            self.transmit_frame(link_addr, EtherType2::Ipv4, fragment)?;
            offset = end;
        }
        Ok(())
    }

    /// Sends an ARP message, broadcast unless its target link address is known.
    pub fn send_arp(&self, message: &ArpHeader, dst_link_addr: MacAddress) -> Result<(), Fail> {
        let buf: Buffer = message.to_buffer(self.pool.headroom());
        self.transmit_frame(dst_link_addr, EtherType2::Arp, buf)
    }

    /// Prepends the Ethernet header to `buf` and hands the frame to the device.
    pub fn transmit_frame(&self, dst_link_addr: MacAddress, ether_type: EtherType2, mut buf: Buffer) -> Result<(), Fail> {
        if buf.len() < MIN_PAYLOAD_SIZE && buf.tailroom() >= MIN_PAYLOAD_SIZE - buf.len() {
            let padding: usize = MIN_PAYLOAD_SIZE - buf.len();
            let start: usize = buf.len();
            buf.append(padding)?;
            buf[start..].fill(0);
        }
        Ethernet2Header::new(dst_link_addr, self.local_link_addr, ether_type).serialize_and_attach(&mut buf)?;
        self.device.transmit(buf)?;
        StackCounters::bump(&self.counters.frames_transmitted);
        Ok(())
    }

    fn resolve(&self, dst_addr: Ipv4Addr) -> Result<MacAddress, Fail> {
        if dst_addr.is_broadcast() {
            return Ok(MacAddress::broadcast());
        }
        if let Some(link_addr) = self.arp.lookup(dst_addr) {
            return Ok(link_addr);
        }
        debug!("resolve(): no link address for {}, asking", dst_addr);
        let request: ArpHeader = self.arp.request(dst_addr);
        self.send_arp(&request, MacAddress::broadcast())?;
        let cause: String = format!("link address of {} is not known yet", dst_addr);
        Err(Fail::new(EAGAIN, &cause))
    }

    /// Makes sure the headers fit in front of `payload`, copying it into a pool buffer if needed.
    fn with_headroom(&self, payload: Buffer) -> Buffer {
        if payload.headroom() >= HEADERS_SIZE {
            return payload;
        }
        let mut buf: Buffer = self.pool.acquire(payload.len());
        buf.copy_from_slice(&payload);
        buf
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
