// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::std::{
    net::{
        Ipv4Addr,
        SocketAddrV4,
    },
    sync::{
        atomic::Ordering,
        Arc,
    },
    time::Duration,
};
use ::tapstack::{
    ensure_eq,
    inetstack::{
        protocols::{
            arp::{
                ArpHeader,
                ArpOperation,
            },
            ethernet2::{
                EtherType2,
                Ethernet2Header,
            },
            icmpv4::{
                Icmpv4Header,
                Icmpv4Type,
            },
            ipv4::{
                IpProtocol,
                Ipv4Header,
            },
            udp::{
                UdpHandle,
                UdpHeader,
            },
        },
        test_helpers::{
            self,
            LoopbackDevice,
            ALICE_IPV4,
            ALICE_MAC,
            BOB_IPV4,
            BOB_MAC,
        },
        MIN_HEADER_RESERVE,
    },
    Buffer,
    InetStack,
    MacAddress,
};

//======================================================================================================================
// Constants
//======================================================================================================================

const ECHO_PORT: u16 = 7;
const BOB_PORT: u16 = 5353;

//======================================================================================================================
// Helpers
//======================================================================================================================

fn echo_stack() -> Result<(Arc<InetStack>, Arc<LoopbackDevice>)> {
    let (stack, device) = common::new_alice(common::MTU)?;
    stack.register_udp_listener(
        ECHO_PORT,
        Arc::new(|handle: &UdpHandle, payload: Buffer, addr: Ipv4Addr, port: u16| {
            let _ = handle.send_to(&payload, addr, port);
        }),
    )?;
    Ok((stack, device))
}

fn datagram_to(port: u16, payload: &[u8]) -> Result<Buffer> {
    Ok(test_helpers::udp_frame(
        SocketAddrV4::new(BOB_IPV4, BOB_PORT),
        SocketAddrV4::new(ALICE_IPV4, port),
        payload,
    )?)
}

//======================================================================================================================
// Tests
//======================================================================================================================

#[test]
fn datagram_is_echoed() -> Result<()> {
    let (stack, device) = echo_stack()?;
    stack.receive_frame(datagram_to(ECHO_PORT, b"are you there?")?)?;

    let frame: Buffer = common::next_frame(&device)?;
    let (eth, ipv4, mut datagram): (Ethernet2Header, Ipv4Header, Buffer) = test_helpers::strip_frame(frame)?;
    ensure_eq!(eth.dst_addr(), BOB_MAC);
    ensure_eq!(ipv4.get_protocol(), IpProtocol::UDP);
    ensure_eq!(ipv4.get_dest_addr(), BOB_IPV4);
    let header: UdpHeader = UdpHeader::parse_and_strip(&ipv4.get_src_addr(), &ipv4.get_dest_addr(), &mut datagram)?;
    ensure_eq!(header.src_port(), ECHO_PORT);
    ensure_eq!(header.dest_port(), BOB_PORT);
    ensure_eq!(&datagram[..], b"are you there?");
    stack.shutdown();
    Ok(())
}

/// A reply larger than the MTU leaves as fragments on 8-byte boundaries.
#[test]
fn large_reply_is_fragmented() -> Result<()> {
    let (stack, device) = common::new_alice(600)?;
    stack.register_udp_listener(
        ECHO_PORT,
        Arc::new(|handle: &UdpHandle, payload: Buffer, addr: Ipv4Addr, port: u16| {
            let _ = handle.send_to(&payload, addr, port);
        }),
    )?;
    let payload: Vec<u8> = (0..1400).map(|i| (i % 199) as u8).collect();
    let segment: Buffer = test_helpers::udp_segment(
        SocketAddrV4::new(BOB_IPV4, BOB_PORT),
        SocketAddrV4::new(ALICE_IPV4, ECHO_PORT),
        &payload,
    )?;
    for frame in test_helpers::fragment_frames(BOB_IPV4, ALICE_IPV4, IpProtocol::UDP, 9, &segment, 576)? {
        stack.receive_frame(frame)?;
    }

    // 1408 bytes of UDP over an MTU of 600.
    let mut sizes: Vec<usize> = Vec::new();
    let mut reassembled: Vec<u8> = Vec::new();
    for _ in 0..3 {
        let (_, ipv4, fragment): (Ethernet2Header, Ipv4Header, Buffer) =
            test_helpers::strip_frame(common::next_frame(&device)?)?;
        ensure_eq!(ipv4.fragment_offset(), reassembled.len());
        sizes.push(fragment.len());
        reassembled.extend_from_slice(&fragment);
    }
    ensure_eq!(sizes, vec![576, 576, 256]);
    ensure_eq!(&reassembled[8..], &payload[..]);
    stack.shutdown();
    Ok(())
}

#[test]
fn datagram_to_unbound_port_is_dropped() -> Result<()> {
    let (stack, device) = echo_stack()?;
    stack.receive_frame(datagram_to(ECHO_PORT + 1, b"anyone?")?)?;
    common::wait_for(|| stack.counters().packets_dropped.load(Ordering::Relaxed) == 1)?;
    ensure_eq!(device.pop_timeout(Duration::from_millis(100)).is_none(), true);
    stack.shutdown();
    Ok(())
}

#[test]
fn listener_registration_is_exclusive() -> Result<()> {
    let (stack, _device) = echo_stack()?;
    let again = stack.register_udp_listener(ECHO_PORT, Arc::new(|_: &UdpHandle, _: Buffer, _: Ipv4Addr, _: u16| {}));
    ensure_eq!(again.map_err(|e| e.errno), Err(libc::EADDRINUSE));
    stack.deregister(ECHO_PORT)?;
    ensure_eq!(stack.udp().is_registered(ECHO_PORT), false);
    ensure_eq!(stack.deregister(ECHO_PORT).map_err(|e| e.errno), Err(libc::ENOENT));
    stack.shutdown();
    Ok(())
}

#[test]
fn header_reserve_must_fit_outbound_headers() -> Result<()> {
    let too_small = test_helpers::alice_config_with_reserve(common::MTU, MIN_HEADER_RESERVE - 14)?;
    let device: Arc<LoopbackDevice> = Arc::new(LoopbackDevice::new());
    let stack = InetStack::new(&too_small, device.clone());
    ensure_eq!(stack.map(|_| ()).map_err(|e| e.errno), Err(libc::EINVAL));

    let exact = test_helpers::alice_config_with_reserve(common::MTU, MIN_HEADER_RESERVE)?;
    let stack: Arc<InetStack> = InetStack::new(&exact, device)?;
    stack.shutdown();
    Ok(())
}

#[test]
fn frame_for_another_host_is_dropped() -> Result<()> {
    let (stack, device) = echo_stack()?;
    let mut frame: Buffer = datagram_to(ECHO_PORT, b"not for you")?;
    let other: MacAddress = MacAddress::new([0x02, 0, 0, 0, 0, 0x99]);
    frame[0..6].copy_from_slice(other.as_bytes());
    stack.receive_frame(frame)?;
    common::wait_for(|| stack.counters().packets_dropped.load(Ordering::Relaxed) == 1)?;
    ensure_eq!(device.pending(), 0);
    stack.shutdown();
    Ok(())
}

#[test]
fn arp_request_is_answered() -> Result<()> {
    let (stack, device) = echo_stack()?;
    let request: ArpHeader = ArpHeader::new(ArpOperation::Request, BOB_MAC, BOB_IPV4, MacAddress::nil(), ALICE_IPV4);
    let mut frame: Buffer = request.to_buffer(64);
    Ethernet2Header::new(MacAddress::broadcast(), BOB_MAC, EtherType2::Arp).serialize_and_attach(&mut frame)?;
    stack.receive_frame(frame)?;

    let mut reply: Buffer = common::next_frame(&device)?;
    let eth: Ethernet2Header = Ethernet2Header::parse_and_strip(&mut reply)?;
    ensure_eq!(eth.ether_type(), EtherType2::Arp);
    ensure_eq!(eth.dst_addr(), BOB_MAC);
    let reply: ArpHeader = ArpHeader::parse(&reply)?;
    ensure_eq!(reply.get_operation(), ArpOperation::Reply);
    ensure_eq!(reply.get_sender_hardware_addr(), ALICE_MAC);
    ensure_eq!(reply.get_destination_protocol_addr(), BOB_IPV4);
    stack.shutdown();
    Ok(())
}

#[test]
fn ping_is_answered() -> Result<()> {
    let (stack, device) = echo_stack()?;
    let mut request: Buffer = Buffer::from_slice_with_headroom(64, b"abcdefgh");
    Icmpv4Header::new(Icmpv4Type::EchoRequest { id: 1, seq_num: 42 }, 0).serialize_and_attach(&mut request)?;
    Ipv4Header::new(BOB_IPV4, ALICE_IPV4, IpProtocol::ICMPv4).serialize_and_attach(&mut request)?;
    stack.receive_frame(test_helpers::ethernet_frame(request)?)?;

    let (_, ipv4, mut message) = test_helpers::strip_frame(common::next_frame(&device)?)?;
    ensure_eq!(ipv4.get_protocol(), IpProtocol::ICMPv4);
    let reply: Icmpv4Header = Icmpv4Header::parse_and_strip(&mut message)?;
    ensure_eq!(reply.get_type(), Icmpv4Type::EchoReply { id: 1, seq_num: 42 });
    ensure_eq!(&message[..], b"abcdefgh");
    stack.shutdown();
    Ok(())
}
