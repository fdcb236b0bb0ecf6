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
};
use ::tapstack::{
    ensure_eq,
    inetstack::{
        protocols::{
            ethernet2::Ethernet2Header,
            ipv4::{
                IpProtocol,
                Ipv4Header,
            },
            tcp::{
                SeqNumber,
                TcpHandle,
                TcpHeader,
                TcpState,
            },
        },
        test_helpers::{
            self,
            LoopbackDevice,
            ALICE_IPV4,
            BOB_IPV4,
            BOB_MAC,
        },
    },
    Buffer,
    InetStack,
};

//======================================================================================================================
// Constants
//======================================================================================================================

const ECHO_PORT: u16 = 7;
const CLOSED_PORT: u16 = 8;
const BOB_PORT: u16 = 40000;
const BOB_ISN: u32 = 1000;

//======================================================================================================================
// Helpers
//======================================================================================================================

fn alice() -> SocketAddrV4 {
    SocketAddrV4::new(ALICE_IPV4, ECHO_PORT)
}

fn bob() -> SocketAddrV4 {
    SocketAddrV4::new(BOB_IPV4, BOB_PORT)
}

/// Brings up Alice with a TCP echo listener.
fn echo_stack() -> Result<(Arc<InetStack>, Arc<LoopbackDevice>)> {
    let (stack, device) = common::new_alice(common::MTU)?;
    stack.register_tcp_listener(
        ECHO_PORT,
        Arc::new(|handle: &TcpHandle, payload: Buffer, addr: Ipv4Addr, port: u16| {
            let _ = handle.send(addr, port, &payload);
        }),
    )?;
    Ok((stack, device))
}

/// Sends a segment from Bob to `dst`.
fn send(stack: &Arc<InetStack>, dst: SocketAddrV4, header: &TcpHeader, payload: &[u8]) -> Result<()> {
    stack.receive_frame(test_helpers::tcp_frame(bob(), dst, header, payload)?)?;
    Ok(())
}

/// Waits for the next segment Alice sends to Bob.
fn next_segment(device: &LoopbackDevice) -> Result<(TcpHeader, Buffer)> {
    let frame: Buffer = common::next_frame(device)?;
    let (eth, ipv4, mut segment): (Ethernet2Header, Ipv4Header, Buffer) = test_helpers::strip_frame(frame)?;
    ensure_eq!(eth.dst_addr(), BOB_MAC);
    ensure_eq!(ipv4.get_protocol(), IpProtocol::TCP);
    let header: TcpHeader = TcpHeader::parse_and_strip(&ipv4.get_src_addr(), &ipv4.get_dest_addr(), &mut segment)?;
    Ok((header, segment))
}

/// Runs the three-way handshake as Bob. Returns Alice's next sequence number.
fn connect(stack: &Arc<InetStack>, device: &LoopbackDevice) -> Result<SeqNumber> {
    let mut syn: TcpHeader = TcpHeader::new(BOB_PORT, ECHO_PORT);
    syn.syn = true;
    syn.seq_num = SeqNumber::from(BOB_ISN);
    send(stack, alice(), &syn, &[])?;

    let (syn_ack, _): (TcpHeader, Buffer) = next_segment(device)?;
    ensure_eq!(syn_ack.syn, true);
    ensure_eq!(syn_ack.ack, true);
    ensure_eq!(syn_ack.ack_num, SeqNumber::from(BOB_ISN + 1));

    let alice_seq: SeqNumber = syn_ack.seq_num + 1;
    let mut ack: TcpHeader = TcpHeader::new(BOB_PORT, ECHO_PORT);
    ack.ack = true;
    ack.seq_num = SeqNumber::from(BOB_ISN + 1);
    ack.ack_num = alice_seq;
    send(stack, alice(), &ack, &[])?;
    common::wait_for(|| connection_state(stack) == Some(TcpState::Established))?;
    Ok(alice_seq)
}

fn connection_state(stack: &InetStack) -> Option<TcpState> {
    stack
        .tcp()
        .server(ECHO_PORT)
        .and_then(|server| server.connection_state(&bob()))
}

//======================================================================================================================
// Tests
//======================================================================================================================

#[test]
fn handshake_establishes_connection() -> Result<()> {
    let (stack, device) = echo_stack()?;
    connect(&stack, &device)?;
    ensure_eq!(stack.tcp().server(ECHO_PORT).map(|server| server.connection_count()), Some(1));
    stack.shutdown();
    Ok(())
}

#[test]
fn data_is_acknowledged_and_echoed() -> Result<()> {
    let (stack, device) = echo_stack()?;
    let alice_seq: SeqNumber = connect(&stack, &device)?;

    let mut data: TcpHeader = TcpHeader::new(BOB_PORT, ECHO_PORT);
    data.ack = true;
    data.psh = true;
    data.seq_num = SeqNumber::from(BOB_ISN + 1);
    data.ack_num = alice_seq;
    send(&stack, alice(), &data, b"hello")?;

    let (ack, payload): (TcpHeader, Buffer) = next_segment(&device)?;
    ensure_eq!(ack.ack_num, SeqNumber::from(BOB_ISN + 6));
    ensure_eq!(payload.len(), 0);

    let (echo, payload): (TcpHeader, Buffer) = next_segment(&device)?;
    ensure_eq!(echo.seq_num, alice_seq);
    ensure_eq!(&payload[..], b"hello");
    stack.shutdown();
    Ok(())
}

#[test]
fn passive_close_releases_connection() -> Result<()> {
    let (stack, device) = echo_stack()?;
    let alice_seq: SeqNumber = connect(&stack, &device)?;

    let mut fin: TcpHeader = TcpHeader::new(BOB_PORT, ECHO_PORT);
    fin.ack = true;
    fin.fin = true;
    fin.seq_num = SeqNumber::from(BOB_ISN + 1);
    fin.ack_num = alice_seq;
    send(&stack, alice(), &fin, &[])?;

    let (ack, _): (TcpHeader, Buffer) = next_segment(&device)?;
    ensure_eq!(ack.ack_num, SeqNumber::from(BOB_ISN + 2));
    let (alice_fin, _): (TcpHeader, Buffer) = next_segment(&device)?;
    ensure_eq!(alice_fin.fin, true);
    common::wait_for(|| connection_state(&stack) == Some(TcpState::LastAck))?;

    let mut last_ack: TcpHeader = TcpHeader::new(BOB_PORT, ECHO_PORT);
    last_ack.ack = true;
    last_ack.seq_num = SeqNumber::from(BOB_ISN + 2);
    last_ack.ack_num = alice_fin.seq_num + 1;
    send(&stack, alice(), &last_ack, &[])?;
    common::wait_for(|| connection_state(&stack).is_none())?;
    stack.shutdown();
    Ok(())
}

#[test]
fn syn_to_closed_port_is_reset() -> Result<()> {
    let (stack, device) = echo_stack()?;
    let mut syn: TcpHeader = TcpHeader::new(BOB_PORT, CLOSED_PORT);
    syn.syn = true;
    syn.seq_num = SeqNumber::from(BOB_ISN);
    send(&stack, SocketAddrV4::new(ALICE_IPV4, CLOSED_PORT), &syn, &[])?;

    let (rst, _): (TcpHeader, Buffer) = next_segment(&device)?;
    ensure_eq!(rst.rst, true);
    ensure_eq!(rst.ack, true);
    ensure_eq!(rst.ack_num, SeqNumber::from(BOB_ISN + 1));
    ensure_eq!(rst.src_port, CLOSED_PORT);
    ensure_eq!(stack.counters().tcp_resets_sent.load(Ordering::Relaxed), 1);
    stack.shutdown();
    Ok(())
}

#[test]
fn stray_ack_is_reset() -> Result<()> {
    let (stack, device) = echo_stack()?;
    let mut ack: TcpHeader = TcpHeader::new(BOB_PORT, ECHO_PORT);
    ack.ack = true;
    ack.seq_num = SeqNumber::from(BOB_ISN);
    ack.ack_num = SeqNumber::from(77);
    send(&stack, alice(), &ack, &[])?;

    let (rst, _): (TcpHeader, Buffer) = next_segment(&device)?;
    ensure_eq!(rst.rst, true);
    ensure_eq!(rst.seq_num, SeqNumber::from(77));
    ensure_eq!(connection_state(&stack), None);
    stack.shutdown();
    Ok(())
}

#[test]
fn deregistered_port_refuses_connections() -> Result<()> {
    let (stack, device) = echo_stack()?;
    stack.deregister(ECHO_PORT)?;
    ensure_eq!(stack.tcp().is_registered(ECHO_PORT), false);
    ensure_eq!(stack.deregister(ECHO_PORT).is_err(), true);

    let mut syn: TcpHeader = TcpHeader::new(BOB_PORT, ECHO_PORT);
    syn.syn = true;
    syn.seq_num = SeqNumber::from(BOB_ISN);
    send(&stack, alice(), &syn, &[])?;
    let (rst, _): (TcpHeader, Buffer) = next_segment(&device)?;
    ensure_eq!(rst.rst, true);
    stack.shutdown();
    Ok(())
}
