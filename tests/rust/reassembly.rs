// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::crossbeam_channel::{
    Receiver,
    Sender,
};
use ::std::{
    net::{
        Ipv4Addr,
        SocketAddrV4,
    },
    sync::{
        atomic::Ordering,
        Arc,
    },
    thread,
    time::Duration,
};
use ::tapstack::{
    ensure_eq,
    inetstack::{
        protocols::{
            ipv4::IpProtocol,
            udp::UdpHandle,
        },
        test_helpers::{
            self,
            ALICE_IPV4,
            BOB_IPV4,
        },
    },
    Buffer,
    Fail,
    InetStack,
};

//======================================================================================================================
// Constants
//======================================================================================================================

const LISTEN_PORT: u16 = 9000;
const REMOTE_PORT: u16 = 5000;
const PRODUCERS: usize = 3;

//======================================================================================================================
// Helpers
//======================================================================================================================

/// Registers a UDP listener that forwards every payload it receives.
fn collect_datagrams(stack: &InetStack) -> Result<Receiver<Vec<u8>>> {
    let (tx, rx): (Sender<Vec<u8>>, Receiver<Vec<u8>>) = crossbeam_channel::unbounded();
    stack.register_udp_listener(
        LISTEN_PORT,
        Arc::new(move |_: &UdpHandle, payload: Buffer, _: Ipv4Addr, _: u16| {
            let _ = tx.send(payload.to_vec());
        }),
    )?;
    Ok(rx)
}

/// A UDP datagram from Bob to Alice, cut into fragments of `chunk` bytes.
fn fragmented_datagram(payload: &[u8], identification: u16, chunk: usize) -> Result<Vec<Buffer>> {
    let segment: Buffer = test_helpers::udp_segment(
        SocketAddrV4::new(BOB_IPV4, REMOTE_PORT),
        SocketAddrV4::new(ALICE_IPV4, LISTEN_PORT),
        payload,
    )?;
    Ok(test_helpers::fragment_frames(
        BOB_IPV4,
        ALICE_IPV4,
        IpProtocol::UDP,
        identification,
        &segment,
        chunk,
    )?)
}

/// Every ordering of `0..n`.
fn permutations(n: usize) -> Vec<Vec<usize>> {
    if n == 0 {
        return vec![Vec::new()];
    }
    let mut orders: Vec<Vec<usize>> = Vec::new();
    for order in permutations(n - 1) {
        for position in 0..=order.len() {
            let mut next: Vec<usize> = order.clone();
            next.insert(position, n - 1);
            orders.push(next);
        }
    }
    orders
}

fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

//======================================================================================================================
// Tests
//======================================================================================================================

/// Fragments arriving out of order are put back together byte for byte.
#[test]
fn out_of_order_fragments_are_reassembled() -> Result<()> {
    let (stack, _device) = common::new_alice(1460)?;
    let datagrams: Receiver<Vec<u8>> = collect_datagrams(&stack)?;

    let payload: Vec<u8> = body(3000);
    let mut frames: Vec<Buffer> = fragmented_datagram(&payload, 0x1234, 1440)?;
    ensure_eq!(frames.len(), 3);
    let last: Buffer = frames.remove(2);
    stack.receive_frame(last)?;
    for frame in frames {
        stack.receive_frame(frame)?;
    }

    let received: Vec<u8> = datagrams.recv_timeout(common::TIMEOUT)?;
    ensure_eq!(received, payload);
    common::wait_for(|| stack.reassembler().in_flight() == 0)?;
    common::wait_for(|| stack.pool().outstanding() == 0)?;
    ensure_eq!(stack.counters().datagrams_reassembled.load(Ordering::Relaxed), 1);
    stack.shutdown();
    Ok(())
}

/// Every arrival order of four fragments, spread over several producer threads, yields the datagram exactly once.
#[test]
fn every_fragment_order_is_reassembled_once() -> Result<()> {
    let (stack, _device) = common::new_alice(common::MTU)?;
    let datagrams: Receiver<Vec<u8>> = collect_datagrams(&stack)?;
    // Eight bytes of UDP header plus this body make three full chunks and a short tail.
    let payload: Vec<u8> = body(1600);

    let orders: Vec<Vec<usize>> = permutations(4);
    ensure_eq!(orders.len(), 24);
    for (round, order) in orders.iter().enumerate() {
        let identification: u16 = 0x2000 + round as u16;
        let mut frames: Vec<Option<Buffer>> = fragmented_datagram(&payload, identification, 512)?
            .into_iter()
            .map(Some)
            .collect();
        ensure_eq!(frames.len(), 4);

        let mut batches: Vec<Vec<Buffer>> = (0..PRODUCERS).map(|_| Vec::new()).collect();
        for (position, index) in order.iter().enumerate() {
            if let Some(frame) = frames[*index].take() {
                batches[position % PRODUCERS].push(frame);
            }
        }
        let producers: Vec<thread::JoinHandle<Result<(), Fail>>> = batches
            .into_iter()
            .map(|batch| {
                let stack: Arc<InetStack> = stack.clone();
                thread::spawn(move || {
                    for frame in batch {
                        stack.receive_frame(frame)?;
                    }
                    Ok(())
                })
            })
            .collect();
        for producer in producers {
            match producer.join() {
                Ok(result) => result?,
                Err(_) => anyhow::bail!("producer thread panicked"),
            }
        }

        ensure_eq!(datagrams.recv_timeout(common::TIMEOUT)?, payload);
        common::wait_for(|| stack.reassembler().in_flight() == 0)?;
        common::wait_for(|| stack.pool().outstanding() == 0)?;
        thread::sleep(Duration::from_millis(20));
        ensure_eq!(datagrams.len(), 0);
    }

    ensure_eq!(
        stack.counters().datagrams_reassembled.load(Ordering::Relaxed),
        orders.len()
    );
    ensure_eq!(stack.counters().duplicate_fragments.load(Ordering::Relaxed), 0);
    stack.shutdown();
    Ok(())
}

/// A repeated fragment is counted and ignored; the datagram still completes once.
#[test]
fn duplicate_fragment_is_ignored() -> Result<()> {
    let (stack, _device) = common::new_alice(common::MTU)?;
    let datagrams: Receiver<Vec<u8>> = collect_datagrams(&stack)?;

    let payload: Vec<u8> = body(2000);
    let frames: Vec<Buffer> = fragmented_datagram(&payload, 0x4321, 1024)?;
    ensure_eq!(frames.len(), 2);
    let first: Buffer = Buffer::from_slice(&frames[0]);
    stack.receive_frame(first)?;
    let duplicate: Buffer = Buffer::from_slice(&frames[0]);
    stack.receive_frame(duplicate)?;
    common::wait_for(|| stack.counters().duplicate_fragments.load(Ordering::Relaxed) == 1)?;
    let mut frames = frames.into_iter();
    frames.next();
    for frame in frames {
        stack.receive_frame(frame)?;
    }

    ensure_eq!(datagrams.recv_timeout(common::TIMEOUT)?, payload);
    thread::sleep(Duration::from_millis(50));
    ensure_eq!(datagrams.len(), 0);
    stack.shutdown();
    Ok(())
}

/// A datagram that never completes is given up on and its fragments are released.
#[test]
fn incomplete_datagram_expires() -> Result<()> {
    let (stack, _device) = common::new_alice(common::MTU)?;
    let datagrams: Receiver<Vec<u8>> = collect_datagrams(&stack)?;

    let frames: Vec<Buffer> = fragmented_datagram(&body(3000), 0x0bad, 1400)?;
    let mut frames = frames.into_iter();
    if let Some(first) = frames.next() {
        stack.receive_frame(first)?;
    }
    common::wait_for(|| stack.reassembler().in_flight() == 1)?;
    common::wait_for(|| stack.counters().reassembly_expired.load(Ordering::Relaxed) == 1)?;
    common::wait_for(|| stack.reassembler().in_flight() == 0)?;
    common::wait_for(|| stack.pool().outstanding() == 0)?;
    ensure_eq!(datagrams.len(), 0);
    stack.shutdown();
    Ok(())
}

/// Fragments of distinct datagrams from the same source interleave without mixing.
#[test]
fn interleaved_datagrams_stay_apart() -> Result<()> {
    let (stack, _device) = common::new_alice(common::MTU)?;
    let datagrams: Receiver<Vec<u8>> = collect_datagrams(&stack)?;

    let first: Vec<u8> = body(1800);
    let second: Vec<u8> = first.iter().rev().copied().collect();
    let mut first_frames = fragmented_datagram(&first, 1, 1000)?.into_iter();
    let mut second_frames = fragmented_datagram(&second, 2, 1000)?.into_iter();
    loop {
        match (first_frames.next(), second_frames.next()) {
            (None, None) => break,
            (a, b) => {
                for frame in a.into_iter().chain(b) {
                    stack.receive_frame(frame)?;
                }
            },
        }
    }

    let mut received: Vec<Vec<u8>> = vec![
        datagrams.recv_timeout(common::TIMEOUT)?,
        datagrams.recv_timeout(common::TIMEOUT)?,
    ];
    received.sort_by_key(|payload| payload[0]);
    let mut expected: Vec<Vec<u8>> = vec![first, second];
    expected.sort_by_key(|payload| payload[0]);
    ensure_eq!(received, expected);
    ensure_eq!(stack.counters().duplicate_fragments.load(Ordering::Relaxed), 0);
    stack.shutdown();
    Ok(())
}
