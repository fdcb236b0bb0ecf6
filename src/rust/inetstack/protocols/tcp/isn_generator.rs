// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::inetstack::protocols::tcp::SeqNumber;
use ::crc::{
    Crc,
    CRC_32_CKSUM,
};
use ::std::{
    net::SocketAddrV4,
    sync::atomic::{
        AtomicU16,
        Ordering,
    },
};

const ISN_HASH: Crc<u32> = Crc::<u32>::new(&CRC_32_CKSUM);

/// Initial sequence numbers in the spirit of RFC 6528: a keyed hash of the connection's addresses plus a counter.
pub struct IsnGenerator {
    nonce: u32,
    counter: AtomicU16,
}

impl IsnGenerator {
    pub fn new(nonce: u32) -> Self {
        Self {
            nonce,
            counter: AtomicU16::new(0),
        }
    }

    pub fn generate(&self, local: &SocketAddrV4, remote: &SocketAddrV4) -> SeqNumber {
        let mut digest = ISN_HASH.digest();
        digest.update(&remote.ip().octets());
        digest.update(&remote.port().to_be_bytes());
        digest.update(&local.ip().octets());
        digest.update(&local.port().to_be_bytes());
        digest.update(&self.nonce.to_be_bytes());
        let counter: u16 = self.counter.fetch_add(1, Ordering::Relaxed);
        SeqNumber::from(digest.finalize().wrapping_add(counter as u32))
    }
}
