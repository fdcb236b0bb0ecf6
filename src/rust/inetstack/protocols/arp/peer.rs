// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    inetstack::protocols::arp::header::{
        ArpHeader,
        ArpOperation,
    },
    runtime::{
        fail::Fail,
        memory::Buffer,
        network::types::MacAddress,
    },
};
use ::std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::{
        RwLock,
        RwLockReadGuard,
        RwLockWriteGuard,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

///
/// Arp Peer
///
/// Resolves IPv4 addresses on the local link. Entries are learned from requests addressed to us and from replies;
/// nothing expires, static entries from the configuration included.
pub struct ArpPeer {
    local_link_addr: MacAddress,
    local_ipv4_addr: Ipv4Addr,
    cache: RwLock<HashMap<Ipv4Addr, MacAddress>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ArpPeer {
    pub fn new(local_link_addr: MacAddress, local_ipv4_addr: Ipv4Addr, initial: HashMap<Ipv4Addr, MacAddress>) -> Self {
        Self {
            local_link_addr,
            local_ipv4_addr,
            cache: RwLock::new(initial),
        }
    }

    pub fn lookup(&self, ipv4_addr: Ipv4Addr) -> Option<MacAddress> {
        self.read_cache().get(&ipv4_addr).copied()
    }

    pub fn insert(&self, ipv4_addr: Ipv4Addr, link_addr: MacAddress) -> Option<MacAddress> {
        self.write_cache().insert(ipv4_addr, link_addr)
    }

    /// Processes an inbound ARP message. Returns the reply to send back, if any.
    pub fn receive(&self, buf: &Buffer) -> Result<Option<ArpHeader>, Fail> {
        let header: ArpHeader = ArpHeader::parse(buf)?;
        let sender_ipv4_addr: Ipv4Addr = header.get_sender_protocol_addr();
        let sender_link_addr: MacAddress = header.get_sender_hardware_addr();
        let for_us: bool = header.get_destination_protocol_addr() == self.local_ipv4_addr;

        // Refresh entries we already track, and learn from anyone talking to us (RFC 826).
        {
            let mut cache: RwLockWriteGuard<'_, HashMap<Ipv4Addr, MacAddress>> = self.write_cache();
            if for_us || cache.contains_key(&sender_ipv4_addr) {
                if cache.insert(sender_ipv4_addr, sender_link_addr) != Some(sender_link_addr) {
                    debug!("receive(): learned {} is at {}", sender_ipv4_addr, sender_link_addr);
                }
            }
        }

        match header.get_operation() {
            ArpOperation::Request if for_us => Ok(Some(ArpHeader::new(
                ArpOperation::Reply,
                self.local_link_addr,
                self.local_ipv4_addr,
                sender_link_addr,
                sender_ipv4_addr,
            ))),
            _ => Ok(None),
        }
    }

    /// Builds a broadcast request for `target`.
    pub fn request(&self, target: Ipv4Addr) -> ArpHeader {
        ArpHeader::new(
            ArpOperation::Request,
            self.local_link_addr,
            self.local_ipv4_addr,
            MacAddress::nil(),
            target,
        )
    }

    fn read_cache(&self) -> RwLockReadGuard<'_, HashMap<Ipv4Addr, MacAddress>> {
        match self.cache.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, HashMap<Ipv4Addr, MacAddress>> {
        match self.cache.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::ArpPeer;
    use crate::{
        ensure_eq,
        inetstack::protocols::arp::header::{
            ArpHeader,
            ArpOperation,
        },
        runtime::{
            memory::Buffer,
            network::types::MacAddress,
        },
    };
    use ::anyhow::Result;
    use ::std::{
        collections::HashMap,
        net::Ipv4Addr,
    };

    const LOCAL_MAC: MacAddress = MacAddress::new([0x12, 0x23, 0x45, 0x67, 0x89, 0xab]);
    const REMOTE_MAC: MacAddress = MacAddress::new([0x12, 0x23, 0x45, 0x67, 0x89, 0xac]);
    const LOCAL_IPV4: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
    const REMOTE_IPV4: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 2);

    #[test]
    fn answers_request_and_learns_sender() -> Result<()> {
        let peer: ArpPeer = ArpPeer::new(LOCAL_MAC, LOCAL_IPV4, HashMap::new());
        let request: Buffer =
            ArpHeader::new(ArpOperation::Request, REMOTE_MAC, REMOTE_IPV4, MacAddress::nil(), LOCAL_IPV4).to_buffer(0);

        let reply: Option<ArpHeader> = peer.receive(&request)?;
        ensure_eq!(
            reply,
            Some(ArpHeader::new(ArpOperation::Reply, LOCAL_MAC, LOCAL_IPV4, REMOTE_MAC, REMOTE_IPV4))
        );
        ensure_eq!(peer.lookup(REMOTE_IPV4), Some(REMOTE_MAC));
        Ok(())
    }

    #[test]
    fn ignores_requests_for_other_hosts() -> Result<()> {
        let peer: ArpPeer = ArpPeer::new(LOCAL_MAC, LOCAL_IPV4, HashMap::new());
        let other: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 77);
        let request: Buffer =
            ArpHeader::new(ArpOperation::Request, REMOTE_MAC, REMOTE_IPV4, MacAddress::nil(), other).to_buffer(0);

        ensure_eq!(peer.receive(&request)?, None);
        ensure_eq!(peer.lookup(REMOTE_IPV4), None);
        Ok(())
    }
}
