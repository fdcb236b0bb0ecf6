// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    inetstack::protocols::{
        ipv4::{
            IpProtocol,
            Ipv4Header,
            Ipv4Peer,
            IPV4_DATAGRAM_MAX_SIZE,
            IPV4_HEADER_MIN_SIZE,
        },
        udp::{
            UdpHeader,
            UDP_HEADER_SIZE,
        },
    },
    runtime::{
        fail::Fail,
        memory::{
            Buffer,
            BufferPool,
        },
    },
};
use ::libc::{
    EADDRINUSE,
    ECONNREFUSED,
    EINVAL,
    EMSGSIZE,
    ENOENT,
};
use ::std::{
    collections::{
        hash_map::Entry,
        HashMap,
    },
    net::Ipv4Addr,
    sync::{
        Arc,
        RwLock,
        RwLockReadGuard,
        RwLockWriteGuard,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Largest payload a single UDP datagram carries.
pub const UDP_PAYLOAD_MAX_SIZE: usize = IPV4_DATAGRAM_MAX_SIZE - IPV4_HEADER_MIN_SIZE - UDP_HEADER_SIZE;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Called on a pool worker for every datagram that reaches a listener, with the listener's handle, the payload and
/// the peer's address and port.
pub type UdpCallback = Arc<dyn Fn(&UdpHandle, Buffer, Ipv4Addr, u16) + Send + Sync>;

/// Lets a listener callback send datagrams from its port.
#[derive(Clone)]
pub struct UdpHandle {
    local_port: u16,
    ipv4: Arc<Ipv4Peer>,
    pool: BufferPool,
}

struct UdpListener {
    handle: UdpHandle,
    callback: UdpCallback,
}

/// Port table of UDP listeners.
pub struct UdpPeer {
    ipv4: Arc<Ipv4Peer>,
    pool: BufferPool,
    listeners: RwLock<HashMap<u16, Arc<UdpListener>>>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl UdpHandle {
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Sends `payload` to `remote_addr:remote_port`.
    pub fn send_to(&self, payload: &[u8], remote_addr: Ipv4Addr, remote_port: u16) -> Result<(), Fail> {
        if payload.len() > UDP_PAYLOAD_MAX_SIZE {
            return Err(Fail::new(EMSGSIZE, "UDP payload too large"));
        }
        let mut buf: Buffer = self.pool.acquire(payload.len());
        buf.copy_from_slice(payload);
        let local_addr: Ipv4Addr = self.ipv4.local_ipv4_addr();
        UdpHeader::new(self.local_port, remote_port).serialize_and_attach(&mut buf, &local_addr, &remote_addr)?;
        self.ipv4
            .send(remote_addr, IpProtocol::UDP, buf)
            .map_err(|e| e.context("udp"))
    }
}

impl UdpPeer {
    pub fn new(ipv4: Arc<Ipv4Peer>, pool: BufferPool) -> Self {
        Self {
            ipv4,
            pool,
            listeners: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, port: u16, callback: UdpCallback) -> Result<(), Fail> {
        if port == 0 {
            return Err(Fail::new(EINVAL, "cannot listen on port 0"));
        }
        let handle: UdpHandle = UdpHandle {
            local_port: port,
            ipv4: self.ipv4.clone(),
            pool: self.pool.clone(),
        };
        match self.write_listeners().entry(port) {
            Entry::Occupied(_) => {
                let cause: String = format!("UDP port {} is already in use", port);
                error!("register(): {}", cause);
                Err(Fail::new(EADDRINUSE, &cause))
            },
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(UdpListener { handle, callback }));
                info!("register(): listening on UDP port {}", port);
                Ok(())
            },
        }
    }

    /// Removes the listener on `port`. Datagrams already being delivered to it still complete.
    pub fn deregister(&self, port: u16) -> Result<(), Fail> {
        match self.write_listeners().remove(&port) {
            Some(_) => {
                info!("deregister(): closed UDP port {}", port);
                Ok(())
            },
            None => Err(Fail::new(ENOENT, "no UDP listener on port")),
        }
    }

    pub fn is_registered(&self, port: u16) -> bool {
        self.read_listeners().contains_key(&port)
    }

    /// Delivers a datagram to the listener on its destination port, on the calling thread.
    pub fn receive(&self, ipv4_header: &Ipv4Header, mut buf: Buffer) -> Result<(), Fail> {
        let src_addr: Ipv4Addr = ipv4_header.get_src_addr();
        let header: UdpHeader = UdpHeader::parse_and_strip(&src_addr, &ipv4_header.get_dest_addr(), &mut buf)?;
        let listener: Arc<UdpListener> = match self.read_listeners().get(&header.dest_port()) {
            Some(listener) => listener.clone(),
            None => {
                let cause: String = format!("no UDP listener on port {}", header.dest_port());
                return Err(Fail::new(ECONNREFUSED, &cause));
            },
        };
        trace!(
            "receive(): {} bytes from {}:{} to port {}",
            buf.len(),
            src_addr,
            header.src_port(),
            header.dest_port()
        );
        (listener.callback)(&listener.handle, buf, src_addr, header.src_port());
        Ok(())
    }

    fn read_listeners(&self) -> RwLockReadGuard<'_, HashMap<u16, Arc<UdpListener>>> {
        match self.listeners.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_listeners(&self) -> RwLockWriteGuard<'_, HashMap<u16, Arc<UdpListener>>> {
        match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
