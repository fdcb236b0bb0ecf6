// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    inetstack::{
        counters::StackCounters,
        protocols::{
            ipv4::{
                Ipv4Header,
                Ipv4Peer,
            },
            tcp::{
                connection::reset_for,
                server::{
                    ConnectionKey,
                    ServerLimits,
                    TcpCallback,
                    TcpContext,
                    TcpServer,
                },
                IsnGenerator,
                TcpHeader,
            },
        },
    },
    runtime::{
        config::Config,
        fail::Fail,
        memory::{
            Buffer,
            BufferPool,
        },
        timer::TimerService,
    },
};
use ::libc::{
    EADDRINUSE,
    ECONNREFUSED,
    EINVAL,
    ENOENT,
};
use ::std::{
    collections::{
        hash_map::Entry,
        HashMap,
    },
    net::{
        Ipv4Addr,
        SocketAddrV4,
    },
    sync::{
        Arc,
        RwLock,
        RwLockReadGuard,
        RwLockWriteGuard,
    },
    time::Duration,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// How long a connection closed from our side lingers in TIME-WAIT (2 * MSL, with a short MSL).
const TIME_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Table of listening ports. Removal is immediate; a server that is still referenced by in-flight segments stays
/// alive until they are done with it.
pub struct TcpPeer {
    context: TcpContext,
    limits: ServerLimits,
    servers: RwLock<HashMap<u16, Arc<TcpServer>>>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl ServerLimits {
    pub fn from_config(config: &Config) -> Result<Self, Fail> {
        Ok(Self {
            workers: config.tcp_workers_per_port()?,
            mailbox_capacity: config.tcp_mailbox_capacity()?,
            max_connections: config.tcp_max_connections()?,
            time_wait: TIME_WAIT_TIMEOUT,
        })
    }
}

impl TcpPeer {
    pub fn new(
        limits: ServerLimits,
        ipv4: Arc<Ipv4Peer>,
        pool: BufferPool,
        timer: Arc<TimerService>,
        counters: Arc<StackCounters>,
    ) -> Self {
        Self {
            context: TcpContext {
                ipv4,
                pool,
                timer,
                isn: Arc::new(IsnGenerator::new(rand::random::<u32>())),
                counters,
            },
            limits,
            servers: RwLock::new(HashMap::new()),
        }
    }

    /// Starts listening on `port`.
    pub fn register(&self, port: u16, callback: TcpCallback) -> Result<(), Fail> {
        if port == 0 {
            return Err(Fail::new(EINVAL, "cannot listen on port 0"));
        }
        let mut servers: RwLockWriteGuard<'_, HashMap<u16, Arc<TcpServer>>> = self.write_servers();
        match servers.entry(port) {
            Entry::Occupied(_) => {
                let cause: String = format!("TCP port {} is already in use", port);
                error!("register(): {}", cause);
                Err(Fail::new(EADDRINUSE, &cause))
            },
            Entry::Vacant(entry) => {
                entry.insert(TcpServer::start(port, callback, self.limits, self.context.clone())?);
                info!("register(): listening on TCP port {}", port);
                Ok(())
            },
        }
    }

    /// Stops listening on `port`. Its workers are joined before this returns, unless called from one of them.
    pub fn deregister(&self, port: u16) -> Result<(), Fail> {
        let server: Option<Arc<TcpServer>> = self.write_servers().remove(&port);
        match server {
            Some(server) => {
                server.shutdown();
                Ok(())
            },
            None => Err(Fail::new(ENOENT, "no TCP listener on port")),
        }
    }

    pub fn is_registered(&self, port: u16) -> bool {
        self.read_servers().contains_key(&port)
    }

    pub fn server(&self, port: u16) -> Option<Arc<TcpServer>> {
        self.read_servers().get(&port).cloned()
    }

    /// Parses an inbound segment and hands it to the server of its destination port. Segments for closed ports are
    /// answered with a reset.
    pub fn receive(&self, ipv4_header: &Ipv4Header, mut buf: Buffer) -> Result<(), Fail> {
        let src_addr: Ipv4Addr = ipv4_header.get_src_addr();
        let header: TcpHeader = TcpHeader::parse_and_strip(&src_addr, &ipv4_header.get_dest_addr(), &mut buf)?;
        let key: ConnectionKey = ConnectionKey {
            local_port: header.dst_port,
            remote: SocketAddrV4::new(src_addr, header.src_port),
        };
        self.dispatch(key, header, buf)
    }

    /// Routes a parsed segment to the mailbox of the port that owns its connection.
    pub fn dispatch(&self, key: ConnectionKey, header: TcpHeader, payload: Buffer) -> Result<(), Fail> {
        match self.server(key.local_port) {
            Some(server) if server.is_live() => server.dispatch(key.remote, header, payload),
            _ => {
                if !header.rst {
                    self.context
                        .send_segment(key.remote, &reset_for(&header, payload.len()), &[])?;
                }
                let cause: String = format!("no TCP listener on port {}", key.local_port);
                Err(Fail::new(ECONNREFUSED, &cause))
            },
        }
    }

    /// Deregisters every port.
    pub fn shutdown(&self) {
        let servers: Vec<Arc<TcpServer>> = self.write_servers().drain().map(|(_, server)| server).collect();
        for server in servers {
            server.shutdown();
        }
    }

    fn read_servers(&self) -> RwLockReadGuard<'_, HashMap<u16, Arc<TcpServer>>> {
        match self.servers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_servers(&self) -> RwLockWriteGuard<'_, HashMap<u16, Arc<TcpServer>>> {
        match self.servers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
