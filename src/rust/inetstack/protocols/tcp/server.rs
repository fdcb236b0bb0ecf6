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
                IpProtocol,
                Ipv4Peer,
            },
            tcp::{
                connection::{
                    reset_for,
                    TcpConnection,
                    TcpState,
                    Transition,
                },
                IsnGenerator,
                TcpHeader,
            },
        },
    },
    runtime::{
        fail::Fail,
        memory::{
            Buffer,
            BufferPool,
        },
        scheduler::{
            Task,
            TaskQueue,
            WorkerGroup,
        },
        timer::TimerService,
    },
};
use ::libc::{
    ECONNREFUSED,
    ENOTCONN,
};
use ::std::{
    collections::HashMap,
    net::{
        Ipv4Addr,
        SocketAddrV4,
    },
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        Mutex,
        MutexGuard,
    },
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Called on a port worker with the payload of every in-sequence data segment, along with the peer's address and
/// port.
pub type TcpCallback = Arc<dyn Fn(&TcpHandle, Buffer, Ipv4Addr, u16) + Send + Sync>;

/// Identifies a connection: our listening port and the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub local_port: u16,
    pub remote: SocketAddrV4,
}

/// Collaborators every server needs to emit segments.
#[derive(Clone)]
pub struct TcpContext {
    pub ipv4: Arc<Ipv4Peer>,
    pub pool: BufferPool,
    pub timer: Arc<TimerService>,
    pub isn: Arc<IsnGenerator>,
    pub counters: Arc<StackCounters>,
}

/// Per-port limits.
#[derive(Clone, Copy, Debug)]
pub struct ServerLimits {
    pub workers: usize,
    pub mailbox_capacity: usize,
    pub max_connections: usize,
    pub time_wait: Duration,
}

/// A listening port. Segments for the port go through its mailbox and are processed by its own worker threads, so
/// the connections of one port never race with each other when the port has a single worker.
pub struct TcpServer {
    port: u16,
    callback: TcpCallback,
    limits: ServerLimits,
    mailbox: Arc<TaskQueue>,
    workers: Mutex<Option<WorkerGroup>>,
    live: AtomicBool,
    connections: Mutex<HashMap<SocketAddrV4, TcpConnection>>,
    context: TcpContext,
}

/// Lets a listener callback write to, or close, the connections of its port.
#[derive(Clone)]
pub struct TcpHandle {
    server: Arc<TcpServer>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl TcpContext {
    /// Serializes `header` in front of `payload` and sends the segment to `remote`.
    pub fn send_segment(&self, remote: SocketAddrV4, header: &TcpHeader, payload: &[u8]) -> Result<(), Fail> {
        let mut buf: Buffer = self.pool.acquire(payload.len());
        buf.copy_from_slice(payload);
        header.serialize_and_attach(&mut buf, &self.ipv4.local_ipv4_addr(), remote.ip())?;
        if header.rst {
            StackCounters::bump(&self.counters.tcp_resets_sent);
        }
        trace!("send_segment(): {:?} to {}", header, remote);
        self.ipv4
            .send(*remote.ip(), IpProtocol::TCP, buf)
            .map_err(|e| e.context("tcp"))
    }
}

impl TcpServer {
    /// Creates the server and starts its workers, named `tapstack-tcp-<port>-<index>`.
    pub fn start(port: u16, callback: TcpCallback, limits: ServerLimits, context: TcpContext) -> Result<Arc<Self>, Fail> {
        let name: String = format!("tapstack-tcp-{}", port);
        let mailbox: Arc<TaskQueue> = Arc::new(TaskQueue::bounded(&name, limits.mailbox_capacity)?);
        let server: Arc<TcpServer> = Arc::new(Self {
            port,
            callback,
            limits,
            mailbox: mailbox.clone(),
            workers: Mutex::new(None),
            live: AtomicBool::new(true),
            connections: Mutex::new(HashMap::new()),
            context,
        });
        let workers: WorkerGroup = WorkerGroup::spawn(&name, limits.workers, mailbox)?;
        *server.lock_workers() = Some(workers);
        Ok(server)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn connection_count(&self) -> usize {
        self.lock_connections().len()
    }

    pub fn connection_state(&self, remote: &SocketAddrV4) -> Option<TcpState> {
        self.lock_connections().get(remote).map(|conn| conn.state())
    }

    /// Queues a segment for processing on the port's workers.
    pub fn dispatch(self: &Arc<Self>, remote: SocketAddrV4, header: TcpHeader, payload: Buffer) -> Result<(), Fail> {
        if !self.is_live() {
            return Err(Fail::new(ECONNREFUSED, "listener is shutting down"));
        }
        let server: Arc<TcpServer> = self.clone();
        Task::new("tcp-segment", self.mailbox.clone(), move || {
            server.process(remote, header, payload)
        })
        .dispatch()
    }

    /// Stops accepting segments, joins the workers and forgets every connection. Idempotent.
    pub fn shutdown(&self) {
        self.live.store(false, Ordering::Release);
        let workers: Option<WorkerGroup> = self.lock_workers().take();
        if let Some(mut workers) = workers {
            workers.shutdown();
            while self.mailbox.try_dequeue().is_some() {}
            let dropped: usize = {
                let mut connections: MutexGuard<'_, HashMap<SocketAddrV4, TcpConnection>> = self.lock_connections();
                let count: usize = connections.len();
                connections.clear();
                count
            };
            info!("shutdown(): port {} closed ({} connections dropped)", self.port, dropped);
        }
    }

    /// Runs on a port worker for every inbound segment.
    fn process(self: &Arc<Self>, remote: SocketAddrV4, header: TcpHeader, payload: Buffer) {
        let transition: Transition = {
            let mut connections: MutexGuard<'_, HashMap<SocketAddrV4, TcpConnection>> = self.lock_connections();
            if !connections.contains_key(&remote) {
                if !header.syn || header.ack || header.rst {
                    drop(connections);
                    self.refuse(remote, &header, payload.len(), "segment for unknown connection");
                    return;
                }
                if connections.len() >= self.limits.max_connections {
                    drop(connections);
                    self.refuse(remote, &header, payload.len(), "too many connections");
                    return;
                }
                let local: SocketAddrV4 = SocketAddrV4::new(self.context.ipv4.local_ipv4_addr(), self.port);
                let isn = self.context.isn.generate(&local, &remote);
                connections.insert(remote, TcpConnection::listen(local, remote, isn));
                debug!("process(): new connection from {} on port {}", remote, self.port);
            }
            let conn: &mut TcpConnection = match connections.get_mut(&remote) {
                Some(conn) => conn,
                None => return,
            };
            let transition: Transition = conn.receive(&header, payload.len());
            if conn.is_closed() {
                connections.remove(&remote);
                debug!("process(): connection from {} on port {} closed", remote, self.port);
            }
            transition
        };

        for reply in &transition.replies {
            if let Err(e) = self.context.send_segment(remote, reply, &[]) {
                warn!("process(): failed to answer {} ({:?})", remote, e);
            }
        }
        if transition.time_wait {
            self.arm_time_wait(remote);
        }
        if transition.deliver {
            let handle: TcpHandle = TcpHandle { server: self.clone() };
            (self.callback)(&handle, payload, *remote.ip(), remote.port());
        }
    }

    fn refuse(&self, remote: SocketAddrV4, header: &TcpHeader, payload_len: usize, cause: &str) {
        warn!("process(): dropping packet from {} on port {} ({})", remote, self.port, cause);
        StackCounters::bump(&self.context.counters.packets_dropped);
        if header.rst {
            return;
        }
        if let Err(e) = self.context.send_segment(remote, &reset_for(header, payload_len), &[]) {
            warn!("refuse(): failed to reset {} ({:?})", remote, e);
        }
    }

    /// Forgets a connection in TIME-WAIT once the wait elapsed, on the port's workers.
    fn arm_time_wait(self: &Arc<Self>, remote: SocketAddrV4) {
        let server: Arc<TcpServer> = self.clone();
        let task: Task = Task::new("tcp-time-wait", self.mailbox.clone(), move || {
            let mut connections: MutexGuard<'_, HashMap<SocketAddrV4, TcpConnection>> = server.lock_connections();
            if let Some(conn) = connections.get_mut(&remote) {
                if conn.expire_time_wait() {
                    connections.remove(&remote);
                    debug!("time_wait(): connection from {} closed", remote);
                }
            }
        });
        if let Err(e) = self.context.timer.schedule(task, self.limits.time_wait) {
            warn!("arm_time_wait(): cannot arm timer for {} ({:?})", remote, e);
        }
    }

    fn lock_connections(&self) -> MutexGuard<'_, HashMap<SocketAddrV4, TcpConnection>> {
        match self.connections.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_workers(&self) -> MutexGuard<'_, Option<WorkerGroup>> {
        match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl TcpHandle {
    pub fn local_port(&self) -> u16 {
        self.server.port
    }

    /// Sends `payload` on the established connection with `remote_addr:remote_port`.
    pub fn send(&self, remote_addr: Ipv4Addr, remote_port: u16, payload: &[u8]) -> Result<(), Fail> {
        let remote: SocketAddrV4 = SocketAddrV4::new(remote_addr, remote_port);
        let header: TcpHeader = match self.server.lock_connections().get_mut(&remote) {
            Some(conn) => conn.push(payload.len())?,
            None => return Err(Fail::new(ENOTCONN, "no such connection")),
        };
        self.server.context.send_segment(remote, &header, payload)
    }

    /// Closes our side of the connection with `remote_addr:remote_port`.
    pub fn close(&self, remote_addr: Ipv4Addr, remote_port: u16) -> Result<(), Fail> {
        let remote: SocketAddrV4 = SocketAddrV4::new(remote_addr, remote_port);
        let fin: TcpHeader = match self.server.lock_connections().get_mut(&remote) {
            Some(conn) => conn.close()?,
            None => return Err(Fail::new(ENOTCONN, "no such connection")),
        };
        self.server.context.send_segment(remote, &fin, &[])
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
