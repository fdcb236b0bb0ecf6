// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    inetstack::protocols::{
        arp::{
            ArpHeader,
            ArpPeer,
        },
        ethernet2::{
            EtherType2,
            Ethernet2Header,
            ETHERNET2_HEADER_SIZE,
        },
        icmpv4::Icmpv4Peer,
        ipv4::{
            DatagramHandler,
            IpProtocol,
            Ipv4Header,
            Ipv4Peer,
            ReassemblyOutcome,
            IPV4_HEADER_MIN_SIZE,
            ReassemblySettings,
            Reassembler,
        },
        tcp::{
            ServerLimits,
            TcpCallback,
            TcpPeer,
            MIN_TCP_HEADER_SIZE,
        },
        udp::{
            UdpCallback,
            UdpPeer,
        },
    },
    runtime::{
        config::Config,
        fail::Fail,
        memory::{
            Buffer,
            BufferPool,
        },
        network::{
            self,
            types::MacAddress,
            PhysicalLayer,
        },
        scheduler::Scheduler,
        timer::TimerService,
    },
};
use ::libc::{
    EINVAL,
    ENOENT,
};
use ::std::{
    net::Ipv4Addr,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
};

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod counters;
pub mod protocols;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use self::counters::{
    CountersSnapshot,
    StackCounters,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Smallest header reserve that fits every header prepended on the way out.
pub const MIN_HEADER_RESERVE: usize = ETHERNET2_HEADER_SIZE + IPV4_HEADER_MIN_SIZE + MIN_TCP_HEADER_SIZE;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Transport layer of the stack. Shared with the reassembler, which hands it completed datagrams.
struct Transport {
    icmpv4: Icmpv4Peer,
    udp: UdpPeer,
    tcp: TcpPeer,
    counters: Arc<StackCounters>,
}

/// The stack: every component, built once from a [Config] and shared by the threads that move frames through it.
pub struct InetStack {
    local_link_addr: MacAddress,
    pool: BufferPool,
    scheduler: Arc<Scheduler>,
    timer: Arc<TimerService>,
    arp: Arc<ArpPeer>,
    ipv4: Arc<Ipv4Peer>,
    reassembler: Reassembler,
    transport: Arc<Transport>,
    device: Arc<dyn PhysicalLayer>,
    counters: Arc<StackCounters>,
    live: AtomicBool,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Transport {
    /// Hands a complete datagram to its protocol.
    fn dispatch_datagram(&self, header: Ipv4Header, payload: Buffer) -> Result<(), Fail> {
        match header.get_protocol() {
            IpProtocol::ICMPv4 => self.icmpv4.receive(&header, payload).map_err(|e| e.context("icmpv4")),
            IpProtocol::UDP => self.udp.receive(&header, payload).map_err(|e| e.context("udp")),
            IpProtocol::TCP => self.tcp.receive(&header, payload).map_err(|e| e.context("tcp")),
        }
    }
}

impl InetStack {
    /// Builds a stack on top of `device`. Threads are started here and stopped by [InetStack::shutdown].
    pub fn new(config: &Config, device: Arc<dyn PhysicalLayer>) -> Result<Arc<Self>, Fail> {
        let local_link_addr: MacAddress = config.local_link_addr()?;
        let local_ipv4_addr: Ipv4Addr = config.local_ipv4_addr()?;
        let mtu: usize = config.mtu()? as usize;
        let pool: BufferPool = BufferPool::new(config.pool_buffers()?, config.buffer_size()?, config.header_reserve()?)?;
        if pool.headroom() < MIN_HEADER_RESERVE {
            let cause: String = format!(
                "header reserve cannot hold outbound headers ({} < {})",
                pool.headroom(),
                MIN_HEADER_RESERVE
            );
            error!("new(): {}", cause);
            return Err(Fail::new(EINVAL, &cause));
        }
        if pool.slot_size() - pool.headroom() < mtu + ETHERNET2_HEADER_SIZE {
            let cause: String = format!("buffers cannot hold a full frame (mtu={})", mtu);
            error!("new(): {}", cause);
            return Err(Fail::new(EINVAL, &cause));
        }
        let counters: Arc<StackCounters> = Arc::new(StackCounters::default());
        let scheduler: Arc<Scheduler> = Arc::new(Scheduler::new(config.worker_threads()?)?);
        let timer: Arc<TimerService> = Arc::new(TimerService::new(config.timer_threads()?)?);

        let arp: Arc<ArpPeer> = Arc::new(ArpPeer::new(local_link_addr, local_ipv4_addr, config.arp_table()?));
        let ipv4: Arc<Ipv4Peer> = Arc::new(Ipv4Peer::new(
            local_link_addr,
            local_ipv4_addr,
            mtu,
            arp.clone(),
            device.clone(),
            pool.clone(),
            counters.clone(),
        ));
        let transport: Arc<Transport> = Arc::new(Transport {
            icmpv4: Icmpv4Peer::new(ipv4.clone()),
            udp: UdpPeer::new(ipv4.clone(), pool.clone()),
            tcp: TcpPeer::new(
                ServerLimits::from_config(config)?,
                ipv4.clone(),
                pool.clone(),
                timer.clone(),
                counters.clone(),
            ),
            counters: counters.clone(),
        });

        let handler: DatagramHandler = {
            let transport: Arc<Transport> = transport.clone();
            Arc::new(move |header: Ipv4Header, payload: Buffer| {
                if let Err(e) = transport.dispatch_datagram(header, payload) {
                    StackCounters::bump(&transport.counters.packets_dropped);
                    warn!("dispatch_datagram(): dropping packet ({:?})", e);
                }
            })
        };
        let reassembler: Reassembler = Reassembler::new(
            ReassemblySettings::from_config(config)?,
            scheduler.clone(),
            timer.clone(),
            pool.clone(),
            counters.clone(),
            handler,
        )?;

        info!("new(): stack up at {} ({}), mtu {}", local_ipv4_addr, local_link_addr, mtu);
        Ok(Arc::new(Self {
            local_link_addr,
            pool,
            scheduler,
            timer,
            arp,
            ipv4,
            reassembler,
            transport,
            device,
            counters,
            live: AtomicBool::new(true),
        }))
    }

    pub fn local_ipv4_addr(&self) -> Ipv4Addr {
        self.ipv4.local_ipv4_addr()
    }

    pub fn local_link_addr(&self) -> MacAddress {
        self.local_link_addr
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn timer(&self) -> &Arc<TimerService> {
        &self.timer
    }

    pub fn counters(&self) -> &StackCounters {
        &self.counters
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    pub fn tcp(&self) -> &TcpPeer {
        &self.transport.tcp
    }

    pub fn udp(&self) -> &UdpPeer {
        &self.transport.udp
    }

    pub fn arp(&self) -> &ArpPeer {
        &self.arp
    }

    /// Frame entry point: hands an inbound frame to the worker pool.
    pub fn receive_frame(self: &Arc<Self>, frame: Buffer) -> Result<(), Fail> {
        StackCounters::bump(&self.counters.frames_received);
        let stack: Arc<InetStack> = self.clone();
        self.scheduler.submit("frame-entry", move || {
            if let Err(e) = stack.process_frame(frame) {
                StackCounters::bump(&stack.counters.packets_dropped);
                warn!("process_frame(): dropping packet ({:?})", e);
            }
        })
    }

    /// Parses an inbound frame on the calling thread, down to the transport layer unless it is a fragment.
    pub fn process_frame(&self, mut frame: Buffer) -> Result<(), Fail> {
        let header: Ethernet2Header = Ethernet2Header::parse_and_strip(&mut frame).map_err(|e| e.context("ethernet2"))?;
        let dst_addr: MacAddress = header.dst_addr();
        if dst_addr != self.local_link_addr && dst_addr.is_unicast() {
            return Err(Fail::new(EINVAL, "physical destination address mismatch").context("ethernet2"));
        }
        match header.ether_type() {
            EtherType2::Arp => self.process_arp(&frame).map_err(|e| e.context("arp")),
            EtherType2::Ipv4 => {
                let ipv4_header: Ipv4Header = self.ipv4.receive(&mut frame).map_err(|e| e.context("ipv4"))?;
                match self.reassembler.reassemble_or_passthrough(ipv4_header, frame) {
                    ReassemblyOutcome::Complete(header, payload) => self.dispatch_datagram(header, payload),
                    ReassemblyOutcome::Queued => Ok(()),
                    ReassemblyOutcome::Dropped(e) => Err(e),
                }
            },
            EtherType2::Ipv6 => {
                trace!("process_frame(): ignoring IPv6 frame");
                Ok(())
            },
        }
    }

    /// Hands a complete datagram to its protocol on the calling thread.
    pub fn dispatch_datagram(&self, header: Ipv4Header, payload: Buffer) -> Result<(), Fail> {
        self.transport.dispatch_datagram(header, payload)
    }

    pub fn register_tcp_listener(&self, port: u16, callback: TcpCallback) -> Result<(), Fail> {
        self.transport.tcp.register(port, callback)
    }

    pub fn register_udp_listener(&self, port: u16, callback: UdpCallback) -> Result<(), Fail> {
        self.transport.udp.register(port, callback)
    }

    /// Removes the TCP and UDP listeners on `port`. Fails only if neither exists.
    pub fn deregister(&self, port: u16) -> Result<(), Fail> {
        let tcp: bool = self.transport.tcp.deregister(port).is_ok();
        let udp: bool = self.transport.udp.deregister(port).is_ok();
        if !tcp && !udp {
            let cause: String = format!("no listener on port {}", port);
            return Err(Fail::new(ENOENT, &cause));
        }
        Ok(())
    }

    /// Reads frames off the device until [InetStack::shutdown] is called or the device fails.
    pub fn run(self: &Arc<Self>) -> Result<(), Fail> {
        info!("run(): receiving frames");
        network::receive_loop(&*self.device, &self.pool, &self.live, |frame: Buffer| self.receive_frame(frame))
    }

    /// Stops the receive loop and every thread the stack started. Idempotent.
    pub fn shutdown(&self) {
        if !self.live.swap(false, Ordering::AcqRel) {
            return;
        }
        self.transport.tcp.shutdown();
        self.reassembler.shutdown();
        self.scheduler.shutdown();
        // Frame tasks that never ran hold the stack.
        while self.scheduler.queue().try_dequeue().is_some() {}
        self.timer.shutdown();
        info!("shutdown(): stack stopped {:?}", self.counters.snapshot());
    }

    fn process_arp(&self, frame: &Buffer) -> Result<(), Fail> {
        let reply: Option<ArpHeader> = self.arp.receive(frame)?;
        match reply {
            // Replies go straight back to the requester.
            Some(reply) => self.ipv4.send_arp(&reply, reply.get_destination_hardware_addr()),
            None => Ok(()),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for InetStack {
    fn drop(&mut self) {
        self.shutdown();
    }
}
