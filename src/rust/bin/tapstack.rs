// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![deny(clippy::all)]

#[macro_use]
extern crate log;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::clap::{
    Arg,
    ArgMatches,
    Command,
};
use ::std::{
    net::Ipv4Addr,
    sync::{
        Arc,
        Weak,
    },
    time::Duration,
};
use ::tapstack::{
    inetstack::protocols::{
        tcp::{
            TcpCallback,
            TcpHandle,
        },
        udp::{
            UdpCallback,
            UdpHandle,
        },
    },
    runtime::{
        logging,
        network::tap::TapDevice,
        scheduler::TaskQueue,
        timer::TaskFactory,
    },
    Buffer,
    Config,
    DelayedTask,
    Fail,
    InetStack,
    Task,
};

//======================================================================================================================
// Constants
//======================================================================================================================

const DEFAULT_ECHO_PORT: u16 = 7;
const REPORT_INTERVAL: Duration = Duration::from_secs(10);

//======================================================================================================================
// Structures
//======================================================================================================================

#[derive(Debug)]
pub struct ProgramArguments {
    config_path: String,
    echo_port: u16,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl ProgramArguments {
    pub fn new() -> Result<Self> {
        let matches: ArgMatches = Command::new("tapstack")
            .about("User-space TCP/IP stack serving UDP and TCP echo over a TAP interface")
            .arg(
                Arg::new("config")
                    .long("config")
                    .value_parser(clap::value_parser!(String))
                    .required(true)
                    .value_name("PATH")
                    .help("Sets the configuration file"),
            )
            .arg(
                Arg::new("echo-port")
                    .long("echo-port")
                    .value_parser(clap::value_parser!(u16))
                    .required(false)
                    .value_name("PORT")
                    .help("Sets the port of the UDP and TCP echo listeners"),
            )
            .get_matches();

        let config_path: String = match matches.get_one::<String>("config") {
            Some(path) => path.clone(),
            None => anyhow::bail!("missing configuration file"),
        };
        let echo_port: u16 = matches.get_one::<u16>("echo-port").copied().unwrap_or(DEFAULT_ECHO_PORT);
        if echo_port == 0 {
            anyhow::bail!("echo port must be non-zero");
        }
        Ok(Self { config_path, echo_port })
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

fn udp_echo() -> UdpCallback {
    Arc::new(|handle: &UdpHandle, payload: Buffer, remote_addr: Ipv4Addr, remote_port: u16| {
        if let Err(e) = handle.send_to(&payload, remote_addr, remote_port) {
            warn!("udp_echo(): failed to echo {} bytes to {}:{} ({:?})", payload.len(), remote_addr, remote_port, e);
        }
    })
}

fn tcp_echo() -> TcpCallback {
    Arc::new(|handle: &TcpHandle, payload: Buffer, remote_addr: Ipv4Addr, remote_port: u16| {
        if let Err(e) = handle.send(remote_addr, remote_port, &payload) {
            warn!("tcp_echo(): failed to echo {} bytes to {}:{} ({:?})", payload.len(), remote_addr, remote_port, e);
        }
    })
}

/// Logs the stack counters every [REPORT_INTERVAL] for as long as the stack is alive.
fn report_counters(stack: &Arc<InetStack>) -> Result<()> {
    let weak: Weak<InetStack> = Arc::downgrade(stack);
    let queue: Arc<TaskQueue> = stack.scheduler().queue().clone();
    let factory: TaskFactory = Arc::new(move || {
        let weak: Weak<InetStack> = weak.clone();
        Task::new("counters-report", queue.clone(), move || {
            if let Some(stack) = weak.upgrade() {
                info!("report_counters(): {:?}", stack.counters().snapshot());
            }
        })
    });
    stack
        .timer()
        .submit_delayed(DelayedTask::periodic(factory, REPORT_INTERVAL))?;
    Ok(())
}

fn main() -> Result<()> {
    logging::initialize();
    let args: ProgramArguments = ProgramArguments::new()?;
    let config: Config = Config::new(&args.config_path)?;
    let device: TapDevice = TapDevice::open(&config.interface_name()?)?;
    println!("Interface: {}", device.name());

    let stack: Arc<InetStack> = InetStack::new(&config, Arc::new(device))?;
    stack.register_udp_listener(args.echo_port, udp_echo())?;
    stack.register_tcp_listener(args.echo_port, tcp_echo())?;
    report_counters(&stack)?;
    println!("Echo on {}:{} (udp, tcp)", stack.local_ipv4_addr(), args.echo_port);

    let result: Result<(), Fail> = stack.run();
    stack.shutdown();
    result?;
    Ok(())
}
