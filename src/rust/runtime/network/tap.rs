// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    memory::Buffer,
    network::PhysicalLayer,
};
use ::libc::{
    EAGAIN,
    EINVAL,
};
use ::std::{
    fs::{
        File,
        OpenOptions,
    },
    io::{
        Read,
        Write,
    },
    os::unix::io::AsRawFd,
};

//======================================================================================================================
// Constants
//======================================================================================================================

const TUN_PATH: &str = "/dev/net/tun";
const TUNSETIFF: libc::Ioctl = 0x400454CA;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

/// How long a receive call waits for a frame before reporting `EAGAIN`.
const RECEIVE_TIMEOUT_MILLIS: libc::c_int = 100;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Request layout `TUNSETIFF` expects: the interface name followed by the flags, padded to `struct ifreq`.
#[repr(C)]
struct TunRequest {
    name: [libc::c_char; libc::IF_NAMESIZE],
    flags: libc::c_short,
    _padding: [u8; 22],
}

/// A Linux TAP interface carrying raw Ethernet frames, without packet information headers.
pub struct TapDevice {
    name: String,
    file: File,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl TapDevice {
    /// Attaches to the TAP interface `name`, creating it if the process is allowed to.
    pub fn open(name: &str) -> Result<Self, Fail> {
        if name.is_empty() || name.len() >= libc::IF_NAMESIZE {
            let cause: String = format!("invalid interface name (name={:?})", name);
            error!("open(): {}", cause);
            return Err(Fail::new(EINVAL, &cause));
        }
        let file: File = OpenOptions::new().read(true).write(true).open(TUN_PATH)?;

        let mut request: TunRequest = TunRequest {
            name: [0; libc::IF_NAMESIZE],
            flags: IFF_TAP | IFF_NO_PI,
            _padding: [0; 22],
        };
        for (dst, src) in request.name.iter_mut().zip(name.bytes()) {
            *dst = src as libc::c_char;
        }
        // Safety: `request` outlives the call and has the layout of `struct ifreq`.
        if unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &mut request as *mut TunRequest) } < 0 {
            let e: Fail = Fail::from(::std::io::Error::last_os_error());
            error!("open(): TUNSETIFF failed on {} ({:?})", name, e);
            return Err(e);
        }
        info!("open(): attached to {}", name);
        Ok(Self {
            name: name.to_string(),
            file,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits up to the receive timeout for the descriptor to become readable.
    fn wait_readable(&self) -> Result<bool, Fail> {
        let mut pollfd: libc::pollfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // Safety: a single valid pollfd is passed.
        match unsafe { libc::poll(&mut pollfd, 1, RECEIVE_TIMEOUT_MILLIS) } {
            n if n < 0 => Err(Fail::from(::std::io::Error::last_os_error())),
            0 => Ok(false),
            _ => Ok(true),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl PhysicalLayer for TapDevice {
    fn transmit(&self, frame: Buffer) -> Result<(), Fail> {
        let nbytes: usize = (&self.file).write(&frame)?;
        if nbytes != frame.len() {
            warn!("transmit(): short write on {} ({} of {} bytes)", self.name, nbytes, frame.len());
        }
        Ok(())
    }

    fn receive(&self, buf: &mut Buffer) -> Result<usize, Fail> {
        if !self.wait_readable()? {
            return Err(Fail::new(EAGAIN, "no frame available"));
        }
        Ok((&self.file).read(&mut buf[..])?)
    }
}
