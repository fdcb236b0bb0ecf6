// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::runtime::fail::Fail;
use ::libc::ENOTSUP;
use ::std::convert::TryFrom;

#[repr(u16)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EtherType2 {
    Arp = 0x806,
    Ipv4 = 0x800,
    Ipv6 = 0x86dd,
}

impl TryFrom<u16> for EtherType2 {
    type Error = Fail;

    fn try_from(n: u16) -> Result<Self, Fail> {
        match n {
            0x806 => Ok(EtherType2::Arp),
            0x800 => Ok(EtherType2::Ipv4),
            0x86dd => Ok(EtherType2::Ipv6),
            _ => Err(Fail::new(ENOTSUP, "unsupported ETHERTYPE")),
        }
    }
}
