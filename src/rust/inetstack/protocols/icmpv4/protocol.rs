// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::runtime::fail::Fail;
use ::libc::ENOTSUP;

//======================================================================================================================
// Structures
//======================================================================================================================

/// ICMPv4 message types this stack understands, with their type-specific header words.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Icmpv4Type {
    EchoReply { id: u16, seq_num: u16 },
    DestinationUnreachable,
    EchoRequest { id: u16, seq_num: u16 },
    TimeExceeded,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Icmpv4Type {
    pub fn parse(type_byte: u8, rest_of_header: &[u8; 4]) -> Result<Self, Fail> {
        let id: u16 = u16::from_be_bytes([rest_of_header[0], rest_of_header[1]]);
        let seq_num: u16 = u16::from_be_bytes([rest_of_header[2], rest_of_header[3]]);
        match type_byte {
            0 => Ok(Icmpv4Type::EchoReply { id, seq_num }),
            3 => Ok(Icmpv4Type::DestinationUnreachable),
            8 => Ok(Icmpv4Type::EchoRequest { id, seq_num }),
            11 => Ok(Icmpv4Type::TimeExceeded),
            _ => Err(Fail::new(ENOTSUP, "unsupported ICMPv4 message type")),
        }
    }

    pub fn serialize(&self) -> (u8, [u8; 4]) {
        match self {
            Icmpv4Type::EchoReply { id, seq_num } => (0, Self::echo_words(*id, *seq_num)),
            Icmpv4Type::DestinationUnreachable => (3, [0; 4]),
            Icmpv4Type::EchoRequest { id, seq_num } => (8, Self::echo_words(*id, *seq_num)),
            Icmpv4Type::TimeExceeded => (11, [0; 4]),
        }
    }

    fn echo_words(id: u16, seq_num: u16) -> [u8; 4] {
        let [id1, id2] = id.to_be_bytes();
        let [seq1, seq2] = seq_num.to_be_bytes();
        [id1, id2, seq1, seq2]
    }
}
