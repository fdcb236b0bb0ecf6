// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    inetstack::protocols::tcp::{
        SeqNumber,
        TcpHeader,
    },
    runtime::fail::Fail,
};
use ::libc::{
    EINVAL,
    ENOTCONN,
};
use ::std::net::SocketAddrV4;

//======================================================================================================================
// Structures
//======================================================================================================================

/// RFC 793 connection states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    Listen,
    SynSent,
    SynRecvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
    Closed,
}

/// What the owner of a connection must do after feeding it a segment.
#[derive(Debug, Default)]
pub struct Transition {
    /// Segments to send to the peer, in order.
    pub replies: Vec<TcpHeader>,
    /// Whether the segment's payload goes to the listener.
    pub deliver: bool,
    /// Whether the connection just entered TIME-WAIT.
    pub time_wait: bool,
    /// Whether one of the replies is a reset.
    pub reset: bool,
}

/// Passive-open side of one connection.
///
/// `send_seq` is the next sequence number this side will use and `recv_seq` the next one it expects from the peer.
/// Segments are processed strictly in arrival order; anything that does not fit the current state, or carries
/// unexpected sequence numbers, resets the connection.
#[derive(Debug)]
pub struct TcpConnection {
    local: SocketAddrV4,
    remote: SocketAddrV4,
    send_seq: SeqNumber,
    recv_seq: SeqNumber,
    state: TcpState,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Transition {
    fn reply(header: TcpHeader) -> Self {
        Self {
            replies: vec![header],
            ..Default::default()
        }
    }

    fn reset(header: TcpHeader) -> Self {
        Self {
            replies: vec![header],
            reset: true,
            ..Default::default()
        }
    }
}

impl TcpConnection {
    /// Creates a connection waiting for the peer's SYN. `isn` is the first sequence number this side sends.
    pub fn listen(local: SocketAddrV4, remote: SocketAddrV4, isn: SeqNumber) -> Self {
        Self {
            local,
            remote,
            send_seq: isn,
            recv_seq: SeqNumber::from(0),
            state: TcpState::Listen,
        }
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn remote(&self) -> SocketAddrV4 {
        self.remote
    }

    pub fn send_seq(&self) -> SeqNumber {
        self.send_seq
    }

    pub fn recv_seq(&self) -> SeqNumber {
        self.recv_seq
    }

    pub fn is_closed(&self) -> bool {
        self.state == TcpState::Closed
    }

    /// Advances the state machine with one inbound segment carrying `payload_len` bytes.
    pub fn receive(&mut self, segment: &TcpHeader, payload_len: usize) -> Transition {
        if segment.rst {
            debug!("receive(): {} reset by peer in {:?}", self.remote, self.state);
            self.state = TcpState::Closed;
            return Transition::default();
        }

        match self.state {
            TcpState::Listen if segment.syn && !segment.ack && !segment.fin => {
                self.recv_seq = segment.seq_num + 1;
                let mut syn_ack: TcpHeader = self.header();
                syn_ack.syn = true;
                self.state = TcpState::SynRecvd;
                Transition::reply(syn_ack)
            },
            TcpState::SynRecvd if Self::is_plain_ack(segment) && self.acks(segment, self.send_seq + 1) => {
                // Our SYN is acknowledged.
                self.send_seq = self.send_seq + 1;
                self.state = TcpState::Established;
                if payload_len == 0 {
                    return Transition::default();
                }
                self.accept_data(payload_len)
            },
            // The peer may not have acknowledged all our data yet, but never acknowledges data we did not send.
            TcpState::Established if Self::is_plain_ack(segment) && self.in_sequence(segment) => {
                if payload_len == 0 {
                    return Transition::default();
                }
                self.accept_data(payload_len)
            },
            TcpState::Established if segment.fin && !segment.syn && self.in_sequence(segment) => {
                self.recv_seq = self.recv_seq + segment.segment_len(payload_len);
                let ack: TcpHeader = self.header();
                let mut fin: TcpHeader = self.header();
                fin.fin = true;
                self.send_seq = self.send_seq + 1;
                self.state = TcpState::LastAck;
                Transition {
                    replies: vec![ack, fin],
                    deliver: payload_len > 0,
                    ..Default::default()
                }
            },
            TcpState::LastAck if Self::is_plain_ack(segment) && payload_len == 0 && self.acks(segment, self.send_seq) => {
                self.state = TcpState::Closed;
                Transition::default()
            },
            // Our FIN is out; the peer may acknowledge it and close its side in any order.
            TcpState::FinWait1 | TcpState::FinWait2 if self.in_sequence(segment) && !segment.syn => {
                self.receive_while_closing(segment, payload_len)
            },
            TcpState::Closing if Self::is_plain_ack(segment) && self.acks(segment, self.send_seq) => {
                self.state = TcpState::TimeWait;
                Transition {
                    time_wait: true,
                    ..Default::default()
                }
            },
            // A retransmitted FIN means our last ACK was lost.
            TcpState::TimeWait if segment.fin => Transition::reply(self.header()),
            _ => {
                warn!(
                    "receive(): unexpected {:?} from {} in {:?} (send={}, recv={})",
                    segment, self.remote, self.state, self.send_seq, self.recv_seq
                );
                self.abort(segment, payload_len)
            },
        }
    }

    /// Builds the segment that carries `payload_len` bytes of our own data.
    pub fn push(&mut self, payload_len: usize) -> Result<TcpHeader, Fail> {
        match self.state {
            TcpState::Established | TcpState::CloseWait => {
                let mut header: TcpHeader = self.header();
                header.psh = true;
                self.send_seq = self.send_seq + payload_len as u32;
                Ok(header)
            },
            _ => Err(Fail::new(ENOTCONN, "connection cannot send data")),
        }
    }

    /// Starts an active close from our side.
    pub fn close(&mut self) -> Result<TcpHeader, Fail> {
        if self.state != TcpState::Established {
            return Err(Fail::new(EINVAL, "connection is not established"));
        }
        let mut fin: TcpHeader = self.header();
        fin.fin = true;
        self.send_seq = self.send_seq + 1;
        self.state = TcpState::FinWait1;
        Ok(fin)
    }

    /// Leaves TIME-WAIT once the wait elapsed.
    pub fn expire_time_wait(&mut self) -> bool {
        if self.state == TcpState::TimeWait {
            self.state = TcpState::Closed;
            return true;
        }
        false
    }

    fn receive_while_closing(&mut self, segment: &TcpHeader, payload_len: usize) -> Transition {
        let fin_acked: bool = segment.ack && segment.ack_num == self.send_seq;
        if segment.ack && !fin_acked && segment.ack_num != self.send_seq - SeqNumber::from(1) {
            return self.abort(segment, payload_len);
        }
        let mut transition: Transition = Transition::default();
        if payload_len > 0 || segment.fin {
            self.recv_seq = self.recv_seq + segment.segment_len(payload_len);
            transition.deliver = payload_len > 0;
            transition.replies.push(self.header());
        }
        self.state = match (self.state, fin_acked || self.state == TcpState::FinWait2, segment.fin) {
            (_, true, true) => TcpState::TimeWait,
            (TcpState::FinWait1, false, true) => TcpState::Closing,
            (_, true, false) => TcpState::FinWait2,
            (state, _, _) => state,
        };
        transition.time_wait = self.state == TcpState::TimeWait;
        transition
    }

    fn accept_data(&mut self, payload_len: usize) -> Transition {
        self.recv_seq = self.recv_seq + payload_len as u32;
        Transition {
            replies: vec![self.header()],
            deliver: true,
            ..Default::default()
        }
    }

    /// Tears the connection down and answers with a reset.
    fn abort(&mut self, segment: &TcpHeader, payload_len: usize) -> Transition {
        self.state = TcpState::Closed;
        Transition::reset(reset_for(segment, payload_len))
    }

    fn is_plain_ack(segment: &TcpHeader) -> bool {
        segment.ack && !segment.syn && !segment.fin
    }

    fn in_sequence(&self, segment: &TcpHeader) -> bool {
        segment.seq_num == self.recv_seq && (!segment.ack || segment.ack_num <= self.send_seq)
    }

    fn acks(&self, segment: &TcpHeader, expected_ack: SeqNumber) -> bool {
        segment.seq_num == self.recv_seq && segment.ack_num == expected_ack
    }

    /// Header of the next segment we send, acknowledging everything received so far.
    fn header(&self) -> TcpHeader {
        let mut header: TcpHeader = TcpHeader::new(self.local.port(), self.remote.port());
        header.seq_num = self.send_seq;
        header.ack_num = self.recv_seq;
        header.ack = true;
        header
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Builds the reset answering `segment` (RFC 793, "Reset Generation").
pub fn reset_for(segment: &TcpHeader, payload_len: usize) -> TcpHeader {
    let mut rst: TcpHeader = TcpHeader::new(segment.dst_port, segment.src_port);
    rst.rst = true;
    if segment.ack {
        rst.seq_num = segment.ack_num;
    } else {
        rst.ack = true;
        rst.ack_num = segment.seq_num + segment.segment_len(payload_len);
    }
    rst
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensure_eq;
    use ::anyhow::Result;
    use ::std::net::Ipv4Addr;

    const ISN: u32 = 1000;
    const PEER_ISN: u32 = 5000;

    fn local() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 80)
    }

    fn remote() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 40000)
    }

    fn segment(seq: u32, ack: Option<u32>) -> TcpHeader {
        let mut header: TcpHeader = TcpHeader::new(40000, 80);
        header.seq_num = SeqNumber::from(seq);
        if let Some(ack) = ack {
            header.ack = true;
            header.ack_num = SeqNumber::from(ack);
        }
        header
    }

    fn syn() -> TcpHeader {
        let mut header: TcpHeader = segment(PEER_ISN, None);
        header.syn = true;
        header
    }

    fn established() -> TcpConnection {
        let mut conn: TcpConnection = TcpConnection::listen(local(), remote(), SeqNumber::from(ISN));
        conn.receive(&syn(), 0);
        conn.receive(&segment(PEER_ISN + 1, Some(ISN + 1)), 0);
        conn
    }

    #[test]
    fn handshake_reaches_established() -> Result<()> {
        let mut conn: TcpConnection = TcpConnection::listen(local(), remote(), SeqNumber::from(ISN));

        let step: Transition = conn.receive(&syn(), 0);
        ensure_eq!(conn.state(), TcpState::SynRecvd);
        ensure_eq!(step.replies.len(), 1);
        let syn_ack: TcpHeader = step.replies[0];
        ensure_eq!((syn_ack.syn, syn_ack.ack), (true, true));
        ensure_eq!(syn_ack.seq_num, SeqNumber::from(ISN));
        ensure_eq!(syn_ack.ack_num, SeqNumber::from(PEER_ISN + 1));

        let step: Transition = conn.receive(&segment(PEER_ISN + 1, Some(ISN + 1)), 0);
        ensure_eq!(conn.state(), TcpState::Established);
        ensure_eq!(step.replies.len(), 0);
        ensure_eq!(conn.send_seq(), SeqNumber::from(ISN + 1));
        Ok(())
    }

    #[test]
    fn syn_in_syn_recvd_resets() -> Result<()> {
        let mut conn: TcpConnection = TcpConnection::listen(local(), remote(), SeqNumber::from(ISN));
        conn.receive(&syn(), 0);

        let mut bogus: TcpHeader = segment(PEER_ISN + 7, Some(ISN + 3));
        bogus.syn = true;
        let step: Transition = conn.receive(&bogus, 0);
        ensure_eq!(conn.state(), TcpState::Closed);
        ensure_eq!(step.reset, true);
        ensure_eq!(step.replies[0].rst, true);
        ensure_eq!(step.replies[0].seq_num, SeqNumber::from(ISN + 3));
        Ok(())
    }

    #[test]
    fn data_is_acknowledged_and_delivered() -> Result<()> {
        let mut conn: TcpConnection = established();
        let mut data: TcpHeader = segment(PEER_ISN + 1, Some(ISN + 1));
        data.psh = true;
        let step: Transition = conn.receive(&data, 12);
        ensure_eq!(step.deliver, true);
        ensure_eq!(step.replies[0].ack_num, SeqNumber::from(PEER_ISN + 13));
        ensure_eq!(conn.state(), TcpState::Established);

        // Replaying the same bytes is a sequence mismatch.
        let step: Transition = conn.receive(&data, 12);
        ensure_eq!(step.reset, true);
        ensure_eq!(conn.is_closed(), true);
        Ok(())
    }

    #[test]
    fn passive_close_goes_through_last_ack() -> Result<()> {
        let mut conn: TcpConnection = established();
        let mut fin: TcpHeader = segment(PEER_ISN + 1, Some(ISN + 1));
        fin.fin = true;
        let step: Transition = conn.receive(&fin, 0);
        ensure_eq!(conn.state(), TcpState::LastAck);
        ensure_eq!(step.replies.len(), 2);
        ensure_eq!(step.replies[0].ack_num, SeqNumber::from(PEER_ISN + 2));
        ensure_eq!(step.replies[1].fin, true);

        conn.receive(&segment(PEER_ISN + 2, Some(ISN + 2)), 0);
        ensure_eq!(conn.state(), TcpState::Closed);
        Ok(())
    }

    #[test]
    fn active_close_waits_in_time_wait() -> Result<()> {
        let mut conn: TcpConnection = established();
        let fin: TcpHeader = conn.close()?;
        ensure_eq!(fin.fin, true);
        ensure_eq!(conn.state(), TcpState::FinWait1);

        conn.receive(&segment(PEER_ISN + 1, Some(ISN + 2)), 0);
        ensure_eq!(conn.state(), TcpState::FinWait2);

        let mut peer_fin: TcpHeader = segment(PEER_ISN + 1, Some(ISN + 2));
        peer_fin.fin = true;
        let step: Transition = conn.receive(&peer_fin, 0);
        ensure_eq!(conn.state(), TcpState::TimeWait);
        ensure_eq!(step.time_wait, true);
        ensure_eq!(step.replies[0].ack_num, SeqNumber::from(PEER_ISN + 2));

        ensure_eq!(conn.expire_time_wait(), true);
        ensure_eq!(conn.is_closed(), true);
        Ok(())
    }

    #[test]
    fn simultaneous_close_goes_through_closing() -> Result<()> {
        let mut conn: TcpConnection = established();
        conn.close()?;
        let mut peer_fin: TcpHeader = segment(PEER_ISN + 1, Some(ISN + 1));
        peer_fin.fin = true;
        conn.receive(&peer_fin, 0);
        ensure_eq!(conn.state(), TcpState::Closing);
        conn.receive(&segment(PEER_ISN + 2, Some(ISN + 2)), 0);
        ensure_eq!(conn.state(), TcpState::TimeWait);
        Ok(())
    }

    #[test]
    fn reset_tears_down_without_reply() -> Result<()> {
        let mut conn: TcpConnection = established();
        let mut rst: TcpHeader = segment(PEER_ISN + 1, None);
        rst.rst = true;
        let step: Transition = conn.receive(&rst, 0);
        ensure_eq!(step.replies.len(), 0);
        ensure_eq!(conn.is_closed(), true);
        Ok(())
    }
}
