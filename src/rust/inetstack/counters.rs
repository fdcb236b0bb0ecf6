// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    fmt,
    sync::atomic::{
        AtomicUsize,
        Ordering,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Event counters shared by every component of a stack. Updated with relaxed atomics: each counter is exact, but
/// a snapshot across counters is not.
#[derive(Default)]
pub struct StackCounters {
    pub frames_received: AtomicUsize,
    pub frames_transmitted: AtomicUsize,
    /// Inbound packets dropped for any reason (malformed, unroutable, queue full).
    pub packets_dropped: AtomicUsize,
    /// Fragments that overlapped data already held for their datagram.
    pub duplicate_fragments: AtomicUsize,
    pub datagrams_reassembled: AtomicUsize,
    /// Partially reassembled datagrams given up on.
    pub reassembly_expired: AtomicUsize,
    pub tcp_resets_sent: AtomicUsize,
}

/// Point-in-time copy of [StackCounters].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub frames_received: usize,
    pub frames_transmitted: usize,
    pub packets_dropped: usize,
    pub duplicate_fragments: usize,
    pub datagrams_reassembled: usize,
    pub reassembly_expired: usize,
    pub tcp_resets_sent: usize,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl StackCounters {
    pub fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_transmitted: self.frames_transmitted.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            duplicate_fragments: self.duplicate_fragments.load(Ordering::Relaxed),
            datagrams_reassembled: self.datagrams_reassembled.load(Ordering::Relaxed),
            reassembly_expired: self.reassembly_expired.load(Ordering::Relaxed),
            tcp_resets_sent: self.tcp_resets_sent.load(Ordering::Relaxed),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Debug for StackCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.snapshot(), f)
    }
}
