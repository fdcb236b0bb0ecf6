// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    inetstack::{
        counters::StackCounters,
        protocols::ipv4::{
            header::{
                IPV4_DATAGRAM_MAX_SIZE,
                IPV4_HEADER_MIN_SIZE,
            },
            IpProtocol,
            Ipv4Header,
        },
    },
    runtime::{
        config::Config,
        fail::Fail,
        memory::{
            Buffer,
            BufferPool,
        },
        scheduler::{
            Scheduler,
            Task,
            TaskQueue,
            WorkerGroup,
        },
        timer::{
            DelayedTask,
            TimerHandle,
            TimerService,
        },
    },
};
use ::crc::{
    Crc,
    CRC_32_CKSUM,
};
use ::libc::{
    EBADMSG,
    ECANCELED,
    EINVAL,
};
use ::std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    mem,
    net::Ipv4Addr,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
    },
    time::Duration,
};

//======================================================================================================================
// Constants
//======================================================================================================================

const PARTITION_HASH: Crc<u32> = Crc::<u32>::new(&CRC_32_CKSUM);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Receives every reassembled datagram, on a pool worker.
pub type DatagramHandler = Arc<dyn Fn(Ipv4Header, Buffer) + Send + Sync>;

/// Tunables of the reassembly engine.
#[derive(Clone, Copy, Debug)]
pub struct ReassemblySettings {
    pub partitions: usize,
    pub mailbox_capacity: usize,
    /// Time-to-live a message starts with, and returns to whenever one of its fragments arrives.
    pub base_ttl: Duration,
    /// Growth of the time-to-live after every check that finds the message incomplete.
    pub backoff_factor: f64,
    /// A message whose time-to-live reaches this is dropped.
    pub giveup_ttl: Duration,
}

/// What happened to a datagram handed to [Reassembler::reassemble_or_passthrough].
#[derive(Debug)]
pub enum ReassemblyOutcome {
    /// Not a fragment. The caller keeps the payload and dispatches it now.
    Complete(Ipv4Header, Buffer),
    /// Ownership moved to the assembler partition. The datagram is dispatched once all its fragments are in.
    Queued,
    /// The fragment was refused and its buffer released.
    Dropped(Fail),
}

/// Identifies the datagram a fragment belongs to (RFC 791).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct FragmentKey {
    src_addr: Ipv4Addr,
    dst_addr: Ipv4Addr,
    protocol: IpProtocol,
    identification: u16,
}

/// A partially received datagram.
struct IpRecv {
    /// Header of the first fragment seen, replaced by the header of the fragment at offset zero.
    header: Ipv4Header,
    /// Payload length, known once the last fragment arrives.
    expected_total: Option<usize>,
    received: usize,
    /// Fragment payloads by offset. Never overlapping.
    segments: BTreeMap<usize, Buffer>,
    ttl: Duration,
    /// Distinguishes this message from earlier ones that used the same key, so late rechecks are ignored.
    serial: u64,
    timer: Option<TimerHandle>,
}

#[derive(Default)]
struct PartitionState {
    messages: HashMap<FragmentKey, IpRecv>,
    next_serial: u64,
}

/// One slice of the in-flight messages, with the mailbox of the only thread allowed to touch it.
struct Partition {
    mailbox: Arc<TaskQueue>,
    state: Mutex<PartitionState>,
}

struct Engine {
    settings: ReassemblySettings,
    partitions: Vec<Partition>,
    scheduler: Arc<Scheduler>,
    timer: Arc<TimerService>,
    pool: BufferPool,
    counters: Arc<StackCounters>,
    handler: DatagramHandler,
}

/// IP reassembly engine.
///
/// Fragments are hashed by (source, identification) onto a fixed set of partitions. Each partition is drained by one
/// assembler thread, and every mutation of a message, whether triggered by a fragment arrival or by its recheck timer,
/// runs as a task on that thread. Completed datagrams are handed to the worker pool.
pub struct Reassembler {
    engine: Arc<Engine>,
    workers: Mutex<Vec<WorkerGroup>>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl ReassemblySettings {
    pub fn from_config(config: &Config) -> Result<Self, Fail> {
        let settings: ReassemblySettings = Self {
            partitions: config.reassembly_partitions()?,
            mailbox_capacity: config.reassembly_mailbox_capacity()?,
            base_ttl: config.reassembly_base_ttl()?,
            backoff_factor: config.reassembly_backoff_factor()?,
            giveup_ttl: config.reassembly_giveup_ttl()?,
        };
        if settings.giveup_ttl <= settings.base_ttl {
            let cause: String = format!(
                "giveup ttl must exceed base ttl (base={:?}, giveup={:?})",
                settings.base_ttl, settings.giveup_ttl
            );
            error!("from_config(): {}", cause);
            return Err(Fail::new(EINVAL, &cause));
        }
        Ok(settings)
    }
}

impl FragmentKey {
    fn of(header: &Ipv4Header) -> Self {
        Self {
            src_addr: header.get_src_addr(),
            dst_addr: header.get_dest_addr(),
            protocol: header.get_protocol(),
            identification: header.get_identification(),
        }
    }

    /// Partition owning this key: a hash of the source address and identification.
    fn partition(&self, count: usize) -> usize {
        let mut digest = PARTITION_HASH.digest();
        digest.update(&self.src_addr.octets());
        digest.update(&self.identification.to_be_bytes());
        (digest.finalize() as usize) % count
    }
}

impl IpRecv {
    fn new(header: Ipv4Header, ttl: Duration, serial: u64) -> Self {
        Self {
            header,
            expected_total: None,
            received: 0,
            segments: BTreeMap::new(),
            ttl,
            serial,
            timer: None,
        }
    }

    /// Whether `[offset, end)` intersects a segment already held.
    fn overlaps(&self, offset: usize, end: usize) -> bool {
        if let Some((prev_offset, prev)) = self.segments.range(..end).next_back() {
            if prev_offset + prev.len() > offset {
                return true;
            }
        }
        false
    }

    fn insert(&mut self, header: &Ipv4Header, segment: Buffer) -> Result<(), Fail> {
        let offset: usize = header.fragment_offset();
        let end: usize = offset + segment.len();
        if header.more_fragments() {
            if let Some(total) = self.expected_total {
                if end > total {
                    return Err(Fail::new(EBADMSG, "fragment extends past the last fragment"));
                }
            }
        } else {
            if self.expected_total.is_some() {
                return Err(Fail::new(EBADMSG, "conflicting last fragment"));
            }
            if let Some((last_offset, last)) = self.segments.iter().next_back() {
                if last_offset + last.len() > end {
                    return Err(Fail::new(EBADMSG, "last fragment ends before data already received"));
                }
            }
            self.expected_total = Some(end);
        }
        if offset == 0 {
            self.header = *header;
        }
        self.received += segment.len();
        self.segments.insert(offset, segment);
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.expected_total == Some(self.received)
    }
}

impl Partition {
    fn lock(&self) -> MutexGuard<'_, PartitionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Engine {
    /// Runs on the partition thread for every fragment.
    fn on_fragment(self: &Arc<Self>, index: usize, header: Ipv4Header, segment: Buffer) {
        match self.accept(index, header, segment) {
            Ok(Some((header, datagram))) => self.deliver(header, datagram),
            Ok(None) => (),
            Err(e) => {
                StackCounters::bump(&self.counters.packets_dropped);
                warn!("on_fragment(): dropping packet ({:?})", e.context("ipv4-reassembly"));
            },
        }
    }

    /// Files `segment` under its message. Returns the reassembled datagram if this fragment completed it.
    fn accept(
        self: &Arc<Self>,
        index: usize,
        header: Ipv4Header,
        segment: Buffer,
    ) -> Result<Option<(Ipv4Header, Buffer)>, Fail> {
        let key: FragmentKey = FragmentKey::of(&header);
        let offset: usize = header.fragment_offset();
        let end: usize = offset + segment.len();
        if segment.is_empty() {
            return Err(Fail::new(EBADMSG, "empty fragment"));
        }
        if header.more_fragments() && segment.len() % 8 != 0 {
            return Err(Fail::new(EBADMSG, "fragment length is not a multiple of 8"));
        }
        if IPV4_HEADER_MIN_SIZE + end > IPV4_DATAGRAM_MAX_SIZE {
            return Err(Fail::new(EBADMSG, "fragment ends past the largest datagram"));
        }

        let mut state: MutexGuard<'_, PartitionState> = self.partitions[index].lock();
        if !state.messages.contains_key(&key) {
            let serial: u64 = state.next_serial;
            state.next_serial += 1;
            let mut message: IpRecv = IpRecv::new(header, self.settings.base_ttl, serial);
            message.timer = self.arm_recheck(index, key, serial, self.settings.base_ttl);
            state.messages.insert(key, message);
            trace!("accept(): new message {:?} on partition {}", key, index);
        }
        let message: &mut IpRecv = match state.messages.get_mut(&key) {
            Some(message) => message,
            None => return Err(Fail::new(EBADMSG, "message vanished from its partition")),
        };

        if message.overlaps(offset, end) {
            StackCounters::bump(&self.counters.duplicate_fragments);
            let cause: String = format!("duplicate fragment (key={:?}, offset={}, len={})", key, offset, end - offset);
            return Err(Fail::new(EBADMSG, &cause));
        }
        message.insert(&header, segment)?;
        message.ttl = self.settings.base_ttl;

        if !message.is_complete() {
            return Ok(None);
        }
        let message: Option<IpRecv> = state.messages.remove(&key);
        drop(state);
        match message {
            Some(message) => Ok(Some(self.assemble(message))),
            None => Err(Fail::new(EBADMSG, "complete message vanished from its partition")),
        }
    }

    /// Runs on the partition thread when a message's time-to-live elapses.
    fn recheck(self: &Arc<Self>, index: usize, key: FragmentKey, serial: u64) {
        let mut state: MutexGuard<'_, PartitionState> = self.partitions[index].lock();
        let message: &mut IpRecv = match state.messages.get_mut(&key) {
            Some(message) if message.serial == serial => message,
            _ => {
                trace!("recheck(): message {:?} is already gone", key);
                return;
            },
        };
        // This timer fired; the handle is spent.
        message.timer = None;

        if message.is_complete() {
            if let Some(message) = state.messages.remove(&key) {
                drop(state);
                let (header, datagram): (Ipv4Header, Buffer) = self.assemble(message);
                self.deliver(header, datagram);
            }
            return;
        }

        let ttl: Duration = message.ttl.mul_f64(self.settings.backoff_factor);
        if ttl >= self.settings.giveup_ttl {
            if let Some(message) = state.messages.remove(&key) {
                StackCounters::bump(&self.counters.reassembly_expired);
                warn!(
                    "recheck(): giving up on {:?} ({} of {:?} bytes received)",
                    key, message.received, message.expected_total
                );
            }
            return;
        }
        message.ttl = ttl;
        message.timer = self.arm_recheck(index, key, serial, ttl);
    }

    /// Arms a recheck of a message on its partition. The recheck is retried if the partition mailbox is full when
    /// the timer fires.
    fn arm_recheck(self: &Arc<Self>, index: usize, key: FragmentKey, serial: u64, delay: Duration) -> Option<TimerHandle> {
        let engine: Arc<Engine> = self.clone();
        let task: Task = Task::new("ipv4-recheck", self.partitions[index].mailbox.clone(), move || {
            engine.recheck(index, key, serial)
        });
        let retry: Arc<Engine> = self.clone();
        let delayed: DelayedTask = DelayedTask::once(task, delay).on_failure(move |e: Fail| {
            if e.errno == ECANCELED {
                return;
            }
            warn!("arm_recheck(): recheck of {:?} was refused, retrying ({:?})", key, e);
            retry.arm_recheck(index, key, serial, retry.settings.base_ttl);
        });
        match self.timer.submit_delayed(delayed) {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("arm_recheck(): cannot arm recheck of {:?} ({:?})", key, e);
                None
            },
        }
    }

    /// Copies the segments of a complete message into one buffer, in offset order, and frees them.
    fn assemble(&self, mut message: IpRecv) -> (Ipv4Header, Buffer) {
        if let Some(timer) = message.timer.take() {
            timer.cancel();
        }
        let total: usize = message.received;
        let mut datagram: Buffer = self.pool.acquire(total);
        let mut cursor: usize = 0;
        for (offset, segment) in mem::take(&mut message.segments) {
            assert_eq!(offset, cursor, "assemble(): hole in a complete message");
            datagram[cursor..cursor + segment.len()].copy_from_slice(&segment);
            cursor += segment.len();
            segment.release();
        }
        StackCounters::bump(&self.counters.datagrams_reassembled);
        debug!("assemble(): reassembled {} bytes from {}", total, message.header.get_src_addr());
        (message.header.into_reassembled(total), datagram)
    }

    /// Hands a reassembled datagram to the worker pool.
    fn deliver(&self, header: Ipv4Header, datagram: Buffer) {
        let handler: DatagramHandler = self.handler.clone();
        if let Err(e) = self
            .scheduler
            .submit("ipv4-deliver", move || handler(header, datagram))
        {
            StackCounters::bump(&self.counters.packets_dropped);
            warn!("deliver(): dropping reassembled datagram ({:?})", e);
        }
    }
}

impl Reassembler {
    pub fn new(
        settings: ReassemblySettings,
        scheduler: Arc<Scheduler>,
        timer: Arc<TimerService>,
        pool: BufferPool,
        counters: Arc<StackCounters>,
        handler: DatagramHandler,
    ) -> Result<Self, Fail> {
        if settings.partitions == 0 {
            return Err(Fail::new(EINVAL, "reassembly needs at least one partition"));
        }
        let mut partitions: Vec<Partition> = Vec::with_capacity(settings.partitions);
        for i in 0..settings.partitions {
            let name: String = format!("ipv4-partition-{}", i);
            partitions.push(Partition {
                mailbox: Arc::new(TaskQueue::bounded(&name, settings.mailbox_capacity)?),
                state: Mutex::new(PartitionState::default()),
            });
        }
        let engine: Arc<Engine> = Arc::new(Engine {
            settings,
            partitions,
            scheduler,
            timer,
            pool,
            counters,
            handler,
        });

        let mut workers: Vec<WorkerGroup> = Vec::with_capacity(settings.partitions);
        for (i, partition) in engine.partitions.iter().enumerate() {
            let prefix: String = format!("tapstack-assembler-{}", i);
            workers.push(WorkerGroup::spawn(&prefix, 1, partition.mailbox.clone())?);
        }
        info!("new(): started {} assembler partitions", settings.partitions);
        Ok(Self {
            engine,
            workers: Mutex::new(workers),
        })
    }

    /// Routes an inbound datagram. Non-fragments are handed straight back; fragments are queued on the partition
    /// that owns their message.
    pub fn reassemble_or_passthrough(&self, header: Ipv4Header, payload: Buffer) -> ReassemblyOutcome {
        if !header.is_fragment() {
            return ReassemblyOutcome::Complete(header, payload);
        }
        let index: usize = FragmentKey::of(&header).partition(self.engine.partitions.len());
        let engine: Arc<Engine> = self.engine.clone();
        let task: Task = Task::new("ipv4-fragment", self.engine.partitions[index].mailbox.clone(), move || {
            engine.on_fragment(index, header, payload)
        });
        match task.dispatch() {
            Ok(()) => ReassemblyOutcome::Queued,
            Err(e) => ReassemblyOutcome::Dropped(e.context("ipv4-reassembly")),
        }
    }

    /// Number of messages waiting for fragments, across partitions.
    pub fn in_flight(&self) -> usize {
        self.engine
            .partitions
            .iter()
            .map(|partition| partition.lock().messages.len())
            .sum()
    }

    pub fn settings(&self) -> &ReassemblySettings {
        &self.engine.settings
    }

    /// Stops the assembler threads and drops every partial message and queued fragment.
    pub fn shutdown(&self) {
        let mut workers: MutexGuard<'_, Vec<WorkerGroup>> = match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if workers.is_empty() {
            return;
        }
        for mut group in workers.drain(..) {
            group.shutdown();
        }
        // Queued tasks and pending timers hold the engine; release them so it can be freed.
        for partition in &self.engine.partitions {
            while partition.mailbox.try_dequeue().is_some() {}
            for (_, mut message) in partition.lock().messages.drain() {
                if let Some(timer) = message.timer.take() {
                    timer.cancel();
                }
            }
        }
        info!("shutdown(): assembler partitions stopped");
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for ReassemblySettings {
    fn default() -> Self {
        Self {
            partitions: 4,
            mailbox_capacity: 1024,
            base_ttl: Duration::from_micros(500_000),
            backoff_factor: 1.5,
            giveup_ttl: Duration::from_micros(8_000_000),
        }
    }
}

impl Drop for Reassembler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensure_eq;
    use ::anyhow::Result;
    use ::crossbeam_channel::{
        Receiver,
        Sender,
    };

    const SRC: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const DST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    struct Harness {
        reassembler: Reassembler,
        pool: BufferPool,
        counters: Arc<StackCounters>,
        delivered: Receiver<(Ipv4Header, Buffer)>,
        _scheduler: Arc<Scheduler>,
        _timer: Arc<TimerService>,
    }

    fn harness(settings: ReassemblySettings) -> Result<Harness> {
        let scheduler: Arc<Scheduler> = Arc::new(Scheduler::new(2)?);
        let timer: Arc<TimerService> = Arc::new(TimerService::new(1)?);
        let pool: BufferPool = BufferPool::new(16, 2048, 64)?;
        let counters: Arc<StackCounters> = Arc::new(StackCounters::default());
        let (tx, rx): (Sender<(Ipv4Header, Buffer)>, Receiver<(Ipv4Header, Buffer)>) = crossbeam_channel::unbounded();
        let reassembler: Reassembler = Reassembler::new(
            settings,
            scheduler.clone(),
            timer.clone(),
            pool.clone(),
            counters.clone(),
            Arc::new(move |header, datagram| {
                let _ = tx.send((header, datagram));
            }),
        )?;
        Ok(Harness {
            reassembler,
            pool,
            counters,
            delivered: rx,
            _scheduler: scheduler,
            _timer: timer,
        })
    }

    fn fragment(offset: usize, more: bool) -> Ipv4Header {
        let mut header: Ipv4Header = Ipv4Header::new(SRC, DST, IpProtocol::UDP);
        header.set_identification(7);
        header.set_fragment(offset, more);
        header
    }

    fn segment(pool: &BufferPool, payload: &[u8]) -> Buffer {
        let mut buf: Buffer = pool.acquire(payload.len());
        buf.copy_from_slice(payload);
        buf
    }

    #[test]
    fn duplicate_offset_is_rejected_without_corrupting_message() -> Result<()> {
        let h: Harness = harness(ReassemblySettings::default())?;
        let engine: &Arc<Engine> = &h.reassembler.engine;

        let first: Vec<u8> = vec![1u8; 16];
        ensure_eq!(engine.accept(0, fragment(0, true), segment(&h.pool, &first))?.is_none(), true);

        let forged: Vec<u8> = vec![9u8; 16];
        let e: Fail = engine.accept(0, fragment(0, true), segment(&h.pool, &forged)).unwrap_err();
        ensure_eq!(e.errno, EBADMSG);
        ensure_eq!(h.counters.snapshot().duplicate_fragments, 1);

        // Partial overlap counts as a duplicate too.
        let straddle: Vec<u8> = vec![5u8; 16];
        anyhow::ensure!(engine
            .accept(0, fragment(8, true), segment(&h.pool, &straddle))
            .is_err());
        ensure_eq!(h.counters.snapshot().duplicate_fragments, 2);

        let last: Vec<u8> = vec![2u8; 4];
        let (header, datagram) = match engine.accept(0, fragment(16, false), segment(&h.pool, &last))? {
            Some(done) => done,
            None => anyhow::bail!("message should be complete"),
        };
        ensure_eq!(header.is_fragment(), false);
        ensure_eq!(header.get_total_length(), IPV4_HEADER_MIN_SIZE + 20);
        ensure_eq!(&datagram[..16], &first[..]);
        ensure_eq!(&datagram[16..], &last[..]);
        drop(datagram);
        ensure_eq!(h.pool.outstanding(), 0);
        Ok(())
    }

    #[test]
    fn last_fragment_fixes_size_once() -> Result<()> {
        let h: Harness = harness(ReassemblySettings::default())?;
        let engine: &Arc<Engine> = &h.reassembler.engine;

        let tail: Vec<u8> = vec![3u8; 8];
        anyhow::ensure!(engine.accept(1, fragment(16, false), segment(&h.pool, &tail))?.is_none());
        let other_tail: Vec<u8> = vec![4u8; 8];
        ensure_eq!(
            engine
                .accept(1, fragment(32, false), segment(&h.pool, &other_tail))
                .unwrap_err()
                .errno,
            EBADMSG
        );
        let beyond: Vec<u8> = vec![4u8; 8];
        anyhow::ensure!(engine.accept(1, fragment(24, true), segment(&h.pool, &beyond)).is_err());
        ensure_eq!(h.reassembler.in_flight(), 1);
        Ok(())
    }

    #[test]
    fn incomplete_message_expires_and_frees_segments() -> Result<()> {
        let h: Harness = harness(ReassemblySettings {
            partitions: 2,
            mailbox_capacity: 64,
            base_ttl: Duration::from_millis(20),
            backoff_factor: 2.0,
            giveup_ttl: Duration::from_millis(80),
        })?;
        let head: Vec<u8> = vec![1u8; 64];
        let outcome: ReassemblyOutcome = h
            .reassembler
            .reassemble_or_passthrough(fragment(0, true), segment(&h.pool, &head));
        anyhow::ensure!(matches!(outcome, ReassemblyOutcome::Queued));

        // 20ms, then 40ms, then the ttl reaches 80ms and the message is dropped.
        let deadline: std::time::Instant = std::time::Instant::now() + Duration::from_secs(5);
        while h.counters.snapshot().reassembly_expired == 0 {
            anyhow::ensure!(std::time::Instant::now() < deadline, "message never expired");
            std::thread::sleep(Duration::from_millis(10));
        }
        ensure_eq!(h.reassembler.in_flight(), 0);
        ensure_eq!(h.pool.outstanding(), 0);
        anyhow::ensure!(h.delivered.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn non_fragment_passes_through() -> Result<()> {
        let h: Harness = harness(ReassemblySettings::default())?;
        let header: Ipv4Header = Ipv4Header::new(SRC, DST, IpProtocol::UDP);
        match h.reassembler.reassemble_or_passthrough(header, Buffer::from_slice(&[1, 2, 3])) {
            ReassemblyOutcome::Complete(_, payload) => ensure_eq!(&payload[..], &[1, 2, 3]),
            other => anyhow::bail!("unexpected outcome {:?}", other),
        }
        Ok(())
    }
}
