// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::Task,
};
use ::core::cmp::Reverse;
use ::crossbeam_channel::{
    Receiver,
    RecvTimeoutError,
    Sender,
};
use ::libc::{
    ECANCELED,
    EINVAL,
};
use ::rand::Rng;
use ::slab::Slab;
use ::std::{
    collections::{
        BinaryHeap,
        HashMap,
    },
    fmt,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
        Mutex,
        MutexGuard,
    },
    thread::{
        self,
        JoinHandle,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Produces a fresh task on every tick of a periodic timer.
pub type TaskFactory = Arc<dyn Fn() -> Task + Send + Sync>;

/// Cleanup hook run when a fired task cannot be delivered to its queue.
pub type FailureHook = Box<dyn FnOnce(Fail) + Send>;

enum Payload {
    Once(Task),
    Periodic(TaskFactory),
}

/// A task to deliver after a delay.
pub struct DelayedTask {
    delay: Duration,
    payload: Payload,
    on_failure: Option<FailureHook>,
}

/// Single-shot cancellation handle for an armed timer.
pub struct TimerHandle {
    id: u64,
    channel: Sender<Command>,
}

/// Timer threads, each owning one deadline channel.
///
/// Firing a timer only dispatches the inner task to the queue it is bound to. No protocol code ever runs on a timer
/// thread, so a reassembly recheck still executes on the partition that owns the state it touches.
pub struct TimerService {
    channels: Vec<Sender<Command>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
}

enum Command {
    Arm { id: u64, expiry: Instant, delayed: DelayedTask },
    Cancel { id: u64 },
    Shutdown,
}

struct TimerQueueEntry {
    expiry: Instant,
    id: u64,
    slot: usize,
}

/// State owned by one timer thread.
struct TimerThread {
    name: String,
    channel: Receiver<Command>,
    // Use a reverse to get a min heap.
    heap: BinaryHeap<Reverse<TimerQueueEntry>>,
    pending: Slab<(u64, DelayedTask)>,
    slots: HashMap<u64, usize>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl DelayedTask {
    /// Delivers `task` once, `delay` from now.
    pub fn once(task: Task, delay: Duration) -> Self {
        Self {
            delay,
            payload: Payload::Once(task),
            on_failure: None,
        }
    }

    /// Delivers a task built by `factory` every `period`. The period must not be zero.
    pub fn periodic(factory: TaskFactory, period: Duration) -> Self {
        Self {
            delay: period,
            payload: Payload::Periodic(factory),
            on_failure: None,
        }
    }

    /// Sets the hook that runs when the fired task cannot be delivered, e.g. because its queue is full.
    pub fn on_failure<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(Fail) + Send + 'static,
    {
        self.on_failure = Some(Box::new(hook));
        self
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl TimerHandle {
    /// Cancels the timer. Cancelling a timer that already fired has no effect.
    pub fn cancel(self) {
        if self.channel.send(Command::Cancel { id: self.id }).is_err() {
            debug!("cancel(): timer service is gone (id={})", self.id);
        }
    }
}

impl TimerService {
    pub fn new(timer_threads: usize) -> Result<Self, Fail> {
        if timer_threads == 0 {
            return Err(Fail::new(EINVAL, "timer service needs at least one thread"));
        }
        let mut service: TimerService = Self {
            channels: Vec::with_capacity(timer_threads),
            threads: Mutex::new(Vec::with_capacity(timer_threads)),
            next_id: AtomicU64::new(0),
        };
        for i in 0..timer_threads {
            let (tx, rx): (Sender<Command>, Receiver<Command>) = ::crossbeam_channel::unbounded();
            let name: String = format!("tapstack-timer-{}", i);
            let timer: TimerThread = TimerThread {
                name: name.clone(),
                channel: rx,
                heap: BinaryHeap::new(),
                pending: Slab::new(),
                slots: HashMap::new(),
            };
            let handle: JoinHandle<()> = thread::Builder::new().name(name).spawn(move || timer.run())?;
            service.channels.push(tx);
            service.lock_threads().push(handle);
        }
        info!("new(): started {} timer threads", timer_threads);
        Ok(service)
    }

    /// Arms `delayed` on a timer thread chosen uniformly at random. The deadline counts from this call.
    pub fn submit_delayed(&self, delayed: DelayedTask) -> Result<TimerHandle, Fail> {
        if let Payload::Periodic(_) = delayed.payload {
            if delayed.delay.is_zero() {
                return Err(Fail::new(EINVAL, "periodic timer needs a non-zero period"));
            }
        }
        let expiry: Instant = Instant::now() + delayed.delay;
        let index: usize = ::rand::thread_rng().gen_range(0..self.channels.len());
        let channel: &Sender<Command> = &self.channels[index];
        let id: u64 = self.next_id.fetch_add(1, Ordering::Relaxed);
        if channel.send(Command::Arm { id, expiry, delayed }).is_err() {
            return Err(Fail::new(ECANCELED, "timer service is shut down"));
        }
        Ok(TimerHandle {
            id,
            channel: channel.clone(),
        })
    }

    /// Arms a one-shot task.
    pub fn schedule(&self, task: Task, delay: Duration) -> Result<TimerHandle, Fail> {
        self.submit_delayed(DelayedTask::once(task, delay))
    }

    /// Stops every timer thread. Pending timers are discarded.
    pub fn shutdown(&self) {
        for channel in &self.channels {
            let _ = channel.send(Command::Shutdown);
        }
        for handle in self.lock_threads().drain(..) {
            if handle.join().is_err() {
                error!("shutdown(): a timer thread panicked");
            }
        }
    }

    fn lock_threads(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.threads.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl TimerThread {
    fn run(mut self) {
        loop {
            // Commands never hold back a deadline that is already due.
            if self.is_due() {
                self.fire_expired();
            }
            let command: Result<Command, RecvTimeoutError> = match self.heap.peek() {
                Some(Reverse(entry)) => self.channel.recv_deadline(entry.expiry),
                None => self.channel.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match command {
                Ok(Command::Arm { id, expiry, delayed }) => self.arm(id, delayed, expiry),
                Ok(Command::Cancel { id }) => {
                    // The heap entry stays behind and is skipped when it expires.
                    if let Some(slot) = self.slots.remove(&id) {
                        self.pending.remove(slot);
                        trace!("run(): {} cancelled timer {}", self.name, id);
                    }
                },
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => self.fire_expired(),
            }
        }
        trace!("run(): {} stopped with {} pending timers", self.name, self.pending.len());
    }

    fn is_due(&self) -> bool {
        match self.heap.peek() {
            Some(Reverse(entry)) => entry.expiry <= Instant::now(),
            None => false,
        }
    }

    fn arm(&mut self, id: u64, delayed: DelayedTask, expiry: Instant) {
        let slot: usize = self.pending.insert((id, delayed));
        self.slots.insert(id, slot);
        self.heap.push(Reverse(TimerQueueEntry { expiry, id, slot }));
    }

    /// Dispatches every timer whose deadline has passed.
    fn fire_expired(&mut self) {
        let now: Instant = Instant::now();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if now < entry.expiry {
                break;
            }
            let entry: TimerQueueEntry = match self.heap.pop() {
                Some(Reverse(entry)) => entry,
                None => break,
            };
            // Slots of cancelled timers get reused; only fire if the slot still holds this timer.
            match self.pending.get(entry.slot) {
                Some((id, _)) if *id == entry.id => (),
                _ => continue,
            }
            self.slots.remove(&entry.id);
            let (id, delayed): (u64, DelayedTask) = self.pending.remove(entry.slot);
            let DelayedTask {
                delay,
                payload,
                on_failure,
            } = delayed;
            match payload {
                Payload::Once(task) => {
                    if let Err(e) = task.dispatch() {
                        match on_failure {
                            Some(hook) => hook(e),
                            None => warn!("fire_expired(): dropping timer {} ({:?})", id, e),
                        }
                    }
                },
                Payload::Periodic(factory) => {
                    if let Err(e) = factory().dispatch() {
                        warn!("fire_expired(): periodic timer {} missed a tick ({:?})", id, e);
                    }
                    let next: DelayedTask = DelayedTask {
                        delay,
                        payload: Payload::Periodic(factory),
                        on_failure,
                    };
                    self.arm(id, next, entry.expiry + delay);
                },
            }
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle").field("id", &self.id).finish()
    }
}

impl PartialEq for TimerQueueEntry {
    fn eq(&self, other: &TimerQueueEntry) -> bool {
        // This is technically not correct. However for the usage in this module
        // we only need to compare timers by expiration.
        self.expiry == other.expiry
    }
}

impl Eq for TimerQueueEntry {}

impl PartialOrd for TimerQueueEntry {
    fn partial_cmp(&self, other: &TimerQueueEntry) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerQueueEntry {
    fn cmp(&self, other: &TimerQueueEntry) -> core::cmp::Ordering {
        self.expiry.cmp(&other.expiry)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        DelayedTask,
        TimerService,
    };
    use crate::{
        ensure_eq,
        runtime::scheduler::{
            Scheduler,
            Task,
            TaskQueue,
        },
    };
    use ::anyhow::Result;
    use ::crossbeam_channel::{
        Receiver,
        RecvTimeoutError,
        Sender,
    };
    use ::std::{
        sync::{
            atomic::{
                AtomicBool,
                Ordering,
            },
            Arc,
        },
        thread::JoinHandle,
        time::{
            Duration,
            Instant,
        },
    };

    #[test]
    fn fires_after_delay_on_worker() -> Result<()> {
        let scheduler: Scheduler = Scheduler::new(1)?;
        let timers: TimerService = TimerService::new(2)?;
        let (tx, rx): (Sender<Option<String>>, Receiver<Option<String>>) = crossbeam_channel::unbounded();

        let start: Instant = Instant::now();
        let task: Task = scheduler.task("timer-test", move || {
            let _ = tx.send(std::thread::current().name().map(str::to_string));
        });
        timers.schedule(task, Duration::from_millis(50))?;

        let thread_name: Option<String> = rx.recv_timeout(Duration::from_secs(5))?;
        anyhow::ensure!(start.elapsed() >= Duration::from_millis(50));
        anyhow::ensure!(thread_name.unwrap_or_default().starts_with("tapstack-worker"));
        Ok(())
    }

    #[test]
    fn cancelled_timer_never_fires() -> Result<()> {
        let scheduler: Scheduler = Scheduler::new(1)?;
        let timers: TimerService = TimerService::new(1)?;
        let (tx, rx): (Sender<()>, Receiver<()>) = crossbeam_channel::unbounded();

        let handle = timers.schedule(
            scheduler.task("cancelled", move || {
                let _ = tx.send(());
            }),
            Duration::from_millis(100),
        )?;
        handle.cancel();

        ensure_eq!(
            rx.recv_timeout(Duration::from_millis(300)),
            Err(RecvTimeoutError::Timeout)
        );
        Ok(())
    }

    #[test]
    fn timers_fire_in_deadline_order() -> Result<()> {
        let scheduler: Scheduler = Scheduler::new(1)?;
        let timers: TimerService = TimerService::new(1)?;
        let (tx, rx): (Sender<u64>, Receiver<u64>) = crossbeam_channel::unbounded();

        for delay in [90u64, 30, 60] {
            let tx: Sender<u64> = tx.clone();
            let task: Task = scheduler.task("ordered", move || {
                let _ = tx.send(delay);
            });
            timers.schedule(task, Duration::from_millis(delay))?;
        }

        let fired: Vec<u64> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)))
            .collect::<Result<Vec<u64>, _>>()?;
        ensure_eq!(fired, vec![30, 60, 90]);
        Ok(())
    }

    #[test]
    fn failure_hook_runs_when_target_refuses() -> Result<()> {
        let timers: TimerService = TimerService::new(1)?;
        let mailbox: Arc<TaskQueue> = Arc::new(TaskQueue::bounded("closed", 2)?);
        mailbox.shutdown(0);
        let (tx, rx): (Sender<i32>, Receiver<i32>) = crossbeam_channel::unbounded();

        let delayed: DelayedTask = DelayedTask::once(Task::new("refused", mailbox.clone(), || ()), Duration::ZERO)
            .on_failure(move |e| {
                let _ = tx.send(e.errno);
            });
        timers.submit_delayed(delayed)?;

        ensure_eq!(rx.recv_timeout(Duration::from_secs(5))?, libc::ECANCELED);
        Ok(())
    }

    #[test]
    fn periodic_timer_ticks_until_cancelled() -> Result<()> {
        let scheduler: Arc<Scheduler> = Arc::new(Scheduler::new(1)?);
        let timers: TimerService = TimerService::new(1)?;
        let (tx, rx): (Sender<()>, Receiver<()>) = crossbeam_channel::unbounded();

        let factory_scheduler: Arc<Scheduler> = scheduler.clone();
        let handle = timers.submit_delayed(DelayedTask::periodic(
            Arc::new(move || {
                let tx: Sender<()> = tx.clone();
                factory_scheduler.task("tick", move || {
                    let _ = tx.send(());
                })
            }),
            Duration::from_millis(20),
        ))?;

        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5))?;
        }
        handle.cancel();
        std::thread::sleep(Duration::from_millis(50));
        while rx.try_recv().is_ok() {}
        ensure_eq!(
            rx.recv_timeout(Duration::from_millis(100)),
            Err(RecvTimeoutError::Timeout)
        );
        Ok(())
    }

    #[test]
    fn command_flood_does_not_hold_back_deadlines() -> Result<()> {
        let scheduler: Scheduler = Scheduler::new(1)?;
        let timers: Arc<TimerService> = Arc::new(TimerService::new(1)?);
        let (tx, rx): (Sender<Instant>, Receiver<Instant>) = crossbeam_channel::unbounded();

        let start: Instant = Instant::now();
        timers.schedule(
            scheduler.task("short", move || {
                let _ = tx.send(Instant::now());
            }),
            Duration::from_millis(10),
        )?;

        let stop: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
        let mut flooders: Vec<JoinHandle<()>> = Vec::new();
        for _ in 0..3 {
            let timers: Arc<TimerService> = timers.clone();
            let stop: Arc<AtomicBool> = stop.clone();
            let queue: Arc<TaskQueue> = scheduler.queue().clone();
            flooders.push(std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let task: Task = Task::new("long", queue.clone(), || ());
                    if let Ok(handle) = timers.schedule(task, Duration::from_secs(3600)) {
                        handle.cancel();
                    }
                }
            }));
        }

        let fired: Result<Instant, RecvTimeoutError> = rx.recv_timeout(Duration::from_secs(1));
        stop.store(true, Ordering::Relaxed);
        for flooder in flooders {
            let _ = flooder.join();
        }
        let fired: Instant = fired?;
        anyhow::ensure!(fired.duration_since(start) < Duration::from_secs(1));
        Ok(())
    }

    #[test]
    fn zero_period_is_rejected() -> Result<()> {
        let scheduler: Arc<Scheduler> = Arc::new(Scheduler::new(1)?);
        let timers: TimerService = TimerService::new(1)?;
        let (tx, rx): (Sender<()>, Receiver<()>) = crossbeam_channel::unbounded();

        let factory_scheduler: Arc<Scheduler> = scheduler.clone();
        let result = timers.submit_delayed(DelayedTask::periodic(
            Arc::new(move || factory_scheduler.task("spin", || ())),
            Duration::ZERO,
        ));
        ensure_eq!(result.map(|_| ()).map_err(|e| e.errno), Err(libc::EINVAL));

        timers.schedule(
            scheduler.task("after", move || {
                let _ = tx.send(());
            }),
            Duration::from_millis(10),
        )?;
        rx.recv_timeout(Duration::from_secs(5))?;
        Ok(())
    }
}
