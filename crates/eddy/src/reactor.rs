use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, VecDeque},
    io,
    os::fd::RawFd,
    rc::Rc,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, ThreadId},
};

use eddy_timing::{Duration, Instant};
use serde::Deserialize;
use tracing::{debug, error};

use crate::{
    error::ReactorError,
    poller::{Backend, Condition, Interest, Poller, make_poller},
    timer::{self, TimerAction, TimerHandle, TimerQueue},
};

/// Tuning for one reactor instance.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    pub backend: Backend,
    /// Cap on a single multiplex sleep, so the loop revisits timers even
    /// under clock skew. Also bounds how stale a cross-thread `stop` can go
    /// unnoticed without a performer wake.
    pub max_sleep: Duration,
    /// Floor on the multiplex sleep.
    pub min_sleep: Duration,
    /// Readiness events consumed per cycle (epoll flavor).
    pub event_batch: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            max_sleep: Duration::from_secs(5),
            min_sleep: Duration::ZERO,
            event_batch: 64,
        }
    }
}

pub(crate) struct ReactorShared {
    stop: AtomicBool,
    running_thread: Mutex<Option<ThreadId>>,
}

impl ReactorShared {
    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    pub(crate) fn is_running_on_this_thread(&self) -> bool {
        *self.lock_running() == Some(thread::current().id())
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<ThreadId>> {
        self.running_thread.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cross-thread stop handle for a [`Reactor`].
///
/// Setting the flag does not wake a sleeping multiplex call; pair it with a
/// [`Performer`](crate::Performer) wake when the stop must be prompt.
#[derive(Clone)]
pub struct Stopper {
    shared: Arc<ReactorShared>,
}

impl Stopper {
    pub fn stop(&self) {
        self.shared.request_stop();
    }
}

type FdAction = Box<dyn FnMut()>;

#[derive(Default)]
struct Slot {
    armed: bool,
    generation: u64,
    action: Option<FdAction>,
}

#[derive(Default)]
struct FdEntry {
    read: Slot,
    write: Slot,
    except: Slot,
}

impl FdEntry {
    fn slot_mut(&mut self, cond: Condition) -> &mut Slot {
        match cond {
            Condition::Readable => &mut self.read,
            Condition::Writable => &mut self.write,
            Condition::Exception => &mut self.except,
        }
    }

    fn interest(&self) -> Interest {
        let mut out = Interest::empty();
        if self.read.armed {
            out |= Interest::READABLE;
        }
        if self.write.armed {
            out |= Interest::WRITABLE;
        }
        if self.except.armed {
            out |= Interest::EXCEPTION;
        }
        out
    }
}

struct Inner {
    poller: Box<dyn Poller>,
    fds: BTreeMap<RawFd, FdEntry>,
    deferred: VecDeque<Box<dyn FnOnce()>>,
    on_every_cycle: Option<Box<dyn FnMut()>>,
    next_gen: u64,
}

/// Single-threaded event loop: multiplexes fd readiness, fires due timers,
/// and drains deferred tasks, one cycle at a time.
///
/// Cycle order: cache now → multiplex (the only blocking point) → ready fd
/// actions (read before write before exception per fd) → deferred tasks
/// (snapshot; new ones run next cycle) → due timers → end-of-cycle hook.
///
/// Handles are cheap clones sharing one loop. All of them, and everything
/// registered with them, live on the reactor's thread; cross-thread entry
/// points are [`Stopper`] and [`Performer`](crate::Performer).
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<RefCell<Inner>>,
    timers: Rc<RefCell<TimerQueue>>,
    now_cache: Rc<Cell<Instant>>,
    config: ReactorConfig,
    shared: Arc<ReactorShared>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Self::with_config(ReactorConfig::default())
    }

    pub fn with_config(config: ReactorConfig) -> io::Result<Self> {
        let poller = make_poller(config.backend, config.event_batch)?;
        Ok(Self {
            inner: Rc::new(RefCell::new(Inner {
                poller,
                fds: BTreeMap::new(),
                deferred: VecDeque::new(),
                on_every_cycle: None,
                next_gen: 0,
            })),
            timers: Rc::new(RefCell::new(TimerQueue::new())),
            now_cache: Rc::new(Cell::new(Instant::now())),
            config,
            shared: Arc::new(ReactorShared {
                stop: AtomicBool::new(false),
                running_thread: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &ReactorConfig {
        &self.config
    }

    /// Ends the current `run` at the end of its cycle. Safe from any thread
    /// via [`Stopper`]; from foreign threads the loop notices at its next
    /// wake-up (bounded by `max_sleep`).
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    pub fn stopper(&self) -> Stopper {
        Stopper { shared: self.shared.clone() }
    }

    pub fn is_running_on_this_thread(&self) -> bool {
        self.shared.is_running_on_this_thread()
    }

    pub(crate) fn shared(&self) -> &Arc<ReactorShared> {
        &self.shared
    }

    /// Timestamp cached at the top of the current cycle. Outside a running
    /// cycle this takes (and caches) a fresh sample.
    pub fn now(&self) -> Instant {
        if self.shared.is_running() {
            self.now_cache.get()
        } else {
            let now = Instant::now();
            self.now_cache.set(now);
            now
        }
    }

    pub fn now_uncached(&self) -> Instant {
        Instant::now()
    }

    /// Schedule a timer at an absolute deadline. `interval` of zero means
    /// one-shot; `catchup` picks the recurrence policy for late firings
    /// (realign to the next future phase vs. advance one interval).
    pub fn schedule(
        &self,
        deadline: Instant,
        interval: Duration,
        catchup: bool,
        action: impl FnMut(Instant) + 'static,
    ) -> TimerHandle {
        let boxed: TimerAction = Box::new(action);
        let state = self.timers.borrow_mut().schedule(deadline, interval, catchup, boxed);
        TimerHandle::new(state, Rc::downgrade(&self.timers))
    }

    /// Schedule relative to now.
    pub fn schedule_in(
        &self,
        delta: Duration,
        interval: Duration,
        catchup: bool,
        action: impl FnMut(Instant) + 'static,
    ) -> TimerHandle {
        self.schedule(self.now() + delta, interval, catchup, action)
    }

    /// Enqueue a task for the next cycle. FIFO within one thread; tasks
    /// queued while the deferred batch runs go to the cycle after.
    pub fn do_later(&self, task: impl FnOnce() + 'static) {
        self.inner.borrow_mut().deferred.push_back(Box::new(task));
    }

    pub fn set_on_every_cycle(&self, hook: impl FnMut() + 'static) {
        self.inner.borrow_mut().on_every_cycle = Some(Box::new(hook));
    }

    pub fn clear_on_every_cycle(&self) {
        self.inner.borrow_mut().on_every_cycle = None;
    }

    /// Bind `action` to `(fd, condition)`. Re-registering the pair replaces
    /// the action atomically. The fd stays owned by the caller; the reactor
    /// never closes it.
    pub fn register_descriptor(
        &self,
        fd: RawFd,
        condition: Condition,
        action: impl FnMut() + 'static,
    ) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        inner.next_gen += 1;
        let generation = inner.next_gen;
        let entry = inner.fds.entry(fd).or_default();
        let slot = entry.slot_mut(condition);
        slot.armed = true;
        slot.generation = generation;
        slot.action = Some(Box::new(action));
        inner.poller.arm(fd, entry.interest())
    }

    /// Drop the action bound to `(fd, condition)`. No-op if absent; safe
    /// from inside the action itself (the pair is skipped for the rest of
    /// the cycle).
    pub fn unregister_descriptor(&self, fd: RawFd, condition: Condition) {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let Some(entry) = inner.fds.get_mut(&fd) else { return };
        let slot = entry.slot_mut(condition);
        if !slot.armed {
            return;
        }
        slot.armed = false;
        slot.action = None;
        let interest = entry.interest();
        let result = if interest.is_empty() {
            inner.fds.remove(&fd);
            inner.poller.disarm(fd)
        } else {
            inner.poller.arm(fd, interest)
        };
        if let Err(err) = result {
            debug!(fd, ?err, "backend update on unregister failed");
        }
    }

    /// Drop every action bound to `fd`.
    pub fn unregister_fd(&self, fd: RawFd) {
        for condition in Condition::DISPATCH_ORDER {
            self.unregister_descriptor(fd, condition);
        }
    }

    /// Run until [`stop`](Self::stop) is requested. A previous stop request
    /// is cleared on entry.
    pub fn run(&self) -> Result<(), ReactorError> {
        self.run_inner(None)
    }

    /// Run until stopped or `max_duration` has elapsed.
    pub fn run_for(&self, max_duration: Duration) -> Result<(), ReactorError> {
        self.run_inner(Some(max_duration))
    }

    fn run_inner(&self, max_duration: Option<Duration>) -> Result<(), ReactorError> {
        {
            let mut running =
                self.shared.running_thread.lock().unwrap_or_else(PoisonError::into_inner);
            if running.is_some() {
                return Err(ReactorError::AlreadyRunning);
            }
            *running = Some(thread::current().id());
        }
        self.shared.stop.store(false, Ordering::Release);

        let result = self.cycle_loop(max_duration);

        *self.shared.running_thread.lock().unwrap_or_else(PoisonError::into_inner) = None;
        result
    }

    fn cycle_loop(&self, max_duration: Option<Duration>) -> Result<(), ReactorError> {
        let end = max_duration.map(|d| Instant::now() + d);
        let mut ready: Vec<(RawFd, Interest)> = Vec::new();

        loop {
            let now = Instant::now();
            self.now_cache.set(now);

            let mut sleep = self.config.max_sleep;
            if let Some(deadline) = self.timers.borrow().next_deadline() {
                sleep = sleep.min(deadline.saturating_since(now));
            }
            if let Some(end) = end {
                sleep = sleep.min(end.saturating_since(now));
            }
            if !self.inner.borrow().deferred.is_empty() {
                sleep = Duration::ZERO;
            }
            sleep = sleep.max(self.config.min_sleep).clamp_non_negative();

            ready.clear();
            let polled = self.inner.borrow_mut().poller.poll(&mut ready, sleep.into());
            if let Err(err) = polled {
                error!(?err, "multiplex call failed, clearing registrations");
                self.clear_registrations();
                return Err(ReactorError::Multiplex(err));
            }

            for &(fd, hits) in &ready {
                for condition in Condition::DISPATCH_ORDER {
                    if hits.contains(condition.bit()) {
                        self.dispatch(fd, condition);
                    }
                }
            }

            // Snapshot so tasks queued by this batch run next cycle.
            let deferred = std::mem::take(&mut self.inner.borrow_mut().deferred);
            for task in deferred {
                task();
            }

            timer::fire_due(&self.timers, now);

            self.run_cycle_hook();

            if self.shared.stop.load(Ordering::Acquire) {
                return Ok(());
            }
            if let Some(end) = end
                && Instant::now() >= end
            {
                return Ok(());
            }
        }
    }

    fn dispatch(&self, fd: RawFd, condition: Condition) {
        let taken = {
            let mut inner = self.inner.borrow_mut();
            let Some(entry) = inner.fds.get_mut(&fd) else { return };
            let slot = entry.slot_mut(condition);
            if !slot.armed {
                return;
            }
            slot.action.take().map(|action| (action, slot.generation))
        };
        let Some((mut action, generation)) = taken else { return };

        action();

        // Restore only if the slot wasn't unregistered or replaced meanwhile.
        let mut inner = self.inner.borrow_mut();
        if let Some(entry) = inner.fds.get_mut(&fd) {
            let slot = entry.slot_mut(condition);
            if slot.armed && slot.generation == generation && slot.action.is_none() {
                slot.action = Some(action);
            }
        }
    }

    fn run_cycle_hook(&self) {
        let hook = self.inner.borrow_mut().on_every_cycle.take();
        if let Some(mut hook) = hook {
            hook();
            let mut inner = self.inner.borrow_mut();
            if inner.on_every_cycle.is_none() {
                inner.on_every_cycle = Some(hook);
            }
        }
    }

    fn clear_registrations(&self) {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        for (&fd, _) in &inner.fds {
            if let Err(err) = inner.poller.disarm(fd) {
                debug!(fd, ?err, "disarm during teardown failed");
            }
        }
        inner.fds.clear();
    }
}
