//! The event loop: tick pipeline, wake-up discipline, dispatch modes,
//! submission contracts, and the shutdown drain.
//!
//! One thread (the loop thread, established by `run`) executes every task,
//! timer callback, microtask, and FD callback. Producers on any thread feed
//! the ingress queues and rings, then ring the doorbell for the dispatch
//! mode currently active: a self-deduplicating channel token on the fast
//! path, a wake-pipe write on the poller path.

use std::os::fd::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Once, RwLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant, SystemTime};

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use tracing::{debug, error, warn};

use vloop_sync::{FastState, IngressQueue, Job, LoopState, MicrotaskRing, INGRESS_BATCH_MAX};

use crate::error::{LoopError, PollError, Reason};
use crate::metrics::{MetricsSnapshot, MetricsState};
use crate::options::{
    overload_error, FastPathMode, Options, OverloadCallback, RejectionCallback,
};
use crate::poller::{IoCallback, IoEvents, Poller};
use crate::registry::{Registry, Tracked};
use crate::timer::{clamp_delay, TimerId, TimerNode, TimerTable, MAX_TIMER_ID};
use crate::wake::WakePipe;

/// External tasks executed per tick before the overload callback fires.
const EXTERNAL_TICK_BUDGET: usize = 1024;

/// Microtasks per drain invocation; exhaustion self-signals the loop.
const MICROTASK_DRAIN_BUDGET: usize = 1024;

/// Settled registry entries swept per tick.
const SCAVENGE_QUANTUM: usize = 20;

/// Consecutive empty observations that end the shutdown drain.
const SHUTDOWN_EMPTY_PASSES: usize = 3;

/// Bounded wait for offloaded work before the shutdown drain proceeds.
const OFFLOAD_DRAIN_WAIT: Duration = Duration::from_millis(100);

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Wall/monotonic clock pair anchoring `current_tick_time`.
struct TickAnchor {
    wall: SystemTime,
    mono: Instant,
}

impl TickAnchor {
    fn now() -> Self {
        Self {
            wall: SystemTime::now(),
            mono: Instant::now(),
        }
    }
}

/// In-flight counter for offloaded work the shutdown drain waits on.
struct Flights {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Flights {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    fn begin(&self) {
        *self.count.lock().unwrap_or_else(|e| e.into_inner()) += 1;
    }

    fn end(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        while *count > 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            let (guard, _) = self
                .idle
                .wait_timeout(count, left)
                .unwrap_or_else(|e| e.into_inner());
            count = guard;
        }
        true
    }
}

/// RAII token for work whose completion task the shutdown drain should
/// wait for (bounded). Dropped when the work lands.
pub struct WorkGuard {
    inner: Arc<Inner>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.inner.flights.end();
    }
}

/// Loop-thread-local scratch reused across ticks; the batch buffer gives
/// one lock acquisition per ingress batch with zero steady-state
/// allocation.
struct TickState {
    batch: Vec<Job>,
}

pub(crate) struct Inner {
    state: FastState,
    external: IngressQueue,
    internal: IngressQueue,
    microtasks: MicrotaskRing,
    next_tick: MicrotaskRing,
    timers: Mutex<TimerTable>,
    timer_generation: AtomicU64,
    registry: Registry,
    rejections: DashMap<u64, Reason>,
    fast_wake_tx: Sender<()>,
    fast_wake_rx: Receiver<()>,
    wake_pipe: Mutex<Option<WakePipe>>,
    wake_pending: AtomicBool,
    poller: Option<Box<dyn Poller>>,
    user_fd_count: AtomicUsize,
    fast_mode: AtomicU8,
    next_timer_id: AtomicU64,
    nesting_depth: AtomicU32,
    anchor: RwLock<TickAnchor>,
    tick_elapsed_nanos: AtomicU64,
    loop_thread: Mutex<Option<ThreadId>>,
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
    close_once: Once,
    flights: Flights,
    strict_ordering: bool,
    on_overload: Option<OverloadCallback>,
    on_unhandled_rejection: Option<RejectionCallback>,
    metrics: Option<MetricsState>,
}

impl Inner {
    fn fast_mode(&self) -> FastPathMode {
        FastPathMode::from_word(self.fast_mode.load(Ordering::Acquire))
    }

    fn poll_path_active(&self) -> bool {
        if self.poller.is_none() {
            return false;
        }
        match self.fast_mode() {
            FastPathMode::Forced => false,
            FastPathMode::Disabled => true,
            FastPathMode::Auto => self.user_fd_count.load(Ordering::Acquire) > 0,
        }
    }

    fn fast_path_active(&self) -> bool {
        !self.poll_path_active()
    }

    fn is_loop_thread(&self) -> bool {
        matches!(
            *self.loop_thread.lock().unwrap_or_else(|e| e.into_inner()),
            Some(id) if id == thread::current().id()
        )
    }

    fn signal_fast(&self) {
        // Capacity-1 channel: a full buffer means a wake-up is already
        // pending, so losing the send is the deduplication working.
        let _ = self.fast_wake_tx.try_send(());
    }

    fn signal_pipe(&self) {
        if self
            .wake_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            match &*self.wake_pipe.lock().unwrap_or_else(|e| e.into_inner()) {
                Some(pipe) => pipe.signal(),
                None => self.wake_pending.store(false, Ordering::Release),
            }
        }
    }

    /// Signal both wake paths; covers whichever side the loop is blocked on
    /// during a mode transition.
    fn do_wakeup(&self) {
        self.signal_fast();
        if self.poller.is_some() {
            self.signal_pipe();
        }
    }

    /// Cheapest signal for the currently active dispatch mode.
    fn wake_for_submission(&self) {
        if self.poll_path_active() {
            self.signal_pipe();
        } else {
            self.signal_fast();
        }
    }

    fn drain_wake_pipe(&self) {
        if let Some(pipe) = &*self.wake_pipe.lock().unwrap_or_else(|e| e.into_inner()) {
            pipe.drain();
        }
        self.wake_pending.store(false, Ordering::Release);
    }

    fn run_task(&self, job: Job) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            error!(panic = %panic_message(&*payload), "callback panicked; loop continues");
        }
    }

    /// Pop next-tick entries, then regular microtasks, up to the drain
    /// budget. Exhausting the budget with work remaining self-signals so
    /// the loop runs again without sleeping.
    fn drain_microtasks(&self) -> usize {
        let mut ran = 0;
        while ran < MICROTASK_DRAIN_BUDGET {
            let job = match self.next_tick.pop() {
                Some(job) => job,
                None => match self.microtasks.pop() {
                    Some(job) => job,
                    None => break,
                },
            };
            self.run_task(job);
            ran += 1;
        }
        if !self.next_tick.is_empty() || !self.microtasks.is_empty() {
            self.do_wakeup();
        }
        ran
    }

    fn flush_unhandled_rejections(&self) {
        if self.rejections.is_empty() {
            return;
        }
        let keys: Vec<u64> = self.rejections.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            let Some((_, reason)) = self.rejections.remove(&key) else {
                continue;
            };
            match &self.on_unhandled_rejection {
                Some(callback) => {
                    let result = catch_unwind(AssertUnwindSafe(|| callback(reason.clone())));
                    if let Err(payload) = result {
                        warn!(
                            panic = %panic_message(&*payload),
                            "unhandled-rejection callback panicked"
                        );
                    }
                }
                None => warn!(reason = %reason, "unhandled promise rejection"),
            }
        }
    }

    fn work_pending(&self) -> bool {
        !self.microtasks.is_empty()
            || !self.next_tick.is_empty()
            || !self.internal.is_empty()
            || !self.external.is_empty()
    }

    fn next_block_timeout(&self) -> Option<Duration> {
        if self.work_pending() {
            return Some(Duration::ZERO);
        }
        let table = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        table
            .heap
            .peek_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn block_on_channel(&self, timeout: Option<Duration>) {
        match timeout {
            Some(d) if d.is_zero() => {
                while self.fast_wake_rx.try_recv().is_ok() {}
            }
            Some(d) => {
                let _ = self.fast_wake_rx.recv_timeout(d);
            }
            // A sender lives in this struct, so recv blocks until a token
            // arrives; it cannot observe disconnection.
            None => {
                let _ = self.fast_wake_rx.recv();
            }
        }
    }

    fn block_on_poller(&self, timeout: Option<Duration>) -> Result<(), PollError> {
        let Some(poller) = self.poller.as_ref() else {
            return Ok(());
        };
        let timeout_ms = match timeout {
            Some(d) if d.is_zero() => 0,
            // Round sub-millisecond waits up so a near timer does not
            // degrade into a busy spin.
            Some(d) => i32::try_from(d.as_millis()).unwrap_or(i32::MAX).max(1),
            None => -1,
        };
        poller.poll_io(timeout_ms)?;
        // Tokens sent to the fast channel during a mode transition would
        // otherwise cause one spurious wake per token later.
        while self.fast_wake_rx.try_recv().is_ok() {}
        Ok(())
    }

    fn alloc_timer_id(&self) -> Result<TimerId, LoopError> {
        let id = self.next_timer_id.fetch_add(1, Ordering::AcqRel);
        if id > MAX_TIMER_ID {
            return Err(LoopError::TimerIdExhausted);
        }
        Ok(id)
    }

    fn mono_secs(&self) -> u64 {
        let anchor = self.anchor.read().unwrap_or_else(|e| e.into_inner());
        anchor.mono.elapsed().as_secs()
    }

    fn close_resources(&self) {
        self.close_once.call_once(|| {
            let pipe = self
                .wake_pipe
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(poller) = &self.poller {
                if let Some(pipe) = &pipe {
                    let _ = poller.unregister_fd(pipe.read_fd());
                }
                if let Err(e) = poller.close() {
                    debug!(error = %e, "poller close failed");
                }
            }
            // Dropping the pipe closes both descriptors.
            drop(pipe);
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.close_resources();
    }
}

/// Single-consumer event loop handle. Cheap to clone; all clones share one
/// loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<Inner>,
}

impl EventLoop {
    pub fn new(options: Options) -> Result<Self, LoopError> {
        let Options {
            strict_microtask_ordering,
            fast_path_mode,
            metrics,
            poller,
            on_overload,
            on_unhandled_rejection,
        } = options;

        let wake_pipe = match &poller {
            Some(poller) => {
                poller.init()?;
                Some(WakePipe::new().map_err(PollError::Io)?)
            }
            None => None,
        };
        let wake_read_fd = wake_pipe.as_ref().map(WakePipe::read_fd);

        let (fast_wake_tx, fast_wake_rx) = bounded(1);
        let (done_tx, done_rx) = bounded::<()>(1);

        let inner = Arc::new(Inner {
            state: FastState::new(LoopState::Awake),
            external: IngressQueue::new(),
            internal: IngressQueue::new(),
            microtasks: MicrotaskRing::new(),
            next_tick: MicrotaskRing::new(),
            timers: Mutex::new(TimerTable::new()),
            timer_generation: AtomicU64::new(0),
            registry: Registry::new(),
            rejections: DashMap::new(),
            fast_wake_tx,
            fast_wake_rx,
            wake_pipe: Mutex::new(wake_pipe),
            wake_pending: AtomicBool::new(false),
            poller,
            user_fd_count: AtomicUsize::new(0),
            fast_mode: AtomicU8::new(fast_path_mode as u8),
            next_timer_id: AtomicU64::new(1),
            nesting_depth: AtomicU32::new(0),
            anchor: RwLock::new(TickAnchor::now()),
            tick_elapsed_nanos: AtomicU64::new(0),
            loop_thread: Mutex::new(None),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
            close_once: Once::new(),
            flights: Flights::new(),
            strict_ordering: strict_microtask_ordering,
            on_overload,
            on_unhandled_rejection,
            metrics: metrics.then(MetricsState::new),
        });

        // The wake pipe is an internal descriptor: registered directly with
        // the poller, never counted in user_fd_count.
        if let (Some(poller), Some(fd)) = (inner.poller.as_ref(), wake_read_fd) {
            let weak = Arc::downgrade(&inner);
            let callback: IoCallback = Arc::new(move |_events| {
                if let Some(inner) = weak.upgrade() {
                    inner.drain_wake_pipe();
                }
            });
            poller.register_fd(fd, IoEvents::READABLE, callback)?;
        }

        Ok(Self { inner })
    }

    /// Run the loop on the calling thread until shutdown.
    pub fn run(&self) -> Result<(), LoopError> {
        self.run_inner(None)
    }

    /// Run until shutdown or until `cancel` yields/disconnects. A canceled
    /// run performs the full shutdown drain before returning the error.
    pub fn run_with_cancel(&self, cancel: Receiver<()>) -> Result<(), LoopError> {
        self.run_inner(Some(cancel))
    }

    fn run_inner(&self, cancel: Option<Receiver<()>>) -> Result<(), LoopError> {
        let inner = &self.inner;

        if inner.is_loop_thread() {
            return Err(LoopError::ReentrantRun);
        }
        match inner.state.load() {
            LoopState::Awake => {
                if !inner
                    .state
                    .try_transition(LoopState::Awake, LoopState::Running)
                {
                    return match inner.state.load() {
                        LoopState::Terminating | LoopState::Terminated => {
                            Err(LoopError::Terminated)
                        }
                        _ => Err(LoopError::AlreadyRunning),
                    };
                }
            }
            LoopState::Running | LoopState::Sleeping => return Err(LoopError::AlreadyRunning),
            LoopState::Terminating | LoopState::Terminated => return Err(LoopError::Terminated),
        }

        *inner.loop_thread.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(thread::current().id());
        {
            let mut anchor = inner.anchor.write().unwrap_or_else(|e| e.into_inner());
            *anchor = TickAnchor::now();
        }
        inner.tick_elapsed_nanos.store(0, Ordering::Release);
        debug!("event loop running");

        let canceled = Arc::new(AtomicBool::new(false));
        let watcher = cancel.map(|rx| {
            let inner = self.inner.clone();
            let flag = canceled.clone();
            let done = inner.done_rx.clone();
            thread::spawn(move || {
                select! {
                    recv(rx) -> _ => {
                        flag.store(true, Ordering::Release);
                        let _ = inner.state.try_transition(LoopState::Running, LoopState::Terminating)
                            || inner.state.try_transition(LoopState::Sleeping, LoopState::Terminating);
                        inner.do_wakeup();
                    }
                    recv(done) -> _ => {}
                }
            })
        });

        let mut ts = TickState {
            batch: Vec::with_capacity(INGRESS_BATCH_MAX),
        };
        let mut result = Ok(());
        while inner.state.load() < LoopState::Terminating {
            if let Err(e) = self.tick(&mut ts) {
                error!(error = %e, "fatal poller failure; terminating loop");
                let _ = inner
                    .state
                    .try_transition(LoopState::Running, LoopState::Terminating);
                result = Err(e);
                break;
            }
        }

        self.shutdown_drain(&mut ts);

        // Disconnecting done_rx releases shutdown waiters and the watcher.
        inner
            .done_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(watcher) = watcher {
            let _ = watcher.join();
        }
        *inner.loop_thread.lock().unwrap_or_else(|e| e.into_inner()) = None;

        if result.is_ok() && canceled.load(Ordering::Acquire) {
            result = Err(LoopError::Canceled);
        }
        debug!("event loop exited");
        result
    }

    fn tick(&self, ts: &mut TickState) -> Result<(), LoopError> {
        let inner = &self.inner;
        let tick_start = Instant::now();
        {
            let anchor = inner.anchor.read().unwrap_or_else(|e| e.into_inner());
            let elapsed = tick_start.saturating_duration_since(anchor.mono);
            inner
                .tick_elapsed_nanos
                .store(elapsed.as_nanos() as u64, Ordering::Release);
        }

        let mut executed: u64 = 0;

        // Residue from a pass interrupted by a mode transition.
        for job in ts.batch.drain(..) {
            inner.run_task(job);
            executed += 1;
        }

        executed += self.fire_due_timers(tick_start);

        // Internal (priority) queue drains fully.
        let mut ran_internal: u64 = 0;
        loop {
            let n = inner.internal.pop_batch(&mut ts.batch, INGRESS_BATCH_MAX);
            if n == 0 {
                break;
            }
            for job in ts.batch.drain(..) {
                inner.run_task(job);
                ran_internal += 1;
                if inner.strict_ordering {
                    inner.drain_microtasks();
                }
            }
        }
        if ran_internal > 0 && !inner.strict_ordering {
            inner.drain_microtasks();
        }
        executed += ran_internal;

        // External queue drains up to the tick budget.
        let mut budget = EXTERNAL_TICK_BUDGET;
        let mut ran_external: u64 = 0;
        while budget > 0 {
            let n = inner
                .external
                .pop_batch(&mut ts.batch, INGRESS_BATCH_MAX.min(budget));
            if n == 0 {
                break;
            }
            budget -= n;
            for job in ts.batch.drain(..) {
                inner.run_task(job);
                ran_external += 1;
                if inner.strict_ordering {
                    inner.drain_microtasks();
                }
            }
        }
        if budget == 0 {
            let backlog = inner.external.len();
            if backlog > 0 {
                inner.do_wakeup();
                if let Some(callback) = &inner.on_overload {
                    let err = overload_error(backlog);
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(&err))) {
                        warn!(
                            panic = %panic_message(&*payload),
                            "overload callback panicked"
                        );
                    }
                }
            }
        }
        if ran_external > 0 && !inner.strict_ordering {
            inner.drain_microtasks();
        }
        executed += ran_external;

        executed += inner.drain_microtasks() as u64;

        let busy = tick_start.elapsed();
        self.poll_phase()?;

        executed += inner.drain_microtasks() as u64;

        inner.registry.scavenge(SCAVENGE_QUANTUM);
        inner.flush_unhandled_rejections();

        if let Some(metrics) = &inner.metrics {
            metrics.record_tick(
                busy,
                executed,
                inner.mono_secs(),
                inner.external.len(),
                inner.internal.len(),
                inner.microtasks.len(),
            );
        }
        Ok(())
    }

    fn fire_due_timers(&self, tick_now: Instant) -> u64 {
        let inner = &self.inner;
        let mut fired: u64 = 0;
        loop {
            // One pop per lock hold so callbacks can schedule and cancel
            // without contention.
            let node = {
                let mut table = inner.timers.lock().unwrap_or_else(|e| e.into_inner());
                table.heap.pop_due(tick_now)
            };
            let Some(node) = node else { break };
            if node.canceled {
                continue;
            }
            let Some(callback) = node.callback else {
                continue;
            };
            inner.nesting_depth.store(node.nesting, Ordering::Release);
            inner.run_task(callback);
            inner.nesting_depth.store(0, Ordering::Release);
            fired += 1;
            if inner.strict_ordering {
                inner.drain_microtasks();
            }
        }
        fired
    }

    fn poll_phase(&self) -> Result<(), LoopError> {
        let inner = &self.inner;
        let timeout = inner.next_block_timeout();
        if !inner
            .state
            .try_transition(LoopState::Running, LoopState::Sleeping)
        {
            // Shutdown won the state word; skip the block entirely.
            return Ok(());
        }
        let result = if inner.poll_path_active() {
            inner.block_on_poller(timeout)
        } else {
            inner.block_on_channel(timeout);
            Ok(())
        };
        // Losing this CAS means shutdown moved us to Terminating already.
        let _ = inner
            .state
            .try_transition(LoopState::Sleeping, LoopState::Running);
        result.map_err(LoopError::from)
    }

    fn shutdown_drain(&self, ts: &mut TickState) {
        let inner = &self.inner;
        debug!("shutdown drain started");

        if !inner.flights.wait_idle(OFFLOAD_DRAIN_WAIT) {
            warn!("offloaded work still in flight at shutdown; proceeding");
        }

        // Store Terminated while holding both ingress locks: a submission
        // gate that observed an earlier state has already pushed and will
        // be drained below; any later gate observes Terminated and
        // rejects. No accepted task can be lost.
        {
            let _external = inner.external.lock();
            let _internal = inner.internal.lock();
            inner.state.store(LoopState::Terminated);
        }

        let mut empty_passes = 0;
        while empty_passes < SHUTDOWN_EMPTY_PASSES {
            let mut drained = 0usize;
            loop {
                let n = inner.internal.pop_batch(&mut ts.batch, INGRESS_BATCH_MAX);
                if n == 0 {
                    break;
                }
                drained += n;
                for job in ts.batch.drain(..) {
                    inner.run_task(job);
                }
            }
            loop {
                let n = inner.external.pop_batch(&mut ts.batch, INGRESS_BATCH_MAX);
                if n == 0 {
                    break;
                }
                drained += n;
                for job in ts.batch.drain(..) {
                    inner.run_task(job);
                }
            }
            loop {
                let job = match inner.next_tick.pop() {
                    Some(job) => job,
                    None => match inner.microtasks.pop() {
                        Some(job) => job,
                        None => break,
                    },
                };
                inner.run_task(job);
                drained += 1;
            }
            if drained == 0 {
                empty_passes += 1;
                thread::yield_now();
            } else {
                empty_passes = 0;
            }
        }

        inner.registry.reject_all(LoopError::termination_reason());
        inner.flush_unhandled_rejections();
        inner.close_resources();
        debug!("shutdown drain finished");
    }

    fn request_shutdown(&self) {
        let inner = &self.inner;
        loop {
            match inner.state.load() {
                LoopState::Awake => {
                    if inner
                        .state
                        .try_transition(LoopState::Awake, LoopState::Terminating)
                    {
                        // Never ran: finalize inline on the caller. The
                        // Terminated store comes first so rejection
                        // handlers deliver inline instead of into a
                        // microtask drain that will never happen.
                        inner.state.store(LoopState::Terminated);
                        inner.registry.reject_all(LoopError::termination_reason());
                        inner.flush_unhandled_rejections();
                        inner.close_resources();
                        inner
                            .done_tx
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .take();
                        return;
                    }
                }
                LoopState::Running => {
                    if inner
                        .state
                        .try_transition(LoopState::Running, LoopState::Terminating)
                    {
                        inner.do_wakeup();
                        return;
                    }
                }
                LoopState::Sleeping => {
                    if inner
                        .state
                        .try_transition(LoopState::Sleeping, LoopState::Terminating)
                    {
                        inner.do_wakeup();
                        return;
                    }
                }
                LoopState::Terminating | LoopState::Terminated => return,
            }
        }
    }

    /// Request shutdown and wait for the loop to exit. `None` waits
    /// without bound. A deadline expiry returns [`LoopError::ShutdownTimedOut`]
    /// but does not abort the loop's own drain.
    pub fn shutdown(&self, timeout: Option<Duration>) -> Result<(), LoopError> {
        let inner = &self.inner;
        if inner.state.load() == LoopState::Terminated {
            return Err(LoopError::Terminated);
        }
        self.request_shutdown();
        if inner.is_loop_thread() {
            // Called from inside a callback; the drain follows this tick.
            return Ok(());
        }
        let rx = inner.done_rx.clone();
        match timeout {
            Some(deadline) => match rx.recv_timeout(deadline) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => Ok(()),
                Err(RecvTimeoutError::Timeout) => Err(LoopError::ShutdownTimedOut),
            },
            None => {
                let _ = rx.recv();
                Ok(())
            }
        }
    }

    /// Request shutdown without waiting for the drain.
    pub fn close(&self) -> Result<(), LoopError> {
        if self.inner.state.load() == LoopState::Terminated {
            return Err(LoopError::Terminated);
        }
        self.request_shutdown();
        Ok(())
    }

    /// Enqueue a task on the external queue. The state gate and the push
    /// are one critical section under the queue mutex, so an accepted task
    /// is always observed by the shutdown drain.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> Result<(), LoopError> {
        let inner = &self.inner;
        {
            let mut queue = inner.external.lock();
            if inner.state.load() == LoopState::Terminated {
                return Err(LoopError::Terminated);
            }
            queue.push(Box::new(task));
        }
        inner.wake_for_submission();
        Ok(())
    }

    /// Enqueue a task on the internal (priority) queue. On the loop thread
    /// with the fast path active and an empty external queue, the task
    /// runs inline instead.
    pub fn submit_internal(&self, task: impl FnOnce() + Send + 'static) -> Result<(), LoopError> {
        let inner = &self.inner;
        if inner.is_loop_thread()
            && inner.fast_path_active()
            && inner.external.is_empty()
            && inner.state.load() != LoopState::Terminated
        {
            let generation = inner.timer_generation.load(Ordering::Acquire);
            inner.run_task(Box::new(task));
            // Work the inline task scheduled must not sleep through.
            if !inner.internal.is_empty()
                || inner.timer_generation.load(Ordering::Acquire) != generation
            {
                inner.signal_fast();
            }
            return Ok(());
        }
        self.submit_internal_deferred(task)
    }

    /// Enqueue on the internal queue unconditionally, skipping the inline
    /// fast path. Immediate-class work uses this so a callback on the loop
    /// thread never runs synchronously with its scheduler.
    pub fn submit_internal_deferred(
        &self,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), LoopError> {
        let inner = &self.inner;
        {
            let mut queue = inner.internal.lock();
            if inner.state.load() == LoopState::Terminated {
                return Err(LoopError::Terminated);
            }
            queue.push(Box::new(task));
        }
        inner.wake_for_submission();
        Ok(())
    }

    /// Push a microtask; drained between macrotasks per the ordering mode.
    pub fn schedule_microtask(
        &self,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), LoopError> {
        let inner = &self.inner;
        if inner.state.load() == LoopState::Terminated {
            return Err(LoopError::Terminated);
        }
        inner.microtasks.push(Box::new(task));
        inner.wake_for_submission();
        Ok(())
    }

    /// Push a next-tick task: drained together with microtasks but ahead
    /// of them within the same pass.
    pub fn schedule_next_tick(
        &self,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), LoopError> {
        let inner = &self.inner;
        if inner.state.load() == LoopState::Terminated {
            return Err(LoopError::Terminated);
        }
        inner.next_tick.push(Box::new(task));
        inner.wake_for_submission();
        Ok(())
    }

    /// Schedule `callback` after `delay`, subject to the nesting clamp.
    /// The returned id is valid for [`Self::cancel_timer`] immediately,
    /// even before the loop thread performs the heap insertion.
    pub fn schedule_timer(
        &self,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> Result<TimerId, LoopError> {
        let inner = &self.inner;
        if inner.state.load() == LoopState::Terminated {
            return Err(LoopError::Terminated);
        }

        let nesting = inner.nesting_depth.load(Ordering::Acquire) + 1;
        let delay = clamp_delay(delay, nesting);
        let id = inner.alloc_timer_id()?;
        let now = Instant::now();
        // Saturate absurd delays instead of overflowing the clock.
        let deadline = now
            .checked_add(delay)
            .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365));

        {
            let mut table = inner.timers.lock().unwrap_or_else(|e| e.into_inner());
            table.staged.insert(id);
        }
        inner.timer_generation.fetch_add(1, Ordering::AcqRel);

        let insert_inner = self.inner.clone();
        let job: Job = Box::new(callback);
        let inserted = self.submit_internal(move || {
            let mut table = insert_inner
                .timers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            // A cancel that raced the insertion removed the staging entry.
            if table.staged.remove(&id) {
                table.heap.push(TimerNode {
                    id,
                    deadline,
                    nesting,
                    canceled: false,
                    callback: Some(job),
                });
            }
        });
        if let Err(e) = inserted {
            let mut table = inner.timers.lock().unwrap_or_else(|e| e.into_inner());
            table.staged.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Cancel a scheduled timer. Returns [`LoopError::TimerNotFound`] when
    /// the timer already fired, was already canceled, or never existed.
    pub fn cancel_timer(&self, id: TimerId) -> Result<(), LoopError> {
        if id == 0 {
            return Err(LoopError::TimerNotFound(id));
        }
        let inner = &self.inner;
        let mut table = inner.timers.lock().unwrap_or_else(|e| e.into_inner());
        if table.staged.remove(&id) {
            return Ok(());
        }
        if table.heap.cancel(id) {
            return Ok(());
        }
        Err(LoopError::TimerNotFound(id))
    }

    /// Register a user descriptor with the poller. Rejected under
    /// [`FastPathMode::Forced`]; a race with a concurrent mode change rolls
    /// back so the forced-mode invariant is always re-established.
    pub fn register_fd(
        &self,
        fd: RawFd,
        events: IoEvents,
        callback: IoCallback,
    ) -> Result<(), LoopError> {
        let inner = &self.inner;
        let Some(poller) = inner.poller.as_ref() else {
            return Err(LoopError::PollerUnavailable);
        };
        if inner.state.load() == LoopState::Terminated {
            return Err(LoopError::Terminated);
        }
        if inner.fast_mode() == FastPathMode::Forced {
            return Err(LoopError::FastPathIncompatible);
        }

        poller.register_fd(fd, events, callback)?;
        inner.user_fd_count.fetch_add(1, Ordering::AcqRel);

        if inner.fast_mode() == FastPathMode::Forced {
            // Lost the race with set_fast_path_mode(Forced). Decrement only
            // when the unregister succeeded so a concurrent unregister is
            // not double-counted.
            if poller.unregister_fd(fd).is_ok() {
                inner.user_fd_count.fetch_sub(1, Ordering::AcqRel);
            }
            return Err(LoopError::FastPathIncompatible);
        }

        // Loop re-evaluates its dispatch mode on the next tick.
        inner.do_wakeup();
        Ok(())
    }

    pub fn unregister_fd(&self, fd: RawFd) -> Result<(), LoopError> {
        let inner = &self.inner;
        let Some(poller) = inner.poller.as_ref() else {
            return Err(LoopError::PollerUnavailable);
        };
        match poller.unregister_fd(fd) {
            Ok(()) => {
                inner.user_fd_count.fetch_sub(1, Ordering::AcqRel);
                inner.do_wakeup();
                Ok(())
            }
            Err(PollError::FdNotRegistered(fd)) => Err(LoopError::FdNotRegistered(fd)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn modify_fd(&self, fd: RawFd, events: IoEvents) -> Result<(), LoopError> {
        let inner = &self.inner;
        let Some(poller) = inner.poller.as_ref() else {
            return Err(LoopError::PollerUnavailable);
        };
        match poller.modify_fd(fd, events) {
            Ok(()) => Ok(()),
            Err(PollError::FdNotRegistered(fd)) => Err(LoopError::FdNotRegistered(fd)),
            Err(e) => Err(e.into()),
        }
    }

    /// Switch dispatch mode with the store-then-verify protocol. When two
    /// racing calls conflict, at least one returns
    /// [`LoopError::FastPathIncompatible`] and the final state is never
    /// `Forced` with registered descriptors.
    pub fn set_fast_path_mode(&self, mode: FastPathMode) -> Result<(), LoopError> {
        let inner = &self.inner;
        if mode == FastPathMode::Forced && inner.user_fd_count.load(Ordering::Acquire) > 0 {
            return Err(LoopError::FastPathIncompatible);
        }
        let prev = inner.fast_mode.swap(mode as u8, Ordering::AcqRel);
        if mode == FastPathMode::Forced && inner.user_fd_count.load(Ordering::Acquire) > 0 {
            // Re-check failed: roll back unless a concurrent change already
            // won, in which case its intent stands.
            let _ = inner.fast_mode.compare_exchange(
                mode as u8,
                prev,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            inner.do_wakeup();
            return Err(LoopError::FastPathIncompatible);
        }
        inner.do_wakeup();
        Ok(())
    }

    pub fn fast_path_mode(&self) -> FastPathMode {
        self.inner.fast_mode()
    }

    /// Idempotent liveness kick; a no-op unless the loop is sleeping.
    pub fn wake(&self) -> Result<(), LoopError> {
        let inner = &self.inner;
        match inner.state.load() {
            LoopState::Terminated => Err(LoopError::Terminated),
            LoopState::Sleeping => {
                inner.do_wakeup();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Wall-clock time of the current tick: the anchor plus monotonic
    /// elapsed, immune to wall-clock adjustment between ticks.
    pub fn current_tick_time(&self) -> SystemTime {
        let inner = &self.inner;
        let anchor = inner.anchor.read().unwrap_or_else(|e| e.into_inner());
        anchor.wall + Duration::from_nanos(inner.tick_elapsed_nanos.load(Ordering::Acquire))
    }

    /// Re-anchor the tick clock's wall mapping. Timer deadlines are
    /// monotonic and unaffected.
    pub fn set_tick_anchor(&self, wall: SystemTime) {
        let inner = &self.inner;
        let mut anchor = inner.anchor.write().unwrap_or_else(|e| e.into_inner());
        *anchor = TickAnchor {
            wall,
            mono: Instant::now(),
        };
        inner.tick_elapsed_nanos.store(0, Ordering::Release);
    }

    pub fn state(&self) -> LoopState {
        self.inner.state.load()
    }

    /// Metrics snapshot; `None` unless enabled in [`Options`].
    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        self.inner
            .metrics
            .as_ref()
            .map(|m| m.snapshot(self.inner.mono_secs()))
    }

    /// Keep a pending promise reachable until it settles; scavenged per
    /// tick, rejected wholesale at shutdown.
    pub fn track(&self, entry: Arc<dyn Tracked>) {
        self.inner.registry.track(entry);
    }

    /// Record a rejection with no handler attached; emitted through the
    /// unhandled-rejection callback at the tail of the tick unless
    /// retracted first.
    pub fn report_unhandled_rejection(&self, key: u64, reason: Reason) {
        self.inner.rejections.insert(key, reason);
        // A sleeping loop still owes the notification a flush.
        self.inner.do_wakeup();
    }

    pub fn retract_unhandled_rejection(&self, key: u64) {
        self.inner.rejections.remove(&key);
    }

    /// Count offloaded work the shutdown drain should wait for (bounded).
    pub fn work_guard(&self) -> WorkGuard {
        self.inner.flights.begin();
        WorkGuard {
            inner: self.inner.clone(),
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("state", &self.state())
            .field("fast_path_mode", &self.inner.fast_mode())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flights_wait_idle_empty() {
        let flights = Flights::new();
        assert!(flights.wait_idle(Duration::from_millis(1)));
    }

    #[test]
    fn test_flights_wait_times_out_with_work_in_flight() {
        let flights = Arc::new(Flights::new());
        flights.begin();
        assert!(!flights.wait_idle(Duration::from_millis(10)));

        let waiter = {
            let flights = flights.clone();
            thread::spawn(move || flights.wait_idle(Duration::from_secs(2)))
        };
        thread::sleep(Duration::from_millis(20));
        flights.end();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_panic_message_extracts_payloads() {
        let err = catch_unwind(|| panic!("static str")).unwrap_err();
        assert_eq!(panic_message(&*err), "static str");

        let text = String::from("owned");
        let err = catch_unwind(AssertUnwindSafe(move || panic!("{text}"))).unwrap_err();
        assert_eq!(panic_message(&*err), "owned");

        let err = catch_unwind(|| std::panic::panic_any(17u32)).unwrap_err();
        assert_eq!(panic_message(&*err), "non-string panic payload");
    }
}
