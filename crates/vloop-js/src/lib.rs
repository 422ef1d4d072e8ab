//! # vloop-js
//!
//! Named JavaScript-style facade over the loop: `set_timeout`,
//! `set_interval`, `set_immediate`, `queue_microtask`, `next_tick`.
//!
//! Timeouts share the loop's timer id space; intervals and immediates get
//! their own monotonic id spaces with the same float-safe upper bound and
//! their own exhaustion errors.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use vloop_core::{EventLoop, LoopError, TimerId, MAX_TIMER_ID};

/// Identifier handed out by [`JsRuntime::set_timeout`]; interchangeable
/// with the loop's [`TimerId`].
pub type TimeoutId = TimerId;

/// Identifier handed out by [`JsRuntime::set_interval`].
pub type IntervalId = u64;

/// Identifier handed out by [`JsRuntime::set_immediate`].
pub type ImmediateId = u64;

struct IntervalState {
    canceled: AtomicBool,
    // Rotates to the next underlying timer on every rearm.
    timer: Mutex<TimerId>,
}

struct JsInner {
    lp: EventLoop,
    intervals: DashMap<IntervalId, Arc<IntervalState>>,
    immediates: DashMap<ImmediateId, Arc<AtomicBool>>,
    next_interval_id: AtomicU64,
    next_immediate_id: AtomicU64,
}

impl JsInner {
    fn arm_interval(
        inner: &Arc<JsInner>,
        id: IntervalId,
        state: &Arc<IntervalState>,
        period: Duration,
        callback: &Arc<dyn Fn() + Send + Sync>,
    ) -> Result<(), LoopError> {
        let lp = inner.lp.clone();
        let timer_id = {
            let inner = inner.clone();
            let state = state.clone();
            let callback = callback.clone();
            lp.schedule_timer(period, move || {
                if state.canceled.load(Ordering::Acquire) {
                    return;
                }
                callback();
                if state.canceled.load(Ordering::Acquire) {
                    return;
                }
                if let Err(e) = JsInner::arm_interval(&inner, id, &state, period, &callback) {
                    debug!(interval = id, error = %e, "interval rearm failed");
                    inner.intervals.remove(&id);
                }
            })?
        };
        *state.timer.lock().unwrap_or_else(|e| e.into_inner()) = timer_id;
        Ok(())
    }
}

/// JavaScript-flavored scheduling surface bound to one loop. Cheap to
/// clone.
#[derive(Clone)]
pub struct JsRuntime {
    inner: Arc<JsInner>,
}

impl JsRuntime {
    pub fn new(lp: EventLoop) -> Self {
        Self {
            inner: Arc::new(JsInner {
                lp,
                intervals: DashMap::new(),
                immediates: DashMap::new(),
                next_interval_id: AtomicU64::new(1),
                next_immediate_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.lp
    }

    /// One-shot timer; delegates to the loop's timer heap, including the
    /// nesting clamp.
    pub fn set_timeout(
        &self,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> Result<TimeoutId, LoopError> {
        self.inner.lp.schedule_timer(delay, callback)
    }

    pub fn clear_timeout(&self, id: TimeoutId) -> Result<(), LoopError> {
        self.inner.lp.cancel_timer(id)
    }

    /// Repeating timer. The callback reschedules itself after each run, so
    /// nested-interval clamping applies exactly as it does for chained
    /// timeouts.
    pub fn set_interval(
        &self,
        period: Duration,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Result<IntervalId, LoopError> {
        let id = self.inner.next_interval_id.fetch_add(1, Ordering::AcqRel);
        if id > MAX_TIMER_ID {
            return Err(LoopError::IntervalIdExhausted);
        }
        let state = Arc::new(IntervalState {
            canceled: AtomicBool::new(false),
            timer: Mutex::new(0),
        });
        self.inner.intervals.insert(id, state.clone());

        let callback: Arc<dyn Fn() + Send + Sync> = Arc::new(callback);
        if let Err(e) = JsInner::arm_interval(&self.inner, id, &state, period, &callback) {
            self.inner.intervals.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    pub fn clear_interval(&self, id: IntervalId) -> Result<(), LoopError> {
        let Some((_, state)) = self.inner.intervals.remove(&id) else {
            return Err(LoopError::IntervalNotFound(id));
        };
        state.canceled.store(true, Ordering::Release);
        let timer = *state.timer.lock().unwrap_or_else(|e| e.into_inner());
        // The current rotation may already have fired; the canceled flag
        // stops the chain either way.
        let _ = self.inner.lp.cancel_timer(timer);
        Ok(())
    }

    /// Run `callback` in the internal (priority) slot of an upcoming tick.
    /// Never synchronous, even from the loop thread.
    pub fn set_immediate(
        &self,
        callback: impl FnOnce() + Send + 'static,
    ) -> Result<ImmediateId, LoopError> {
        let id = self.inner.next_immediate_id.fetch_add(1, Ordering::AcqRel);
        if id > MAX_TIMER_ID {
            return Err(LoopError::ImmediateIdExhausted);
        }
        let canceled = Arc::new(AtomicBool::new(false));
        self.inner.immediates.insert(id, canceled.clone());

        let inner = self.inner.clone();
        let enqueued = self.inner.lp.submit_internal_deferred(move || {
            inner.immediates.remove(&id);
            if !canceled.load(Ordering::Acquire) {
                callback();
            }
        });
        if let Err(e) = enqueued {
            self.inner.immediates.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    pub fn clear_immediate(&self, id: ImmediateId) -> Result<(), LoopError> {
        let Some((_, canceled)) = self.inner.immediates.remove(&id) else {
            return Err(LoopError::ImmediateNotFound(id));
        };
        canceled.store(true, Ordering::Release);
        Ok(())
    }

    /// Enqueue a microtask, drained between macrotasks.
    pub fn queue_microtask(
        &self,
        callback: impl FnOnce() + Send + 'static,
    ) -> Result<(), LoopError> {
        self.inner.lp.schedule_microtask(callback)
    }

    /// Enqueue a next-tick callback: runs ahead of regular microtasks in
    /// the same drain pass.
    pub fn next_tick(
        &self,
        callback: impl FnOnce() + Send + 'static,
    ) -> Result<(), LoopError> {
        self.inner.lp.schedule_next_tick(callback)
    }
}

impl std::fmt::Debug for JsRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsRuntime")
            .field("intervals", &self.inner.intervals.len())
            .field("immediates", &self.inner.immediates.len())
            .finish_non_exhaustive()
    }
}
