//! Chained promises with microtask-scheduled settlement.
//!
//! A promise settles exactly once; handlers registered before settlement
//! are stored in a tiered slot (`None | One | Many`) that collapses back to
//! `None` on settlement so closure captures become collectable. Handler
//! execution always goes through the loop's microtask ring, in
//! registration order; once the loop has terminated, delivery falls back
//! to inline so adapters still observe the outcome.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use vloop_core::{EventLoop, LoopState, Reason, Tracked};

use crate::errors::{PanicError, SelfResolutionError};

static PROMISE_IDS: AtomicU64 = AtomicU64::new(1);

fn next_promise_id() -> u64 {
    PROMISE_IDS.fetch_add(1, Ordering::Relaxed)
}

const WORD_PENDING: u8 = 0;
const WORD_FULFILLED: u8 = 1;
const WORD_REJECTED: u8 = 2;

/// Observable promise state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

/// Outcome of a handler: settle with a value, reject, or adopt another
/// promise's eventual settlement.
pub enum Step<U>
where
    U: Clone + Send + 'static,
{
    Value(U),
    Reject(Reason),
    Chain(Promise<U>),
}

impl<U: Clone + Send + 'static> From<Promise<U>> for Step<U> {
    fn from(promise: Promise<U>) -> Self {
        Step::Chain(promise)
    }
}

/// An object whose `then` the engine can assimilate (Promise/A+ 2.3.3).
pub trait Thenable<T>: Send + 'static
where
    T: Clone + Send + 'static,
{
    fn subscribe(
        self: Box<Self>,
        on_fulfilled: Box<dyn FnOnce(T) + Send>,
        on_rejected: Box<dyn FnOnce(Reason) + Send>,
    );
}

impl<T: Clone + Send + 'static> Thenable<T> for Promise<T> {
    fn subscribe(
        self: Box<Self>,
        on_fulfilled: Box<dyn FnOnce(T) + Send>,
        on_rejected: Box<dyn FnOnce(Reason) + Send>,
    ) {
        self.shared.attach(
            Handler {
                on_fulfilled: Some(on_fulfilled),
                on_rejected: Some(on_rejected),
            },
            true,
        );
    }
}

struct Handler<T> {
    on_fulfilled: Option<Box<dyn FnOnce(T) + Send>>,
    on_rejected: Option<Box<dyn FnOnce(Reason) + Send>>,
}

enum Handlers<T> {
    None,
    One(Handler<T>),
    Many(Vec<Handler<T>>),
}

impl<T> Handlers<T> {
    fn push(&mut self, handler: Handler<T>) {
        match std::mem::replace(self, Handlers::None) {
            Handlers::None => *self = Handlers::One(handler),
            Handlers::One(first) => *self = Handlers::Many(vec![first, handler]),
            Handlers::Many(mut all) => {
                all.push(handler);
                *self = Handlers::Many(all);
            }
        }
    }

    fn take_all(&mut self) -> Vec<Handler<T>> {
        match std::mem::replace(self, Handlers::None) {
            Handlers::None => Vec::new(),
            Handlers::One(handler) => vec![handler],
            Handlers::Many(all) => all,
        }
    }
}

enum State<T> {
    Pending,
    Fulfilled(T),
    Rejected(Reason),
}

/// Settled snapshot cloned out for dispatch.
enum Settled<T> {
    Fulfilled(T),
    Rejected(Reason),
}

struct Core<T> {
    state: State<T>,
    handlers: Handlers<T>,
}

pub(crate) struct Shared<T>
where
    T: Clone + Send + 'static,
{
    id: u64,
    lp: EventLoop,
    // Sentinel for optimistic readers; written under the core lock.
    state_word: AtomicU8,
    core: Mutex<Core<T>>,
    has_rejection_handler: AtomicBool,
}

impl<T: Clone + Send + 'static> Shared<T> {
    fn settle(&self, outcome: Settled<T>) {
        let (handlers, snapshot, rejected_reason) = {
            let mut core = self.core.lock().unwrap_or_else(|e| e.into_inner());
            if !matches!(core.state, State::Pending) {
                return;
            }
            let (state, snapshot, word, rejected) = match outcome {
                Settled::Fulfilled(value) => (
                    State::Fulfilled(value.clone()),
                    Settled::Fulfilled(value),
                    WORD_FULFILLED,
                    None,
                ),
                Settled::Rejected(reason) => (
                    State::Rejected(reason.clone()),
                    Settled::Rejected(reason.clone()),
                    WORD_REJECTED,
                    Some(reason),
                ),
            };
            core.state = state;
            self.state_word.store(word, Ordering::Release);
            (core.handlers.take_all(), snapshot, rejected)
        };

        for handler in handlers {
            let copy = match &snapshot {
                Settled::Fulfilled(value) => Settled::Fulfilled(value.clone()),
                Settled::Rejected(reason) => Settled::Rejected(reason.clone()),
            };
            self.dispatch(handler, copy);
        }

        if let Some(reason) = rejected_reason {
            if !self.has_rejection_handler.load(Ordering::Acquire) {
                self.lp.report_unhandled_rejection(self.id, reason);
            }
        }
    }

    /// Schedule one handler against a settled snapshot.
    fn dispatch(&self, handler: Handler<T>, snapshot: Settled<T>) {
        let job = move || match snapshot {
            Settled::Fulfilled(value) => {
                if let Some(on_fulfilled) = handler.on_fulfilled {
                    on_fulfilled(value);
                }
            }
            Settled::Rejected(reason) => {
                if let Some(on_rejected) = handler.on_rejected {
                    on_rejected(reason);
                }
            }
        };
        if self.lp.state() == LoopState::Terminated {
            // No microtask drain will ever run again; deliver inline so
            // channel adapters and children still observe the settlement.
            job();
        } else {
            let _ = self.lp.schedule_microtask(job);
        }
    }

    fn attach(&self, handler: Handler<T>, observes_rejection: bool) {
        if observes_rejection {
            self.has_rejection_handler.store(true, Ordering::Release);
            self.lp.retract_unhandled_rejection(self.id);
        }
        let snapshot = {
            let mut core = self.core.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(core.state, State::Pending) {
                core.handlers.push(handler);
                return;
            }
            match &core.state {
                State::Fulfilled(value) => Settled::Fulfilled(value.clone()),
                State::Rejected(reason) => Settled::Rejected(reason.clone()),
                State::Pending => return,
            }
        };
        self.dispatch(handler, snapshot);
    }
}

impl<T: Clone + Send + 'static> Tracked for Shared<T> {
    fn is_settled(&self) -> bool {
        self.state_word.load(Ordering::Acquire) != WORD_PENDING
    }

    fn reject(&self, reason: Reason) {
        self.settle(Settled::Rejected(reason));
    }
}

/// A chained promise bound to one loop. Cloning shares the settlement.
pub struct Promise<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// Settles its promise; cloneable, and every settlement after the first is
/// ignored.
pub struct Settler<T>
where
    T: Clone + Send + 'static,
{
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> Clone for Settler<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Settler<T> {
    pub fn resolve(&self, value: T) {
        self.shared.settle(Settled::Fulfilled(value));
    }

    pub fn reject(&self, reason: Reason) {
        self.shared.settle(Settled::Rejected(reason));
    }

    /// Settle according to a handler outcome, adopting chained promises.
    pub fn follow(&self, step: Step<T>) {
        match step {
            Step::Value(value) => self.resolve(value),
            Step::Reject(reason) => self.reject(reason),
            Step::Chain(promise) => {
                if Arc::ptr_eq(&promise.shared, &self.shared) {
                    self.reject(Arc::new(SelfResolutionError));
                    return;
                }
                self.adopt(Box::new(promise));
            }
        }
    }

    /// Assimilate any thenable: its settlement becomes ours.
    pub fn adopt(&self, thenable: Box<dyn Thenable<T>>) {
        let fulfill = self.clone();
        let reject = self.clone();
        thenable.subscribe(
            Box::new(move |value| fulfill.resolve(value)),
            Box::new(move |reason| reject.reject(reason)),
        );
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// A pending promise plus its settler. The promise is tracked by the
    /// loop's registry until it settles.
    pub fn pending(lp: &EventLoop) -> (Self, Settler<T>) {
        let shared = Arc::new(Shared {
            id: next_promise_id(),
            lp: lp.clone(),
            state_word: AtomicU8::new(WORD_PENDING),
            core: Mutex::new(Core {
                state: State::Pending,
                handlers: Handlers::None,
            }),
            has_rejection_handler: AtomicBool::new(false),
        });
        lp.track(shared.clone());
        (
            Promise {
                shared: shared.clone(),
            },
            Settler { shared },
        )
    }

    pub fn resolved(lp: &EventLoop, value: T) -> Self {
        let (promise, settler) = Self::pending(lp);
        settler.resolve(value);
        promise
    }

    pub fn rejected(lp: &EventLoop, reason: Reason) -> Self {
        let (promise, settler) = Self::pending(lp);
        settler.reject(reason);
        promise
    }

    pub fn state(&self) -> PromiseState {
        match self.shared.state_word.load(Ordering::Acquire) {
            WORD_FULFILLED => PromiseState::Fulfilled,
            WORD_REJECTED => PromiseState::Rejected,
            _ => PromiseState::Pending,
        }
    }

    /// Snapshot the settlement, if any. Settled results are stable:
    /// repeated calls observe the same outcome.
    pub fn try_result(&self) -> Option<Result<T, Reason>> {
        // Optimistic sentinel read skips the lock for pending promises.
        if self.shared.state_word.load(Ordering::Acquire) == WORD_PENDING {
            return None;
        }
        let core = self.shared.core.lock().unwrap_or_else(|e| e.into_inner());
        match &core.state {
            State::Pending => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(reason) => Some(Err(reason.clone())),
        }
    }

    /// The loop this promise settles on.
    pub fn event_loop(&self) -> &EventLoop {
        &self.shared.lp
    }

    /// Internal subscription used by adapters and combinators.
    pub(crate) fn subscribe_raw(
        &self,
        on_fulfilled: impl FnOnce(T) + Send + 'static,
        on_rejected: impl FnOnce(Reason) + Send + 'static,
        observes_rejection: bool,
    ) {
        self.shared.attach(
            Handler {
                on_fulfilled: Some(Box::new(on_fulfilled)),
                on_rejected: Some(Box::new(on_rejected)),
            },
            observes_rejection,
        );
    }

    /// Chain on fulfillment; a rejection flows through to the child
    /// untouched. Handler panics reject the child with [`PanicError`].
    pub fn then<U, F>(&self, on_fulfilled: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Step<U> + Send + 'static,
    {
        let (child, settler) = Promise::pending(&self.shared.lp);
        let pass_reject = settler.clone();
        self.shared.attach(
            Handler {
                on_fulfilled: Some(Box::new(move |value| {
                    match catch_unwind(AssertUnwindSafe(|| on_fulfilled(value))) {
                        Ok(step) => settler.follow(step),
                        Err(payload) => {
                            settler.reject(Arc::new(PanicError::from_payload(payload)))
                        }
                    }
                })),
                on_rejected: Some(Box::new(move |reason| pass_reject.reject(reason))),
            },
            false,
        );
        child
    }

    /// Chain on both arms.
    pub fn then_catch<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Step<U> + Send + 'static,
        R: FnOnce(Reason) -> Step<U> + Send + 'static,
    {
        let (child, settler) = Promise::pending(&self.shared.lp);
        let reject_settler = settler.clone();
        self.shared.attach(
            Handler {
                on_fulfilled: Some(Box::new(move |value| {
                    match catch_unwind(AssertUnwindSafe(|| on_fulfilled(value))) {
                        Ok(step) => settler.follow(step),
                        Err(payload) => {
                            settler.reject(Arc::new(PanicError::from_payload(payload)))
                        }
                    }
                })),
                on_rejected: Some(Box::new(move |reason| {
                    match catch_unwind(AssertUnwindSafe(|| on_rejected(reason))) {
                        Ok(step) => reject_settler.follow(step),
                        Err(payload) => {
                            reject_settler.reject(Arc::new(PanicError::from_payload(payload)))
                        }
                    }
                })),
            },
            true,
        );
        child
    }

    /// Recover from rejection; fulfillment flows through untouched.
    pub fn catch<R>(&self, on_rejected: R) -> Promise<T>
    where
        R: FnOnce(Reason) -> Step<T> + Send + 'static,
    {
        let (child, settler) = Promise::pending(&self.shared.lp);
        let recover = settler.clone();
        self.shared.attach(
            Handler {
                on_fulfilled: Some(Box::new(move |value| settler.resolve(value))),
                on_rejected: Some(Box::new(move |reason| {
                    match catch_unwind(AssertUnwindSafe(|| on_rejected(reason))) {
                        Ok(step) => recover.follow(step),
                        Err(payload) => {
                            recover.reject(Arc::new(PanicError::from_payload(payload)))
                        }
                    }
                })),
            },
            true,
        );
        child
    }

    /// Run `cleanup` on either arm; the child mirrors this promise.
    pub fn finally<F>(&self, cleanup: F) -> Promise<T>
    where
        F: FnOnce() + Send + 'static,
    {
        let (child, settler) = Promise::pending(&self.shared.lp);
        let reject_settler = settler.clone();
        // One cell, two arms; exactly one arm runs.
        let cleanup = Arc::new(Mutex::new(Some(cleanup)));
        let cleanup_reject = cleanup.clone();
        self.shared.attach(
            Handler {
                on_fulfilled: Some(Box::new(move |value| {
                    if let Some(f) = cleanup.lock().unwrap_or_else(|e| e.into_inner()).take() {
                        let _ = catch_unwind(AssertUnwindSafe(f));
                    }
                    settler.resolve(value);
                })),
                on_rejected: Some(Box::new(move |reason| {
                    if let Some(f) = cleanup_reject
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .take()
                    {
                        let _ = catch_unwind(AssertUnwindSafe(f));
                    }
                    reject_settler.reject(reason);
                })),
            },
            // Cleanup observes, it does not handle.
            false,
        );
        child
    }

    /// One-shot channel carrying the settlement. If the promise already
    /// settled the value is available immediately; otherwise a handler
    /// attached under the promise lock sends it, so a settlement racing
    /// this call can neither deadlock nor drop the send.
    ///
    /// Receive from any thread except the loop thread.
    pub fn to_channel(&self) -> crossbeam_channel::Receiver<Result<T, Reason>> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let tx_reject = tx.clone();
        self.subscribe_raw(
            move |value| {
                let _ = tx.send(Ok(value));
            },
            move |reason| {
                let _ = tx_reject.send(Err(reason));
            },
            true,
        );
        rx
    }
}

impl<T: Clone + Send + 'static> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
