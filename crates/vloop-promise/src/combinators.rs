//! Promise combinators: `all`, `race`, `any`, `all_settled`.
//!
//! All of them are counter joins: each input promise gets a subscription
//! that fills its slot, and the last arrival (or the first, for short-
//! circuiting combinators) settles the output. Settlement idempotence in
//! the engine makes the short-circuit paths race-free.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use vloop_core::{EventLoop, Reason};

use crate::errors::AggregateError;
use crate::promise::{Promise, Settler};

/// Per-input outcome reported by [`all_settled`].
pub enum SettledOutcome<T>
where
    T: Clone + Send + 'static,
{
    Fulfilled(T),
    Rejected(Reason),
}

impl<T: Clone + Send + 'static> Clone for SettledOutcome<T> {
    fn clone(&self) -> Self {
        match self {
            SettledOutcome::Fulfilled(value) => SettledOutcome::Fulfilled(value.clone()),
            SettledOutcome::Rejected(reason) => SettledOutcome::Rejected(reason.clone()),
        }
    }
}

impl<T: Clone + Send + 'static> SettledOutcome<T> {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, SettledOutcome::Fulfilled(_))
    }
}

/// Fulfills with every value in input order, or rejects with the first
/// rejection. An empty input fulfills immediately.
pub fn all<T>(lp: &EventLoop, promises: Vec<Promise<T>>) -> Promise<Vec<T>>
where
    T: Clone + Send + 'static,
{
    let (result, settler) = Promise::pending(lp);
    if promises.is_empty() {
        settler.resolve(Vec::new());
        return result;
    }

    let slots: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new(vec![None; promises.len()]));
    let remaining = Arc::new(AtomicUsize::new(promises.len()));

    for (index, promise) in promises.into_iter().enumerate() {
        let slots = slots.clone();
        let remaining = remaining.clone();
        let fulfill: Settler<Vec<T>> = settler.clone();
        let reject = settler.clone();
        promise.subscribe_raw(
            move |value| {
                slots.lock().unwrap_or_else(|e| e.into_inner())[index] = Some(value);
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let collected: Option<Vec<T>> = slots
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .drain(..)
                        .collect();
                    if let Some(values) = collected {
                        fulfill.resolve(values);
                    }
                }
            },
            move |reason| reject.reject(reason),
            true,
        );
    }
    result
}

/// Settles like the first input to settle, value or rejection alike. An
/// empty input never settles.
pub fn race<T>(lp: &EventLoop, promises: Vec<Promise<T>>) -> Promise<T>
where
    T: Clone + Send + 'static,
{
    let (result, settler) = Promise::pending(lp);
    for promise in promises {
        let fulfill = settler.clone();
        let reject = settler.clone();
        promise.subscribe_raw(
            move |value| fulfill.resolve(value),
            move |reason| reject.reject(reason),
            true,
        );
    }
    result
}

/// Fulfills with the first fulfillment; rejects with [`AggregateError`]
/// only when every input rejected.
pub fn any<T>(lp: &EventLoop, promises: Vec<Promise<T>>) -> Promise<T>
where
    T: Clone + Send + 'static,
{
    let (result, settler) = Promise::pending(lp);
    if promises.is_empty() {
        settler.reject(Arc::new(AggregateError {
            reasons: Vec::new(),
        }));
        return result;
    }

    let reasons: Arc<Mutex<Vec<Option<Reason>>>> =
        Arc::new(Mutex::new(vec![None; promises.len()]));
    let remaining = Arc::new(AtomicUsize::new(promises.len()));

    for (index, promise) in promises.into_iter().enumerate() {
        let reasons = reasons.clone();
        let remaining = remaining.clone();
        let fulfill = settler.clone();
        let reject = settler.clone();
        promise.subscribe_raw(
            move |value| fulfill.resolve(value),
            move |reason| {
                reasons.lock().unwrap_or_else(|e| e.into_inner())[index] = Some(reason);
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let collected: Vec<Reason> = reasons
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .drain(..)
                        .flatten()
                        .collect();
                    reject.reject(Arc::new(AggregateError { reasons: collected }));
                }
            },
            true,
        );
    }
    result
}

/// Fulfills once every input has settled, reporting each outcome in input
/// order. Never rejects.
pub fn all_settled<T>(
    lp: &EventLoop,
    promises: Vec<Promise<T>>,
) -> Promise<Vec<SettledOutcome<T>>>
where
    T: Clone + Send + 'static,
{
    let (result, settler) = Promise::pending(lp);
    if promises.is_empty() {
        settler.resolve(Vec::new());
        return result;
    }

    let slots: Arc<Mutex<Vec<Option<SettledOutcome<T>>>>> =
        Arc::new(Mutex::new(vec![None; promises.len()]));
    let remaining = Arc::new(AtomicUsize::new(promises.len()));

    for (index, promise) in promises.into_iter().enumerate() {
        let record = {
            let slots = slots.clone();
            let remaining = remaining.clone();
            let settler = settler.clone();
            move |outcome: SettledOutcome<T>| {
                slots.lock().unwrap_or_else(|e| e.into_inner())[index] = Some(outcome);
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let collected: Option<Vec<SettledOutcome<T>>> = slots
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .drain(..)
                        .collect();
                    if let Some(outcomes) = collected {
                        settler.resolve(outcomes);
                    }
                }
            }
        };
        let record_rejection = record.clone();
        promise.subscribe_raw(
            move |value| record(SettledOutcome::Fulfilled(value)),
            move |reason| record_rejection(SettledOutcome::Rejected(reason)),
            true,
        );
    }
    result
}
