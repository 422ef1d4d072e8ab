//! Offload blocking work to a worker thread, settle a promise with its
//! outcome.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use tracing::warn;

use vloop_core::{EventLoop, LoopError, LoopState, Reason};

use crate::errors::PanicError;
use crate::promise::{Promise, Settler};

fn deliver<T>(settler: &Settler<T>, outcome: thread::Result<Result<T, Reason>>)
where
    T: Clone + Send + 'static,
{
    match outcome {
        Ok(Ok(value)) => settler.resolve(value),
        Ok(Err(reason)) => settler.reject(reason),
        Err(payload) => settler.reject(Arc::new(PanicError::from_payload(payload))),
    }
}

/// Run `work` on a spawned thread and settle the returned promise with its
/// result, error, or recovered panic. The settling task goes through the
/// internal queue; a work guard keeps the shutdown drain waiting (bounded)
/// for in-flight work.
pub fn promisify<T, F>(lp: &EventLoop, work: F) -> Promise<T>
where
    T: Clone + Send + 'static,
    F: FnOnce() -> Result<T, Reason> + Send + 'static,
{
    let (promise, settler) = Promise::pending(lp);

    if lp.state() == LoopState::Terminated {
        settler.reject(Arc::new(LoopError::Terminated));
        return promise;
    }

    let guard = lp.work_guard();
    let lp = lp.clone();
    let thread_settler = settler.clone();
    let spawned = thread::Builder::new()
        .name("vloop-promisify".into())
        .spawn(move || {
            let outcome = catch_unwind(AssertUnwindSafe(work));
            if lp.state() == LoopState::Terminated {
                // The loop can no longer run the settling task.
                deliver(&thread_settler, outcome);
            } else {
                let inline = thread_settler.clone();
                if lp
                    .submit_internal(move || deliver(&inline, outcome))
                    .is_err()
                {
                    warn!("loop terminated before promisify result landed");
                    thread_settler.reject(Arc::new(LoopError::Terminated));
                }
            }
            drop(guard);
        });

    if let Err(e) = spawned {
        settler.reject(Arc::new(e));
    }
    promise
}
