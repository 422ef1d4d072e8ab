//! Error taxonomy for the loop API boundary.
//!
//! Errors are returned values, never panics. Rejection errors surface
//! immediately with nothing enqueued; recoverable local failures are logged
//! and swallowed inside the loop; only fatal poller failures terminate it.

use std::os::fd::RawFd;
use std::sync::Arc;

use thiserror::Error;

use crate::timer::TimerId;

/// Rejection reason shared across handlers and channels.
pub type Reason = Arc<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("event loop is already running")]
    AlreadyRunning,

    #[error("event loop has terminated")]
    Terminated,

    #[error("external queue exceeded the tick budget ({backlog} tasks left over)")]
    Overloaded { backlog: usize },

    #[error("run called from inside the loop thread")]
    ReentrantRun,

    #[error("forced fast path is incompatible with registered file descriptors")]
    FastPathIncompatible,

    #[error("timer {0} not found")]
    TimerNotFound(TimerId),

    #[error("immediate {0} not found")]
    ImmediateNotFound(u64),

    #[error("interval {0} not found")]
    IntervalNotFound(u64),

    #[error("timer id space exhausted")]
    TimerIdExhausted,

    #[error("immediate id space exhausted")]
    ImmediateIdExhausted,

    #[error("interval id space exhausted")]
    IntervalIdExhausted,

    #[error("fd {0} is not registered")]
    FdNotRegistered(RawFd),

    #[error("no poller configured for this loop")]
    PollerUnavailable,

    #[error("run canceled")]
    Canceled,

    #[error("shutdown wait deadline expired before the loop exited")]
    ShutdownTimedOut,

    #[error("poller failure: {0}")]
    Poll(#[from] PollError),
}

/// Failures surfaced by a [`crate::Poller`] implementation.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("fd {0} is not registered")]
    FdNotRegistered(RawFd),

    #[error("fd {0} is already registered")]
    AlreadyRegistered(RawFd),

    #[error("poller is closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LoopError {
    /// Termination reason handed to pending promises at shutdown.
    pub(crate) fn termination_reason() -> Reason {
        Arc::new(LoopError::Terminated)
    }
}
