//! Loop construction options.

use std::sync::Arc;

use crate::error::{LoopError, Reason};
use crate::poller::Poller;

/// Dispatch mode selection.
///
/// `Forced` requires that no user descriptors are registered; the loop
/// keeps that invariant through the rollback protocol on racing calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FastPathMode {
    /// Fast path while no user descriptors are registered (default).
    Auto = 0,
    /// Fast path always; incompatible with user descriptors.
    Forced = 1,
    /// Poller path always.
    Disabled = 2,
}

impl FastPathMode {
    pub(crate) fn from_word(word: u8) -> Self {
        match word {
            1 => FastPathMode::Forced,
            2 => FastPathMode::Disabled,
            _ => FastPathMode::Auto,
        }
    }
}

/// Invoked from the loop thread when the external queue exceeds the tick
/// budget. Must not re-enter `submit` unboundedly.
pub type OverloadCallback = Arc<dyn Fn(&LoopError) + Send + Sync + 'static>;

/// Invoked from the loop thread for rejected promises that never gained a
/// rejection handler.
pub type RejectionCallback = Arc<dyn Fn(Reason) + Send + Sync + 'static>;

/// Configuration for [`crate::EventLoop::new`].
pub struct Options {
    pub(crate) strict_microtask_ordering: bool,
    pub(crate) fast_path_mode: FastPathMode,
    pub(crate) metrics: bool,
    pub(crate) poller: Option<Box<dyn Poller>>,
    pub(crate) on_overload: Option<OverloadCallback>,
    pub(crate) on_unhandled_rejection: Option<RejectionCallback>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            strict_microtask_ordering: false,
            fast_path_mode: FastPathMode::Auto,
            metrics: false,
            poller: None,
            on_overload: None,
            on_unhandled_rejection: None,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain microtasks after every macrotask instead of after each batch.
    /// Matches browser per-task queues at a throughput cost.
    pub fn strict_microtask_ordering(mut self, strict: bool) -> Self {
        self.strict_microtask_ordering = strict;
        self
    }

    pub fn fast_path_mode(mut self, mode: FastPathMode) -> Self {
        self.fast_path_mode = mode;
        self
    }

    /// Enable latency/throughput/depth aggregation.
    pub fn metrics(mut self, enabled: bool) -> Self {
        self.metrics = enabled;
        self
    }

    /// Supply the OS readiness poller. Without one the loop runs fast-path
    /// only and descriptor registration fails.
    pub fn poller(mut self, poller: Box<dyn Poller>) -> Self {
        self.poller = Some(poller);
        self
    }

    pub fn on_overload(mut self, callback: OverloadCallback) -> Self {
        self.on_overload = Some(callback);
        self
    }

    pub fn on_unhandled_rejection(mut self, callback: RejectionCallback) -> Self {
        self.on_unhandled_rejection = Some(callback);
        self
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("strict_microtask_ordering", &self.strict_microtask_ordering)
            .field("fast_path_mode", &self.fast_path_mode)
            .field("metrics", &self.metrics)
            .field("poller", &self.poller.is_some())
            .finish_non_exhaustive()
    }
}

// Keep the callback signature honest: the overload payload is the
// taxonomy's overload error, carrying the leftover backlog.
pub(crate) fn overload_error(backlog: usize) -> LoopError {
    LoopError::Overloaded { backlog }
}
