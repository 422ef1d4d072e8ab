//! # vloop-core
//!
//! Single-consumer event loop with JavaScript dispatch semantics: timers,
//! microtasks, external and internal (priority) submissions, and FD
//! readiness callbacks, executed by one loop thread in a deterministic
//! tick order.
//!
//! The loop blocks on an in-process wake channel while no user descriptors
//! are registered (the fast path) and on the [`Poller`] capability
//! otherwise. Producers may call every submission API from any thread.

mod error;
mod event_loop;
mod metrics;
mod options;
mod poller;
mod registry;
mod timer;
mod wake;

pub use error::{LoopError, PollError, Reason};
pub use event_loop::{EventLoop, WorkGuard};
pub use metrics::MetricsSnapshot;
pub use options::{FastPathMode, Options, OverloadCallback, RejectionCallback};
pub use poller::{IoCallback, IoEvents, Poller};
pub use registry::Tracked;
pub use timer::{TimerId, MAX_TIMER_ID};

pub use vloop_sync::LoopState;
