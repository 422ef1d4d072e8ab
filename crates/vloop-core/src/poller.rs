//! The poller capability consumed by the loop.
//!
//! The loop never talks to the OS readiness facility directly; it drives a
//! [`Poller`] that registers descriptors and dispatches their callbacks from
//! inside [`Poller::poll_io`], on the loop thread. The concrete
//! implementation (epoll on Linux) lives outside this crate.

use std::os::fd::RawFd;
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::PollError;

bitflags! {
    /// Readiness interest and readiness report bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IoEvents: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const ERROR    = 1 << 2;
        const HANGUP   = 1 << 3;
    }
}

/// Callback invoked on the loop thread when a descriptor reports readiness.
pub type IoCallback = Arc<dyn Fn(IoEvents) + Send + Sync + 'static>;

/// OS readiness notification capability.
///
/// Implementations must be safe to call from any thread for registration
/// while `poll_io` runs on the loop thread.
pub trait Poller: Send + Sync {
    fn init(&self) -> Result<(), PollError>;

    fn register_fd(&self, fd: RawFd, events: IoEvents, callback: IoCallback)
        -> Result<(), PollError>;

    fn unregister_fd(&self, fd: RawFd) -> Result<(), PollError>;

    fn modify_fd(&self, fd: RawFd, events: IoEvents) -> Result<(), PollError>;

    /// Block for up to `timeout_ms` milliseconds (negative means no
    /// timeout), dispatch ready callbacks, and return how many fired.
    /// Interrupted waits report `Ok(0)`; a genuine syscall failure is fatal
    /// to the loop.
    fn poll_io(&self, timeout_ms: i32) -> Result<usize, PollError>;

    fn close(&self) -> Result<(), PollError>;
}
