//! # vloop-poll
//!
//! Linux implementation of the [`Poller`] capability over epoll.
//!
//! Callbacks are dispatched from inside [`Poller::poll_io`], on the thread
//! that polls (the loop thread). Registration may come from any thread; the
//! fd → callback table is behind its own mutex, held only for lookups and
//! never across a callback invocation.

use std::collections::HashMap;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use tracing::{debug, trace};

use vloop_core::{IoCallback, IoEvents, PollError, Poller};

const EVENT_CAPACITY: usize = 64;

fn interest_flags(events: IoEvents) -> EpollFlags {
    let mut flags = EpollFlags::empty();
    if events.contains(IoEvents::READABLE) {
        flags |= EpollFlags::EPOLLIN;
    }
    if events.contains(IoEvents::WRITABLE) {
        flags |= EpollFlags::EPOLLOUT;
    }
    flags
}

fn readiness(flags: EpollFlags) -> IoEvents {
    let mut events = IoEvents::empty();
    if flags.contains(EpollFlags::EPOLLIN) {
        events |= IoEvents::READABLE;
    }
    if flags.contains(EpollFlags::EPOLLOUT) {
        events |= IoEvents::WRITABLE;
    }
    if flags.contains(EpollFlags::EPOLLERR) {
        events |= IoEvents::ERROR;
    }
    if flags.contains(EpollFlags::EPOLLHUP) {
        events |= IoEvents::HANGUP;
    }
    events
}

fn os_error(errno: Errno) -> PollError {
    PollError::Io(io::Error::from(errno))
}

/// epoll-backed readiness poller.
pub struct EpollPoller {
    epoll: Epoll,
    callbacks: Mutex<HashMap<RawFd, IoCallback>>,
    closed: AtomicBool,
}

impl EpollPoller {
    pub fn new() -> Result<Self, PollError> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(os_error)?;
        Ok(Self {
            epoll,
            callbacks: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<(), PollError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PollError::Closed);
        }
        Ok(())
    }
}

impl Poller for EpollPoller {
    fn init(&self) -> Result<(), PollError> {
        self.check_open()
    }

    fn register_fd(
        &self,
        fd: RawFd,
        events: IoEvents,
        callback: IoCallback,
    ) -> Result<(), PollError> {
        self.check_open()?;
        let mut callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        if callbacks.contains_key(&fd) {
            return Err(PollError::AlreadyRegistered(fd));
        }
        // Safety: the caller owns fd for the duration of the registration;
        // the borrow lives only for the epoll_ctl call.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let event = EpollEvent::new(interest_flags(events), fd as u64);
        match self.epoll.add(borrowed, event) {
            Ok(()) => {
                callbacks.insert(fd, callback);
                debug!(fd, "registered fd");
                Ok(())
            }
            Err(Errno::EEXIST) => Err(PollError::AlreadyRegistered(fd)),
            Err(e) => Err(os_error(e)),
        }
    }

    fn unregister_fd(&self, fd: RawFd) -> Result<(), PollError> {
        self.check_open()?;
        let mut callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        if callbacks.remove(&fd).is_none() {
            return Err(PollError::FdNotRegistered(fd));
        }
        // Safety: see register_fd.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match self.epoll.delete(borrowed) {
            Ok(()) => {
                debug!(fd, "unregistered fd");
                Ok(())
            }
            // The kernel already dropped it (fd closed early); the table
            // removal above is what matters.
            Err(Errno::ENOENT) | Err(Errno::EBADF) => Ok(()),
            Err(e) => Err(os_error(e)),
        }
    }

    fn modify_fd(&self, fd: RawFd, events: IoEvents) -> Result<(), PollError> {
        self.check_open()?;
        let callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        if !callbacks.contains_key(&fd) {
            return Err(PollError::FdNotRegistered(fd));
        }
        // Safety: see register_fd.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut event = EpollEvent::new(interest_flags(events), fd as u64);
        match self.epoll.modify(borrowed, &mut event) {
            Ok(()) => Ok(()),
            Err(Errno::ENOENT) => Err(PollError::FdNotRegistered(fd)),
            Err(e) => Err(os_error(e)),
        }
    }

    fn poll_io(&self, timeout_ms: i32) -> Result<usize, PollError> {
        self.check_open()?;
        let timeout = if timeout_ms < 0 {
            EpollTimeout::NONE
        } else {
            // epoll takes a u16 tenure here; the loop re-arms after each
            // wake, so longer timer waits degrade to an extra wake.
            EpollTimeout::from(u16::try_from(timeout_ms).unwrap_or(u16::MAX))
        };

        let mut events = [EpollEvent::empty(); EVENT_CAPACITY];
        let ready = match self.epoll.wait(&mut events, timeout) {
            Ok(n) => n,
            // An interrupted wait is a spurious wake, not a failure.
            Err(Errno::EINTR) => return Ok(0),
            Err(e) => return Err(os_error(e)),
        };

        let mut dispatched = 0;
        for event in &events[..ready] {
            let fd = event.data() as RawFd;
            let callback = {
                let callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
                callbacks.get(&fd).cloned()
            };
            match callback {
                Some(callback) => {
                    trace!(fd, "dispatching readiness");
                    callback(readiness(event.events()));
                    dispatched += 1;
                }
                // Unregistered between wait and dispatch; stale event.
                None => trace!(fd, "dropping event for unregistered fd"),
            }
        }
        Ok(dispatched)
    }

    fn close(&self) -> Result<(), PollError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(PollError::Closed);
        }
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        // The epoll descriptor itself is released when the poller drops.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use nix::fcntl::OFlag;
    use nix::unistd;

    #[test]
    fn test_register_poll_dispatch() {
        let poller = EpollPoller::new().unwrap();
        poller.init().unwrap();

        let (read_fd, write_fd) = unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let callback: IoCallback = {
            let hits = hits.clone();
            Arc::new(move |events| {
                assert!(events.contains(IoEvents::READABLE));
                hits.fetch_add(1, Ordering::AcqRel);
            })
        };
        poller
            .register_fd(read_fd.as_raw_fd(), IoEvents::READABLE, callback)
            .unwrap();

        // Nothing readable yet.
        assert_eq!(poller.poll_io(0).unwrap(), 0);

        unistd::write(&write_fd, b"x").unwrap();
        assert_eq!(poller.poll_io(1000).unwrap(), 1);
        assert_eq!(hits.load(Ordering::Acquire), 1);

        poller.unregister_fd(read_fd.as_raw_fd()).unwrap();
    }

    #[test]
    fn test_double_register_rejected() {
        let poller = EpollPoller::new().unwrap();
        let (read_fd, _write_fd) = unistd::pipe2(OFlag::O_NONBLOCK).unwrap();
        let callback: IoCallback = Arc::new(|_| {});

        poller
            .register_fd(read_fd.as_raw_fd(), IoEvents::READABLE, callback.clone())
            .unwrap();
        assert!(matches!(
            poller.register_fd(read_fd.as_raw_fd(), IoEvents::READABLE, callback),
            Err(PollError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_unregister_unknown_fd() {
        let poller = EpollPoller::new().unwrap();
        assert!(matches!(
            poller.unregister_fd(9999),
            Err(PollError::FdNotRegistered(9999))
        ));
    }

    #[test]
    fn test_modify_requires_registration() {
        let poller = EpollPoller::new().unwrap();
        assert!(matches!(
            poller.modify_fd(9999, IoEvents::WRITABLE),
            Err(PollError::FdNotRegistered(9999))
        ));
    }

    #[test]
    fn test_close_is_single_shot() {
        let poller = EpollPoller::new().unwrap();
        poller.close().unwrap();
        assert!(matches!(poller.close(), Err(PollError::Closed)));
        assert!(matches!(poller.poll_io(0), Err(PollError::Closed)));
    }
}
