//! Fast ↔ I/O dispatch-mode transitions against a real epoll poller.

use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::fcntl::OFlag;
use nix::unistd;

use vloop_core::{EventLoop, FastPathMode, IoCallback, IoEvents, LoopError, Options};
use vloop_poll::EpollPoller;

fn start_loop() -> (EventLoop, thread::JoinHandle<Result<(), LoopError>>) {
    let poller = Box::new(EpollPoller::new().unwrap());
    let lp = EventLoop::new(Options::new().poller(poller)).unwrap();
    let handle = {
        let lp = lp.clone();
        thread::spawn(move || lp.run())
    };
    (lp, handle)
}

fn wait_for<F: Fn() -> bool>(cond: F, deadline: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

#[test]
fn test_fast_to_io_and_back_executes_every_task() {
    let (lp, handle) = start_loop();
    let executed = Arc::new(AtomicUsize::new(0));

    // Fast path: no user descriptors registered.
    {
        let executed = executed.clone();
        lp.submit(move || {
            executed.fetch_add(1, Ordering::AcqRel);
        })
        .unwrap();
    }
    assert!(wait_for(
        || executed.load(Ordering::Acquire) == 1,
        Duration::from_secs(2)
    ));

    // Register a pipe read end: the loop must move to the poller path and
    // keep executing submissions.
    let (read_fd, write_fd) = unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).unwrap();
    let readable_hits = Arc::new(AtomicUsize::new(0));
    let callback: IoCallback = {
        let readable_hits = readable_hits.clone();
        let raw = read_fd.as_raw_fd();
        Arc::new(move |events| {
            assert!(events.contains(IoEvents::READABLE));
            // Drain so level-triggered epoll quiesces.
            let mut buf = [0u8; 16];
            let _ = unistd::read(raw, &mut buf);
            readable_hits.fetch_add(1, Ordering::AcqRel);
        })
    };
    lp.register_fd(read_fd.as_raw_fd(), IoEvents::READABLE, callback)
        .unwrap();

    {
        let executed = executed.clone();
        lp.submit(move || {
            executed.fetch_add(1, Ordering::AcqRel);
        })
        .unwrap();
    }
    assert!(wait_for(
        || executed.load(Ordering::Acquire) == 2,
        Duration::from_secs(2)
    ));

    unistd::write(&write_fd, b"ping").unwrap();
    assert!(wait_for(
        || readable_hits.load(Ordering::Acquire) == 1,
        Duration::from_secs(2)
    ));

    // Unregister: back to the fast path, still executing.
    lp.unregister_fd(read_fd.as_raw_fd()).unwrap();
    {
        let executed = executed.clone();
        lp.submit(move || {
            executed.fetch_add(1, Ordering::AcqRel);
        })
        .unwrap();
    }
    assert!(wait_for(
        || executed.load(Ordering::Acquire) == 3,
        Duration::from_secs(2)
    ));

    lp.shutdown(None).unwrap();
    handle.join().unwrap().unwrap();
    assert_eq!(executed.load(Ordering::Acquire), 3);
}

#[test]
fn test_fd_callback_microtasks_drain_same_tick() {
    let (lp, handle) = start_loop();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let (read_fd, write_fd) = unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).unwrap();
    let callback: IoCallback = {
        let order = order.clone();
        let lp = lp.clone();
        let raw = read_fd.as_raw_fd();
        Arc::new(move |_| {
            let mut buf = [0u8; 16];
            let _ = unistd::read(raw, &mut buf);
            order.lock().unwrap().push("fd");
            let order = order.clone();
            lp.schedule_microtask(move || order.lock().unwrap().push("micro"))
                .unwrap();
        })
    };
    lp.register_fd(read_fd.as_raw_fd(), IoEvents::READABLE, callback)
        .unwrap();

    unistd::write(&write_fd, b"x").unwrap();
    assert!(wait_for(
        || order.lock().unwrap().len() == 2,
        Duration::from_secs(2)
    ));
    assert_eq!(*order.lock().unwrap(), vec!["fd", "micro"]);

    lp.unregister_fd(read_fd.as_raw_fd()).unwrap();
    lp.shutdown(None).unwrap();
    handle.join().unwrap().unwrap();
}

#[test]
fn test_forced_mode_rejects_registration() {
    let (lp, handle) = start_loop();

    lp.set_fast_path_mode(FastPathMode::Forced).unwrap();
    let (read_fd, _write_fd) = unistd::pipe2(OFlag::O_NONBLOCK).unwrap();
    let callback: IoCallback = Arc::new(|_| {});
    assert!(matches!(
        lp.register_fd(read_fd.as_raw_fd(), IoEvents::READABLE, callback),
        Err(LoopError::FastPathIncompatible)
    ));

    lp.shutdown(None).unwrap();
    handle.join().unwrap().unwrap();
}

#[test]
fn test_forced_mode_blocked_by_registered_fd() {
    let (lp, handle) = start_loop();

    let (read_fd, _write_fd) = unistd::pipe2(OFlag::O_NONBLOCK).unwrap();
    let callback: IoCallback = Arc::new(|_| {});
    lp.register_fd(read_fd.as_raw_fd(), IoEvents::READABLE, callback)
        .unwrap();

    assert!(matches!(
        lp.set_fast_path_mode(FastPathMode::Forced),
        Err(LoopError::FastPathIncompatible)
    ));

    lp.unregister_fd(read_fd.as_raw_fd()).unwrap();
    lp.set_fast_path_mode(FastPathMode::Forced).unwrap();
    assert_eq!(lp.fast_path_mode(), FastPathMode::Forced);

    lp.shutdown(None).unwrap();
    handle.join().unwrap().unwrap();
}

#[test]
fn test_register_vs_forced_race_keeps_invariant() {
    for _ in 0..20 {
        let (lp, handle) = start_loop();
        let (read_fd, _write_fd) = unistd::pipe2(OFlag::O_NONBLOCK).unwrap();

        let register = {
            let lp = lp.clone();
            let raw = read_fd.as_raw_fd();
            thread::spawn(move || {
                let callback: IoCallback = Arc::new(|_| {});
                lp.register_fd(raw, IoEvents::READABLE, callback)
            })
        };
        let force = {
            let lp = lp.clone();
            thread::spawn(move || lp.set_fast_path_mode(FastPathMode::Forced))
        };

        let register_result = register.join().unwrap();
        let force_result = force.join().unwrap();

        // Whichever interleaving happened, conflicting intents cannot both
        // win.
        assert!(
            register_result.is_err() || force_result.is_err(),
            "register {register_result:?} force {force_result:?}"
        );
        // The surviving state is safe: forced mode implies no registered
        // descriptors, demonstrated by a probe registration.
        if lp.fast_path_mode() == FastPathMode::Forced {
            let (probe_fd, _probe_write) = unistd::pipe2(OFlag::O_NONBLOCK).unwrap();
            let callback: IoCallback = Arc::new(|_| {});
            assert!(matches!(
                lp.register_fd(probe_fd.as_raw_fd(), IoEvents::READABLE, callback),
                Err(LoopError::FastPathIncompatible)
            ));
        }

        lp.shutdown(None).unwrap();
        handle.join().unwrap().unwrap();
    }
}
