//! Facade behavior: timeouts, intervals, immediates, microtask ordering.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use vloop_core::{EventLoop, LoopError, Options};
use vloop_js::JsRuntime;

fn start_runtime() -> (JsRuntime, thread::JoinHandle<Result<(), LoopError>>) {
    let lp = EventLoop::new(Options::new()).unwrap();
    let handle = {
        let lp = lp.clone();
        thread::spawn(move || lp.run())
    };
    (JsRuntime::new(lp), handle)
}

fn stop_runtime(rt: &JsRuntime, handle: thread::JoinHandle<Result<(), LoopError>>) {
    rt.event_loop().shutdown(None).unwrap();
    handle.join().unwrap().unwrap();
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
fn test_set_timeout_fires_once() {
    let (rt, handle) = start_runtime();
    let fired = Arc::new(AtomicUsize::new(0));

    {
        let fired = fired.clone();
        rt.set_timeout(Duration::from_millis(5), move || {
            fired.fetch_add(1, Ordering::AcqRel);
        })
        .unwrap();
    }
    assert!(wait_for(
        || fired.load(Ordering::Acquire) == 1,
        Duration::from_secs(2)
    ));
    thread::sleep(Duration::from_millis(30));
    assert_eq!(fired.load(Ordering::Acquire), 1);

    stop_runtime(&rt, handle);
}

#[test]
fn test_clear_timeout_suppresses_callback() {
    let (rt, handle) = start_runtime();
    let fired = Arc::new(AtomicUsize::new(0));

    let id = {
        let fired = fired.clone();
        rt.set_timeout(Duration::from_millis(40), move || {
            fired.fetch_add(1, Ordering::AcqRel);
        })
        .unwrap()
    };
    rt.clear_timeout(id).unwrap();
    assert!(matches!(
        rt.clear_timeout(id),
        Err(LoopError::TimerNotFound(_))
    ));

    thread::sleep(Duration::from_millis(80));
    assert_eq!(fired.load(Ordering::Acquire), 0);

    stop_runtime(&rt, handle);
}

#[test]
fn test_zero_delay_timeout_runs_promptly() {
    let (rt, handle) = start_runtime();
    let fired = Arc::new(AtomicUsize::new(0));

    let queued_at = Instant::now();
    {
        let fired = fired.clone();
        rt.set_timeout(Duration::ZERO, move || {
            fired.fetch_add(1, Ordering::AcqRel);
        })
        .unwrap();
    }
    assert!(wait_for(
        || fired.load(Ordering::Acquire) == 1,
        Duration::from_secs(2)
    ));
    // Unclamped at nesting level 1: a tick turnaround, not 4 ms.
    assert!(queued_at.elapsed() < Duration::from_millis(50));

    stop_runtime(&rt, handle);
}

#[test]
fn test_interval_repeats_until_cleared() {
    let (rt, handle) = start_runtime();
    let ticks = Arc::new(AtomicUsize::new(0));

    let id = {
        let ticks = ticks.clone();
        rt.set_interval(Duration::from_millis(5), move || {
            ticks.fetch_add(1, Ordering::AcqRel);
        })
        .unwrap()
    };
    assert!(wait_for(
        || ticks.load(Ordering::Acquire) >= 3,
        Duration::from_secs(2)
    ));

    rt.clear_interval(id).unwrap();
    assert!(matches!(
        rt.clear_interval(id),
        Err(LoopError::IntervalNotFound(_))
    ));

    let settled = ticks.load(Ordering::Acquire);
    thread::sleep(Duration::from_millis(50));
    // One in-flight rotation may land; the chain must stop after that.
    assert!(ticks.load(Ordering::Acquire) <= settled + 1);

    stop_runtime(&rt, handle);
}

#[test]
fn test_set_immediate_runs_and_clear_cancels() {
    let (rt, handle) = start_runtime();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    // Schedule-and-cancel from the loop thread: the immediate is enqueued,
    // never synchronous, so the cancel deterministically wins.
    {
        let rt2 = rt.clone();
        let order = order.clone();
        rt.event_loop()
            .submit(move || {
                order.lock().unwrap().push("task");
                let canceled_order = order.clone();
                let id = rt2
                    .set_immediate(move || canceled_order.lock().unwrap().push("canceled"))
                    .unwrap();
                rt2.clear_immediate(id).unwrap();

                let kept_order = order.clone();
                rt2.set_immediate(move || kept_order.lock().unwrap().push("kept"))
                    .unwrap();
            })
            .unwrap();
    }

    assert!(wait_for(
        || order.lock().unwrap().len() == 2,
        Duration::from_secs(2)
    ));
    assert_eq!(*order.lock().unwrap(), vec!["task", "kept"]);
    assert!(matches!(
        rt.clear_immediate(12345),
        Err(LoopError::ImmediateNotFound(12345))
    ));

    stop_runtime(&rt, handle);
}

#[test]
fn test_microtask_and_next_tick_ordering() {
    let (rt, handle) = start_runtime();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let rt2 = rt.clone();
        let order = order.clone();
        rt.event_loop()
            .submit(move || {
                order.lock().unwrap().push("task");
                let micro_order = order.clone();
                rt2.queue_microtask(move || micro_order.lock().unwrap().push("micro"))
                    .unwrap();
                let tick_order = order.clone();
                rt2.next_tick(move || tick_order.lock().unwrap().push("next-tick"))
                    .unwrap();
            })
            .unwrap();
    }

    assert!(wait_for(
        || order.lock().unwrap().len() == 3,
        Duration::from_secs(2)
    ));
    // next_tick outranks queued microtasks inside one drain pass.
    assert_eq!(*order.lock().unwrap(), vec!["task", "next-tick", "micro"]);

    stop_runtime(&rt, handle);
}

#[test]
fn test_facade_rejects_after_termination() {
    let (rt, handle) = start_runtime();
    stop_runtime(&rt, handle);

    assert!(matches!(
        rt.set_timeout(Duration::ZERO, || {}),
        Err(LoopError::Terminated)
    ));
    assert!(matches!(
        rt.set_interval(Duration::from_millis(1), || {}),
        Err(LoopError::Terminated)
    ));
    assert!(matches!(rt.set_immediate(|| {}), Err(LoopError::Terminated)));
    assert!(matches!(
        rt.queue_microtask(|| {}),
        Err(LoopError::Terminated)
    ));
}
