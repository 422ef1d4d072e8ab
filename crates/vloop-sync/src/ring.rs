//! Growable multi-producer single-consumer ring for microtasks.
//!
//! Producers claim slots with a CAS on the tail sequence; the consumer
//! advances the head. When the ring fills, one producer wins a CAS on the
//! grow flag, waits for in-flight accessors to drain, copies live entries
//! into a buffer of double capacity, and publishes it with a `Release`
//! store; every load of the buffer pointer is `Acquire`. Losers of the grow
//! CAS spin until publication and retry, so `push` has no failure mode once
//! the ring exists.
//!
//! Retired buffers are parked until the ring drops. Doubling growth bounds
//! the parked total below one current capacity, so memory stays bounded.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::{CachePadded, Job};

const INITIAL_CAPACITY: usize = 256;

struct Buffer {
    slots: Box<[UnsafeCell<Option<Job>>]>,
    mask: usize,
}

impl Buffer {
    fn alloc(capacity: usize) -> *mut Buffer {
        debug_assert!(capacity.is_power_of_two());
        let slots: Vec<UnsafeCell<Option<Job>>> =
            (0..capacity).map(|_| UnsafeCell::new(None)).collect();
        Box::into_raw(Box::new(Buffer {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
        }))
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.mask + 1
    }
}

/// Lock-free MPSC queue of [`Job`]s with doubling growth.
pub struct MicrotaskRing {
    // Consumer-owned index, padded to its own cache line.
    head: CachePadded<AtomicUsize>,
    // Producer-claimed index, padded to its own cache line.
    tail: CachePadded<AtomicUsize>,
    // Published backing buffer, read concurrently by every side.
    buf: CachePadded<AtomicPtr<Buffer>>,
    // Grow protocol: flag won by CAS, accessor count drained before copy.
    growing: AtomicBool,
    accessors: AtomicUsize,
    // Old buffers parked until drop. Touched only by the grow winner and
    // by Drop, both exclusive.
    retired: UnsafeCell<Vec<*mut Buffer>>,
}

// Safety: slot access is serialized by the claim CAS (producers), the
// single-consumer contract (head), and the grow flag + accessor quiescence
// (buffer swaps). Jobs are Send.
unsafe impl Send for MicrotaskRing {}
unsafe impl Sync for MicrotaskRing {}

impl Default for MicrotaskRing {
    fn default() -> Self {
        Self::new()
    }
}

impl MicrotaskRing {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(2);
        Self {
            head: CachePadded(AtomicUsize::new(0)),
            tail: CachePadded(AtomicUsize::new(0)),
            buf: CachePadded(AtomicPtr::new(Buffer::alloc(capacity))),
            growing: AtomicBool::new(false),
            accessors: AtomicUsize::new(0),
            retired: UnsafeCell::new(Vec::new()),
        }
    }

    /// Enqueue a job from any thread. Never fails; a full ring grows.
    pub fn push(&self, job: Job) {
        let mut job = job;
        loop {
            match self.try_push(job) {
                Ok(()) => return,
                Err(back) => job = back,
            }
            core::hint::spin_loop();
        }
    }

    fn try_push(&self, job: Job) -> Result<(), Job> {
        if self.growing.load(Ordering::Acquire) {
            return Err(job);
        }
        self.accessors.fetch_add(1, Ordering::AcqRel);
        // The flag may have been won between the check and the increment.
        if self.growing.load(Ordering::Acquire) {
            self.accessors.fetch_sub(1, Ordering::Release);
            return Err(job);
        }

        // Safety: the buffer pointer stays valid while our accessor count
        // holds off any grow; retired buffers are never freed before drop.
        let buf = unsafe { &*self.buf.0.load(Ordering::Acquire) };
        let head = self.head.0.load(Ordering::Acquire);
        let tail = self.tail.0.load(Ordering::Relaxed);

        if tail.wrapping_sub(head) >= buf.capacity() {
            self.accessors.fetch_sub(1, Ordering::Release);
            self.grow(buf.capacity());
            return Err(job);
        }

        // CAS: atomically claim this slot — only one producer succeeds.
        match self.tail.0.compare_exchange_weak(
            tail,
            tail.wrapping_add(1),
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => {
                // Safety: the slot is exclusively ours via the CAS.
                unsafe {
                    *buf.slots[tail & buf.mask].get() = Some(job);
                }
                self.accessors.fetch_sub(1, Ordering::Release);
                Ok(())
            }
            Err(_) => {
                self.accessors.fetch_sub(1, Ordering::Release);
                Err(job)
            }
        }
    }

    /// Dequeue the next job. Only the loop thread calls this.
    pub fn pop(&self) -> Option<Job> {
        loop {
            if self.growing.load(Ordering::Acquire) {
                core::hint::spin_loop();
                continue;
            }
            self.accessors.fetch_add(1, Ordering::AcqRel);
            if self.growing.load(Ordering::Acquire) {
                self.accessors.fetch_sub(1, Ordering::Release);
                core::hint::spin_loop();
                continue;
            }

            // Safety: see try_push.
            let buf = unsafe { &*self.buf.0.load(Ordering::Acquire) };
            let head = self.head.0.load(Ordering::Relaxed);
            let tail = self.tail.0.load(Ordering::Acquire);

            if head == tail {
                self.accessors.fetch_sub(1, Ordering::Release);
                return None;
            }

            // Spin until the producer that claimed this slot finishes its
            // write; the claim CAS guarantees the write is coming.
            let job = loop {
                // Safety: only the consumer takes from the head slot.
                let taken = unsafe { (*buf.slots[head & buf.mask].get()).take() };
                if let Some(job) = taken {
                    break job;
                }
                core::hint::spin_loop();
            };

            self.head.0.store(head.wrapping_add(1), Ordering::Release);
            self.accessors.fetch_sub(1, Ordering::Release);
            return Some(job);
        }
    }

    /// Approximate queue depth; exact when no push races the call.
    pub fn len(&self) -> usize {
        let tail = self.tail.0.load(Ordering::Acquire);
        let head = self.head.0.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn grow(&self, observed_capacity: usize) {
        if self
            .growing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another writer is growing; wait for publication, then retry
            // the push against the new buffer.
            while self.growing.load(Ordering::Acquire) {
                core::hint::spin_loop();
            }
            return;
        }

        // Quiesce in-flight accessors so every claimed slot is written and
        // no pop holds a reference into the old buffer.
        while self.accessors.load(Ordering::Acquire) != 0 {
            core::hint::spin_loop();
        }

        let old_ptr = self.buf.0.load(Ordering::Acquire);
        // Safety: grow winner has exclusive swap rights under the flag.
        let old = unsafe { &*old_ptr };
        if old.capacity() != observed_capacity {
            // A racing grow already replaced the buffer we saw as full.
            self.growing.store(false, Ordering::Release);
            return;
        }

        let head = self.head.0.load(Ordering::Acquire);
        let tail = self.tail.0.load(Ordering::Acquire);
        let new_ptr = Buffer::alloc(old.capacity() * 2);
        let new = unsafe { &*new_ptr };

        let mut seq = head;
        while seq != tail {
            // Safety: accessors are quiesced; both buffers are exclusively
            // ours for the duration of the copy.
            unsafe {
                let item = (*old.slots[seq & old.mask].get()).take();
                *new.slots[seq & new.mask].get() = item;
            }
            seq = seq.wrapping_add(1);
        }

        // Publish, then park the old buffer until drop.
        self.buf.0.store(new_ptr, Ordering::Release);
        unsafe {
            (*self.retired.get()).push(old_ptr);
        }
        self.growing.store(false, Ordering::Release);
    }
}

impl Drop for MicrotaskRing {
    fn drop(&mut self) {
        // Safety: &mut self grants exclusive access; undrained jobs are
        // dropped with their buffers.
        unsafe {
            drop(Box::from_raw(self.buf.0.load(Ordering::Acquire)));
            for ptr in (*self.retired.get()).drain(..) {
                drop(Box::from_raw(ptr));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_push_pop_fifo() {
        let ring = MicrotaskRing::with_capacity(8);
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = log.clone();
            ring.push(Box::new(move || log.lock().unwrap().push(i)));
        }
        assert_eq!(ring.len(), 5);
        while let Some(job) = ring.pop() {
            job();
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_growth_preserves_order() {
        let ring = MicrotaskRing::with_capacity(4);
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        // Well past several doublings without a single pop.
        for i in 0..1000 {
            let log = log.clone();
            ring.push(Box::new(move || log.lock().unwrap().push(i)));
        }
        assert_eq!(ring.len(), 1000);
        while let Some(job) = ring.pop() {
            job();
        }
        let got = log.lock().unwrap();
        assert_eq!(got.len(), 1000);
        assert!(got.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_concurrent_producers_single_consumer() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 5_000;

        let ring = Arc::new(MicrotaskRing::with_capacity(16));
        let executed = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..PRODUCERS {
            let ring = ring.clone();
            let executed = executed.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..PER_PRODUCER {
                    let executed = executed.clone();
                    ring.push(Box::new(move || {
                        executed.fetch_add(1, Ordering::Relaxed);
                    }));
                }
            }));
        }

        let consumer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                let mut drained = 0;
                while drained < PRODUCERS * PER_PRODUCER {
                    if let Some(job) = ring.pop() {
                        job();
                        drained += 1;
                    } else {
                        std::hint::spin_loop();
                    }
                }
            })
        };

        for h in handles {
            h.join().unwrap();
        }
        consumer.join().unwrap();
        assert_eq!(executed.load(Ordering::Relaxed), PRODUCERS * PER_PRODUCER);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_drop_releases_undrained_jobs() {
        let witness = Arc::new(());
        {
            let ring = MicrotaskRing::with_capacity(4);
            for _ in 0..10 {
                let held = witness.clone();
                ring.push(Box::new(move || {
                    let _ = &held;
                }));
            }
        }
        assert_eq!(Arc::strong_count(&witness), 1);
    }
}
