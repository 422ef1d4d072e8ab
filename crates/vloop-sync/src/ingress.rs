//! Chunked FIFO queues for task ingress.
//!
//! A linked list of fixed-size chunks behind one mutex. Producers append at
//! the tail chunk, the consumer drains from the head chunk in batches of up
//! to [`INGRESS_BATCH_MAX`] per lock acquisition. Under producer contention
//! a single uncontended mutex beats CAS retry storms, which is why this
//! queue is locked while the microtask ring is not.
//!
//! Methods that require the lock live on the private `ChunkList` with a
//! `_locked` suffix; [`IngressGuard`] is the only way to reach them.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::Job;

const CHUNK_SIZE: usize = 128;

/// Upper bound on tasks moved out per lock acquisition.
pub const INGRESS_BATCH_MAX: usize = 256;

struct Chunk {
    slots: [Option<Job>; CHUNK_SIZE],
    read: usize,
    write: usize,
}

impl Chunk {
    fn new() -> Box<Self> {
        Box::new(Self {
            slots: [const { None }; CHUNK_SIZE],
            read: 0,
            write: 0,
        })
    }

    fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.write == CHUNK_SIZE
    }

    #[inline]
    fn is_exhausted(&self) -> bool {
        self.read == self.write
    }
}

struct ChunkList {
    chunks: VecDeque<Box<Chunk>>,
    // One drained chunk kept for reuse; steady-state push/pop cycles do
    // not allocate.
    spare: Option<Box<Chunk>>,
    len: usize,
}

impl ChunkList {
    fn push_locked(&mut self, job: Job) {
        let needs_chunk = match self.chunks.back() {
            Some(tail) => tail.is_full(),
            None => true,
        };
        if needs_chunk {
            let chunk = match self.spare.take() {
                Some(mut spare) => {
                    spare.reset();
                    spare
                }
                None => Chunk::new(),
            };
            self.chunks.push_back(chunk);
        }
        let tail = self.chunks.back_mut().unwrap();
        tail.slots[tail.write] = Some(job);
        tail.write += 1;
        self.len += 1;
    }

    fn pop_locked(&mut self) -> Option<Job> {
        loop {
            let head = self.chunks.front_mut()?;
            if head.is_exhausted() {
                if head.is_full() {
                    // Fully consumed chunk; recycle it and move on.
                    let drained = self.chunks.pop_front().unwrap();
                    if self.spare.is_none() {
                        self.spare = Some(drained);
                    }
                    continue;
                }
                // Tail chunk with no unread entries: queue is empty.
                return None;
            }
            let job = head.slots[head.read].take();
            head.read += 1;
            self.len -= 1;
            return job;
        }
    }

    #[inline]
    fn len_locked(&self) -> usize {
        self.len
    }
}

/// Mutex-serialized FIFO of [`Job`]s.
pub struct IngressQueue {
    inner: Mutex<ChunkList>,
}

impl Default for IngressQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl IngressQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ChunkList {
                chunks: VecDeque::new(),
                spare: None,
                len: 0,
            }),
        }
    }

    /// Take the queue lock. Callers that must pair a gate check with the
    /// push (submission atomicity) hold the guard across both.
    pub fn lock(&self) -> IngressGuard<'_> {
        IngressGuard(self.inner.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn push(&self, job: Job) {
        self.lock().push(job);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move up to `max` jobs into `out` under a single lock acquisition.
    pub fn pop_batch(&self, out: &mut Vec<Job>, max: usize) -> usize {
        let mut guard = self.lock();
        let mut moved = 0;
        while moved < max {
            match guard.pop() {
                Some(job) => {
                    out.push(job);
                    moved += 1;
                }
                None => break,
            }
        }
        moved
    }
}

/// Proof of holding the queue mutex.
pub struct IngressGuard<'a>(MutexGuard<'a, ChunkList>);

impl IngressGuard<'_> {
    pub fn push(&mut self, job: Job) {
        self.0.push_locked(job);
    }

    pub fn pop(&mut self) -> Option<Job> {
        self.0.pop_locked()
    }

    pub fn len(&self) -> usize {
        self.0.len_locked()
    }

    pub fn is_empty(&self) -> bool {
        self.0.len_locked() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fifo_across_chunk_boundary() {
        let q = IngressQueue::new();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        // Three chunks' worth.
        for i in 0..(CHUNK_SIZE * 3) {
            let log = log.clone();
            q.push(Box::new(move || log.lock().unwrap().push(i)));
        }
        assert_eq!(q.len(), CHUNK_SIZE * 3);

        let mut guard = q.lock();
        while let Some(job) = guard.pop() {
            job();
        }
        drop(guard);

        let got = log.lock().unwrap();
        assert_eq!(got.len(), CHUNK_SIZE * 3);
        assert!(got.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_pop_batch_respects_max() {
        let q = IngressQueue::new();
        for _ in 0..500 {
            q.push(Box::new(|| {}));
        }
        let mut batch = Vec::new();
        assert_eq!(q.pop_batch(&mut batch, INGRESS_BATCH_MAX), INGRESS_BATCH_MAX);
        assert_eq!(q.len(), 500 - INGRESS_BATCH_MAX);
        assert_eq!(q.pop_batch(&mut batch, INGRESS_BATCH_MAX), 500 - INGRESS_BATCH_MAX);
        assert_eq!(q.pop_batch(&mut batch, INGRESS_BATCH_MAX), 0);
    }

    #[test]
    fn test_interleaved_push_pop_reuses_chunks() {
        let q = IngressQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));
        for round in 0..10 {
            for _ in 0..200 {
                let ran = ran.clone();
                q.push(Box::new(move || {
                    ran.fetch_add(1, Ordering::Relaxed);
                }));
            }
            let mut batch = Vec::new();
            while q.pop_batch(&mut batch, INGRESS_BATCH_MAX) > 0 {}
            for job in batch.drain(..) {
                job();
            }
            assert_eq!(ran.load(Ordering::Relaxed), (round + 1) * 200);
            assert!(q.is_empty());
        }
    }

    #[test]
    fn test_concurrent_producers() {
        const PRODUCERS: usize = 16;
        const PER_PRODUCER: usize = 2_000;

        let q = Arc::new(IngressQueue::new());
        let mut handles = vec![];
        for _ in 0..PRODUCERS {
            let q = q.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..PER_PRODUCER {
                    q.push(Box::new(|| {}));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(q.len(), PRODUCERS * PER_PRODUCER);
    }
}
