//! Loop lifecycle state machine.
//!
//! A single atomic word holds the current state, isolated on its own cache
//! line so state polling by producers never contends with neighboring loop
//! fields. The primitive imposes no transition graph; callers enforce the
//! forward-only policy (`Awake → Running → (Sleeping ↔ Running)* →
//! Terminating → Terminated`).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::CachePadded;

/// Lifecycle states of an event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u64)]
pub enum LoopState {
    /// Constructed, never run.
    Awake = 0,
    /// The loop thread is executing a tick.
    Running = 1,
    /// The loop thread is blocked waiting for work.
    Sleeping = 2,
    /// Shutdown requested; the drain sequence is in progress.
    Terminating = 3,
    /// The loop has exited and released its resources.
    Terminated = 4,
}

impl LoopState {
    fn from_word(word: u64) -> Self {
        match word {
            0 => LoopState::Awake,
            1 => LoopState::Running,
            2 => LoopState::Sleeping,
            3 => LoopState::Terminating,
            _ => LoopState::Terminated,
        }
    }
}

/// Atomic holder for a [`LoopState`].
pub struct FastState {
    word: CachePadded<AtomicU64>,
}

impl FastState {
    pub const fn new(initial: LoopState) -> Self {
        Self {
            word: CachePadded(AtomicU64::new(initial as u64)),
        }
    }

    #[inline]
    pub fn load(&self) -> LoopState {
        LoopState::from_word(self.word.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, next: LoopState) {
        self.word.0.store(next as u64, Ordering::Release);
    }

    /// Compare-and-swap from `from` to `to`. Returns false if the current
    /// state was not `from`.
    #[inline]
    pub fn try_transition(&self, from: LoopState, to: LoopState) -> bool {
        self.word
            .0
            .compare_exchange(from as u64, to as u64, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl std::fmt::Debug for FastState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FastState").field(&self.load()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let s = FastState::new(LoopState::Awake);
        assert_eq!(s.load(), LoopState::Awake);
    }

    #[test]
    fn test_try_transition() {
        let s = FastState::new(LoopState::Awake);
        assert!(s.try_transition(LoopState::Awake, LoopState::Running));
        assert_eq!(s.load(), LoopState::Running);

        // Stale expectation fails and leaves the state untouched.
        assert!(!s.try_transition(LoopState::Awake, LoopState::Terminated));
        assert_eq!(s.load(), LoopState::Running);
    }

    #[test]
    fn test_store_overwrites() {
        let s = FastState::new(LoopState::Running);
        s.store(LoopState::Terminating);
        assert_eq!(s.load(), LoopState::Terminating);
    }

    #[test]
    fn test_concurrent_single_winner() {
        use std::sync::Arc;

        let s = Arc::new(FastState::new(LoopState::Running));
        let mut handles = vec![];
        for _ in 0..8 {
            let s = s.clone();
            handles.push(std::thread::spawn(move || {
                s.try_transition(LoopState::Running, LoopState::Terminating)
            }));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(wins, 1);
        assert_eq!(s.load(), LoopState::Terminating);
    }
}
