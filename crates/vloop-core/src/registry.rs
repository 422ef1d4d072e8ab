//! Pending-promise registry.
//!
//! Pending promise chains can be cyclic (A resolves with B, B with A), so
//! the loop holds a strong reference to every pending promise and sweeps
//! settled entries with a bounded quantum at the tail of each tick. At
//! shutdown every still-pending entry is rejected with the termination
//! error.

use std::sync::{Arc, Mutex};

use crate::error::Reason;

/// Settlement view the registry needs from a tracked promise.
pub trait Tracked: Send + Sync {
    fn is_settled(&self) -> bool;

    /// Reject if still pending; ignored after settlement.
    fn reject(&self, reason: Reason);
}

struct RegistryInner {
    entries: Vec<Arc<dyn Tracked>>,
    cursor: usize,
}

pub(crate) struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                entries: Vec::new(),
                cursor: 0,
            }),
        }
    }

    pub fn track(&self, entry: Arc<dyn Tracked>) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .push(entry);
    }

    /// Examine up to `quantum` entries, dropping the settled ones. Returns
    /// how many were released.
    pub fn scavenge(&self, quantum: usize) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut released = 0;
        let mut examined = 0;
        while examined < quantum && !inner.entries.is_empty() {
            if inner.cursor >= inner.entries.len() {
                inner.cursor = 0;
            }
            let cursor = inner.cursor;
            if inner.entries[cursor].is_settled() {
                inner.entries.swap_remove(cursor);
                released += 1;
            } else {
                inner.cursor += 1;
            }
            examined += 1;
        }
        released
    }

    /// Reject every pending entry and clear the registry.
    pub fn reject_all(&self, reason: Reason) {
        let entries = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.cursor = 0;
            std::mem::take(&mut inner.entries)
        };
        for entry in entries {
            if !entry.is_settled() {
                entry.reject(reason.clone());
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Fake {
        settled: AtomicBool,
        rejected: AtomicUsize,
    }

    impl Fake {
        fn new(settled: bool) -> Arc<Self> {
            Arc::new(Self {
                settled: AtomicBool::new(settled),
                rejected: AtomicUsize::new(0),
            })
        }
    }

    impl Tracked for Fake {
        fn is_settled(&self) -> bool {
            self.settled.load(Ordering::Acquire)
        }

        fn reject(&self, _reason: Reason) {
            self.rejected.fetch_add(1, Ordering::AcqRel);
            self.settled.store(true, Ordering::Release);
        }
    }

    #[test]
    fn test_scavenge_releases_settled_only() {
        let registry = Registry::new();
        let pending = Fake::new(false);
        registry.track(pending.clone());
        for _ in 0..5 {
            registry.track(Fake::new(true));
        }
        assert_eq!(registry.len(), 6);

        let released = registry.scavenge(20);
        assert_eq!(released, 5);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_scavenge_quantum_bounds_work() {
        let registry = Registry::new();
        for _ in 0..50 {
            registry.track(Fake::new(true));
        }
        assert_eq!(registry.scavenge(20), 20);
        assert_eq!(registry.len(), 30);
    }

    #[test]
    fn test_reject_all_skips_settled() {
        let registry = Registry::new();
        let pending = Fake::new(false);
        let settled = Fake::new(true);
        registry.track(pending.clone());
        registry.track(settled.clone());

        registry.reject_all(Arc::new(std::io::Error::other("terminated")));
        assert_eq!(pending.rejected.load(Ordering::Acquire), 1);
        assert_eq!(settled.rejected.load(Ordering::Acquire), 0);
        assert_eq!(registry.len(), 0);
    }
}
