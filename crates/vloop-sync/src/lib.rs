//! # vloop-sync
//!
//! Concurrency primitives backing the Velo Loop event loop: the loop state
//! word, the growable MPSC microtask ring, and the chunked ingress queue.
//! Everything here is single-consumer: any thread may produce, exactly one
//! thread (the loop) consumes.

mod ingress;
mod ring;
mod state;

pub use ingress::{IngressGuard, IngressQueue, INGRESS_BATCH_MAX};
pub use ring::MicrotaskRing;
pub use state::{FastState, LoopState};

/// A callable run exactly once by the loop thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Force 128-byte alignment to keep a value on its own cache-line pair.
/// Modern CPUs prefetch adjacent cache lines, so double line size is used.
#[repr(align(128))]
pub(crate) struct CachePadded<T>(pub T);
