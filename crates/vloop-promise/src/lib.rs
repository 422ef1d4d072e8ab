//! # vloop-promise
//!
//! Promise/A+ engine for the Velo Loop: chained promises whose handlers run
//! as loop microtasks, thenable assimilation, combinators, channel
//! adapters, and thread offloading via [`promisify`].

mod combinators;
mod errors;
mod promise;
mod promisify;

pub use combinators::{all, all_settled, any, race, SettledOutcome};
pub use errors::{AggregateError, PanicError, SelfResolutionError};
pub use promise::{Promise, PromiseState, Settler, Step, Thenable};
pub use promisify::promisify;

pub use vloop_core::Reason;
