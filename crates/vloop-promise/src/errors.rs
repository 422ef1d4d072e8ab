//! Rejection reasons minted by the engine itself.

use std::any::Any;

use thiserror::Error;

use vloop_core::Reason;

/// A recovered panic from a handler or offloaded closure, carried as a
/// rejection reason.
#[derive(Debug, Error)]
#[error("panic in promise handler: {message}")]
pub struct PanicError {
    pub message: String,
}

impl PanicError {
    pub fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self { message }
    }
}

/// Rejection reason of `any` when every input rejected.
#[derive(Debug, Error)]
#[error("all promises were rejected ({} reasons)", .reasons.len())]
pub struct AggregateError {
    pub reasons: Vec<Reason>,
}

/// A promise resolved with itself can never settle.
#[derive(Debug, Error)]
#[error("promise cannot be resolved with itself")]
pub struct SelfResolutionError;
