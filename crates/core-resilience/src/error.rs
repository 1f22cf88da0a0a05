//! Error types for admission control primitives

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the admission-control layer.
///
/// These carry no knowledge of the backend or the wire protocol; the
/// dispatcher maps them into wire status codes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResilienceError {
    /// The circuit for this key is open; no call was attempted.
    #[error("circuit open for key '{key}'")]
    CircuitOpen { key: String },

    /// Waiting for a slot or a pooled connection exceeded the deadline.
    #[error("timed out after {0:?} waiting for admission")]
    Timeout(Duration),

    /// The slow-lane wait queue is full.
    #[error("overloaded: {0}")]
    Overloaded(String),

    /// The pool has no capacity and cannot grow.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// The pool has been closed.
    #[error("connection pool closed")]
    PoolClosed,

    /// Creating a new pooled connection failed.
    #[error("connection setup failed: {0}")]
    Setup(String),
}
