//! OJP Core Resilience: Pure-logic admission control primitives
//!
//! # Overview
//!
//! This crate provides the building blocks the proxy uses to protect its
//! backends under partial failure:
//!
//! - **Circuit Breaker**: per-key fail-fast protection for a failing backend
//! - **Connection Pool**: connection reuse with health checking, cooperative
//!   resizing, and lifecycle management
//! - **Slow-Query Segregation**: fast/slow lane admission so expensive
//!   queries cannot occupy every pool slot
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - The database backend or its driver
//! - The wire protocol (gRPC, serialization)
//! - Application-specific concerns
//!
//! The dispatcher composes these primitives around each RPC:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Request Dispatcher              │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail-fast per backend key
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Slow-Query Segregator             │  ← Fast/slow slot admission
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Connection Pool                   │  ← Reuse, health, resize
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!          Backend Database
//! ```

pub mod circuit_breaker;
pub mod connection_pool;
pub mod error;
pub mod segregation;

// Re-export main types for convenience
pub use circuit_breaker::{BreakerConfig, BreakerRegistry, CircuitBreaker, CircuitState};
pub use connection_pool::{ConnectionFactory, ConnectionPool, PoolConfig, PoolStats};
pub use error::ResilienceError;
pub use segregation::{Lane, QuerySegregator, SegregationConfig, SlotPermit};

/// Prelude module for convenient imports
pub mod prelude {
    pub use super::circuit_breaker::{BreakerConfig, BreakerRegistry, CircuitBreaker};
    pub use super::connection_pool::{ConnectionFactory, ConnectionPool, PoolConfig};
    pub use super::error::ResilienceError;
    pub use super::segregation::{Lane, QuerySegregator, SegregationConfig};
}
