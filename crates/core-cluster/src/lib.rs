//! OJP Core Cluster: Pure-logic multinode coordination
//!
//! A fleet of proxy instances cooperatively divides client-requested
//! capacity (connection-pool sizes and the concurrent-XA-transaction
//! budget) so that failure of one instance reallocates capacity to the
//! survivors. This crate holds the process-local half of that protocol:
//!
//! - **Allocations**: per-key capacity records with deterministic ceiling
//!   division across healthy members
//! - **Coordinators**: record allocations, apply healthy-count updates,
//!   advertise per-node targets (they never resize pools directly)
//! - **Health tracker**: parses client-reported health blobs, detects
//!   changes, and fans the new healthy count out to the coordinators
//!
//! Like the resilience crate, this is pure logic: no networking, no
//! storage, no async runtime.

pub mod allocation;
pub mod coordinator;
pub mod error;
pub mod health;

pub use allocation::{PoolAllocation, XaAllocation};
pub use coordinator::{PoolCoordinator, XaCoordinator};
pub use error::ClusterError;
pub use health::{count_healthy, parse_blob, ClusterHealthTracker, EndpointStatus, HealthObserver};
