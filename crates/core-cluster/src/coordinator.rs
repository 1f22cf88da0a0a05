//! Multinode capacity coordinators
//!
//! One coordinator instance lives in each proxy process. It records the
//! client-requested capacity per connection key and divides it by the
//! observed healthy-member count. Coordinators never resize pools
//! themselves: they advertise targets, and the pool layer reads the current
//! allocation on its next acquisition or maintenance cycle. Every node runs
//! the same deterministic division, so a consistent healthy count yields a
//! consistent cluster-wide capacity sum.

use crate::allocation::{PoolAllocation, XaAllocation};
use crate::health::HealthObserver;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, info};

/// Divides connection-pool capacity across healthy cluster members.
#[derive(Default)]
pub struct PoolCoordinator {
    allocations: RwLock<HashMap<String, PoolAllocation>>,
}

impl PoolCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the pool sizes for a connection key.
    ///
    /// With no endpoints the request is single-node and nothing is
    /// recorded. With endpoints the allocation is recorded (replacing any
    /// previous one for the key) and the divided sizes are returned.
    pub fn calculate_pool_sizes(
        &self,
        conn_hash: &str,
        requested_max: usize,
        requested_min_idle: usize,
        endpoints: &[String],
    ) -> PoolAllocation {
        if endpoints.is_empty() {
            return PoolAllocation::single_node(requested_max, requested_min_idle);
        }

        let alloc = PoolAllocation::clustered(requested_max, requested_min_idle, endpoints.len());
        info!(
            conn_hash,
            total = alloc.total_servers,
            current_max = alloc.current_max(),
            "recorded clustered pool allocation"
        );
        if let Ok(mut allocations) = self.allocations.write() {
            allocations.insert(conn_hash.to_string(), alloc.clone());
        }
        alloc
    }

    /// Replace the healthy-member count for a key. The next pool-size query
    /// observes the new division. Unknown keys are ignored.
    pub fn update_healthy_servers(&self, conn_hash: &str, healthy: usize) {
        let Ok(mut allocations) = self.allocations.write() else {
            return;
        };
        if let Some(alloc) = allocations.get_mut(conn_hash) {
            alloc.set_healthy_servers(healthy);
            debug!(
                conn_hash,
                healthy = alloc.healthy_servers,
                current_max = alloc.current_max(),
                "pool allocation rebalanced"
            );
        }
    }

    /// Current allocation for a key, if one was recorded.
    pub fn current(&self, conn_hash: &str) -> Option<PoolAllocation> {
        self.allocations.read().ok()?.get(conn_hash).cloned()
    }
}

impl HealthObserver for PoolCoordinator {
    fn on_healthy_count(&self, conn_hash: &str, healthy: usize) {
        self.update_healthy_servers(conn_hash, healthy);
    }
}

/// Divides the concurrent-XA-transaction budget across healthy members.
///
/// Identical in shape to [`PoolCoordinator`]; a healthy count of zero falls
/// back to the original budget rather than dividing, so a cluster that has
/// lost all health reports cannot deadlock distributed transactions.
#[derive(Default)]
pub struct XaCoordinator {
    allocations: RwLock<HashMap<String, XaAllocation>>,
}

impl XaCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calculate_transaction_budget(
        &self,
        conn_hash: &str,
        requested_max: usize,
        endpoints: &[String],
    ) -> XaAllocation {
        if endpoints.is_empty() {
            return XaAllocation::single_node(requested_max);
        }

        let alloc = XaAllocation::clustered(requested_max, endpoints.len());
        info!(
            conn_hash,
            total = alloc.total_servers,
            current_max = alloc.current_max_transactions(),
            "recorded clustered XA allocation"
        );
        if let Ok(mut allocations) = self.allocations.write() {
            allocations.insert(conn_hash.to_string(), alloc.clone());
        }
        alloc
    }

    pub fn update_healthy_servers(&self, conn_hash: &str, healthy: usize) {
        let Ok(mut allocations) = self.allocations.write() else {
            return;
        };
        if let Some(alloc) = allocations.get_mut(conn_hash) {
            alloc.set_healthy_servers(healthy);
            debug!(
                conn_hash,
                healthy = alloc.healthy_servers,
                current_max = alloc.current_max_transactions(),
                "XA allocation rebalanced"
            );
        }
    }

    pub fn current(&self, conn_hash: &str) -> Option<XaAllocation> {
        self.allocations.read().ok()?.get(conn_hash).cloned()
    }
}

impl HealthObserver for XaCoordinator {
    fn on_healthy_count(&self, conn_hash: &str, healthy: usize) {
        self.update_healthy_servers(conn_hash, healthy);
    }
}
