//! Capacity allocations divided across cluster members
//!
//! Each proxy node holds an allocation per connection key describing the
//! client-requested capacity and the observed cluster membership. Derived
//! per-node targets use ceiling division so that the sum across healthy
//! nodes never drops below the requested total: slight over-provisioning is
//! preferred to under-provisioning during partial failure. The division is
//! deterministic, so every node derives the same targets from the same
//! healthy count.

/// Ceiling division. `denominator` is clamped to at least one.
fn div_ceil(numerator: usize, denominator: usize) -> usize {
    let denominator = denominator.max(1);
    numerator.div_ceil(denominator)
}

/// Connection-pool capacity for one connection key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolAllocation {
    /// Client-requested maximum pool size for the whole cluster
    pub original_max: usize,
    /// Client-requested minimum idle for the whole cluster
    pub original_min_idle: usize,
    /// Cluster members known when the allocation was recorded
    pub total_servers: usize,
    /// Currently healthy members, always in `1..=total_servers`
    pub healthy_servers: usize,
}

impl PoolAllocation {
    /// A single-node allocation: no division is applied.
    pub fn single_node(original_max: usize, original_min_idle: usize) -> Self {
        Self {
            original_max,
            original_min_idle,
            total_servers: 1,
            healthy_servers: 1,
        }
    }

    /// An allocation across `total_servers` members, all initially healthy.
    pub fn clustered(original_max: usize, original_min_idle: usize, total_servers: usize) -> Self {
        let total_servers = total_servers.max(1);
        Self {
            original_max,
            original_min_idle,
            total_servers,
            healthy_servers: total_servers,
        }
    }

    /// This node's share of the maximum pool size.
    pub fn current_max(&self) -> usize {
        div_ceil(self.original_max, self.healthy_servers)
    }

    /// This node's share of the minimum idle count.
    pub fn current_min_idle(&self) -> usize {
        div_ceil(self.original_min_idle, self.healthy_servers)
    }

    /// Replace the healthy count, clamped to `1..=total_servers`. A report
    /// of zero healthy members is clamped to one so a confused cluster can
    /// never zero out its own capacity.
    pub fn set_healthy_servers(&mut self, healthy: usize) {
        self.healthy_servers = healthy.clamp(1, self.total_servers);
    }
}

/// Concurrent XA transaction capacity for one connection key.
///
/// Same shape as [`PoolAllocation`] but a healthy count of zero falls back
/// to the original maximum (single-node semantics) instead of being divided,
/// so a cluster that has lost all health reports cannot deadlock XA work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XaAllocation {
    /// Client-requested maximum concurrent XA transactions for the cluster
    pub original_max_transactions: usize,
    /// Cluster members known when the allocation was recorded
    pub total_servers: usize,
    /// Currently healthy members, in `0..=total_servers`
    pub healthy_servers: usize,
}

impl XaAllocation {
    pub fn single_node(original_max_transactions: usize) -> Self {
        Self {
            original_max_transactions,
            total_servers: 1,
            healthy_servers: 1,
        }
    }

    pub fn clustered(original_max_transactions: usize, total_servers: usize) -> Self {
        let total_servers = total_servers.max(1);
        Self {
            original_max_transactions,
            total_servers,
            healthy_servers: total_servers,
        }
    }

    /// This node's share of the XA transaction budget.
    pub fn current_max_transactions(&self) -> usize {
        if self.healthy_servers == 0 {
            self.original_max_transactions
        } else {
            div_ceil(self.original_max_transactions, self.healthy_servers)
        }
    }

    /// Replace the healthy count, clamped to `0..=total_servers`.
    pub fn set_healthy_servers(&mut self, healthy: usize) {
        self.healthy_servers = healthy.min(self.total_servers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_node_no_division() {
        let alloc = PoolAllocation::single_node(30, 6);
        assert_eq!(alloc.current_max(), 30);
        assert_eq!(alloc.current_min_idle(), 6);
        assert_eq!(alloc.total_servers, 1);
    }

    #[test]
    fn test_even_division() {
        let alloc = PoolAllocation::clustered(30, 6, 3);
        assert_eq!(alloc.current_max(), 10);
        assert_eq!(alloc.current_min_idle(), 2);
    }

    #[test]
    fn test_rounding_preserves_capacity_sum() {
        // 10 across 3 healthy: each node takes 4, sum 12 >= 10.
        let alloc = PoolAllocation::clustered(10, 0, 3);
        assert_eq!(alloc.current_max(), 4);
        assert!(alloc.current_max() * alloc.healthy_servers >= alloc.original_max);
    }

    #[test]
    fn test_capacity_sum_invariant_over_range() {
        for total in 1..=8 {
            for healthy in 1..=total {
                for max in [1, 7, 10, 30, 101] {
                    let mut alloc = PoolAllocation::clustered(max, 0, total);
                    alloc.set_healthy_servers(healthy);
                    assert!(
                        alloc.current_max() * alloc.healthy_servers >= alloc.original_max,
                        "sum violated for max={} total={} healthy={}",
                        max,
                        total,
                        healthy
                    );
                }
            }
        }
    }

    #[test]
    fn test_healthy_clamped_to_lower_bound() {
        let mut alloc = PoolAllocation::clustered(30, 6, 3);
        alloc.set_healthy_servers(0);
        assert_eq!(alloc.healthy_servers, 1);
        assert_eq!(alloc.current_max(), 30);
    }

    #[test]
    fn test_healthy_clamped_to_total() {
        let mut alloc = PoolAllocation::clustered(30, 6, 3);
        alloc.set_healthy_servers(9);
        assert_eq!(alloc.healthy_servers, 3);
        assert_eq!(alloc.current_max(), 10);
    }

    #[test]
    fn test_rebalance_on_member_loss() {
        let mut alloc = PoolAllocation::clustered(30, 6, 3);
        alloc.set_healthy_servers(2);
        assert_eq!(alloc.current_max(), 15);
        assert_eq!(alloc.current_min_idle(), 3);

        alloc.set_healthy_servers(3);
        assert_eq!(alloc.current_max(), 10);
    }

    #[test]
    fn test_xa_zero_healthy_falls_back_to_original() {
        let mut alloc = XaAllocation::clustered(12, 3);
        alloc.set_healthy_servers(0);
        assert_eq!(alloc.healthy_servers, 0);
        assert_eq!(alloc.current_max_transactions(), 12);
    }

    #[test]
    fn test_xa_division() {
        let alloc = XaAllocation::clustered(12, 3);
        assert_eq!(alloc.current_max_transactions(), 4);

        let mut alloc = XaAllocation::clustered(10, 4);
        alloc.set_healthy_servers(3);
        assert_eq!(alloc.current_max_transactions(), 4);
    }
}
