//! XA transaction manager
//!
//! Created once at startup. If the backend reports no XA support the
//! failure is recorded and logged, the server keeps running, and every
//! later XA open-session call fails with that reason. The manager also
//! enforces this node's share of the cluster-wide concurrent-transaction
//! budget advertised by the XA coordinator.

use crate::backend::ConnectionHash;
use crate::error::ServerError;
use dashmap::DashMap;
use ojp_core_cluster::XaCoordinator;
use std::sync::Arc;
use tracing::{error, info};

pub struct XaManager {
    availability: Result<(), String>,
    coordinator: Arc<XaCoordinator>,
    /// Active transaction count per connection hash
    active: DashMap<String, usize>,
    /// Budget to use when no clustered allocation was recorded
    single_node_budget: DashMap<String, usize>,
}

impl XaManager {
    /// Record XA availability once. A probe failure is not fatal to the
    /// server, only to later XA sessions.
    pub fn new(probe: Result<(), String>, coordinator: Arc<XaCoordinator>) -> Self {
        match &probe {
            Ok(()) => info!("XA transaction manager initialized"),
            Err(reason) => {
                error!(reason = %reason, "XA unavailable; XA sessions will be rejected");
            }
        }
        Self {
            availability: probe,
            coordinator,
            active: DashMap::new(),
            single_node_budget: DashMap::new(),
        }
    }

    pub fn ensure_available(&self) -> Result<(), ServerError> {
        self.availability
            .as_ref()
            .map(|_| ())
            .map_err(|reason| ServerError::XaUnavailable(reason.clone()))
    }

    /// Record the requested budget at session open and return this node's
    /// current share.
    pub fn register_budget(
        &self,
        conn_hash: &ConnectionHash,
        requested_max: usize,
        endpoints: &[String],
    ) -> usize {
        let allocation = self.coordinator.calculate_transaction_budget(
            conn_hash.as_str(),
            requested_max,
            endpoints,
        );
        self.single_node_budget
            .insert(conn_hash.as_str().to_string(), requested_max);
        allocation.current_max_transactions()
    }

    fn current_budget(&self, conn_hash: &ConnectionHash) -> usize {
        if let Some(allocation) = self.coordinator.current(conn_hash.as_str()) {
            return allocation.current_max_transactions();
        }
        self.single_node_budget
            .get(conn_hash.as_str())
            .map(|b| *b)
            .unwrap_or(usize::MAX)
    }

    /// Claim a transaction slot at XA start.
    pub fn begin(&self, conn_hash: &ConnectionHash) -> Result<(), ServerError> {
        self.ensure_available()?;
        let budget = self.current_budget(conn_hash);
        let mut entry = self
            .active
            .entry(conn_hash.as_str().to_string())
            .or_insert(0);
        if *entry >= budget {
            return Err(ServerError::Overloaded(format!(
                "XA transaction budget exhausted ({} active)",
                *entry
            )));
        }
        *entry += 1;
        Ok(())
    }

    /// Release a transaction slot at commit/rollback (or failed start).
    pub fn finish(&self, conn_hash: &ConnectionHash) {
        if let Some(mut entry) = self.active.get_mut(conn_hash.as_str()) {
            *entry = entry.saturating_sub(1);
        }
    }

    pub fn active_count(&self, conn_hash: &ConnectionHash) -> usize {
        self.active
            .get(conn_hash.as_str())
            .map(|c| *c)
            .unwrap_or(0)
    }
}
