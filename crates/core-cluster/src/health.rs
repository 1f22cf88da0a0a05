//! Cluster-health blob parsing and change tracking
//!
//! Clients piggy-back their view of the cluster on every RPC as a blob of
//! the form `endpoint=up|down[,endpoint=up|down]*`. The tracker stores the
//! last canonical blob per connection key; when a report differs from the
//! stored one, every registered observer receives exactly one callback with
//! the new healthy count. Each node is authoritative for itself: blobs
//! from different reporters are never merged, last write wins per node.

use crate::error::ClusterError;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Reported status of one cluster endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStatus {
    Up,
    Down,
}

impl EndpointStatus {
    fn parse(s: &str) -> Result<Self, ClusterError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            other => Err(ClusterError::InvalidStatus(other.to_string())),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

/// Receives healthy-count changes for a connection key.
pub trait HealthObserver: Send + Sync {
    fn on_healthy_count(&self, conn_hash: &str, healthy: usize);
}

/// Parse a health blob into `(endpoint, status)` pairs.
pub fn parse_blob(blob: &str) -> Result<Vec<(String, EndpointStatus)>, ClusterError> {
    let mut entries = Vec::new();
    for part in blob.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((endpoint, status)) = part.split_once('=') else {
            return Err(ClusterError::MalformedEntry(part.to_string()));
        };
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Err(ClusterError::MalformedEntry(part.to_string()));
        }
        entries.push((endpoint.to_string(), EndpointStatus::parse(status)?));
    }
    Ok(entries)
}

/// Number of `up` members in a parsed blob.
pub fn count_healthy(entries: &[(String, EndpointStatus)]) -> usize {
    entries
        .iter()
        .filter(|(_, status)| *status == EndpointStatus::Up)
        .count()
}

/// Canonical string form: entries sorted by endpoint, lower-case status.
/// Equality of canonical forms defines "unchanged".
fn canonicalize(entries: &[(String, EndpointStatus)]) -> String {
    let mut sorted: Vec<&(String, EndpointStatus)> = entries.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    sorted
        .iter()
        .map(|(endpoint, status)| format!("{}={}", endpoint, status.as_str()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Tracks the last reported cluster health per connection key and notifies
/// coordinators on change.
pub struct ClusterHealthTracker {
    last: RwLock<HashMap<String, String>>,
    observers: Vec<Arc<dyn HealthObserver>>,
}

impl ClusterHealthTracker {
    pub fn new(observers: Vec<Arc<dyn HealthObserver>>) -> Self {
        Self {
            last: RwLock::new(HashMap::new()),
            observers,
        }
    }

    /// Process a piggy-backed health blob for a connection key.
    ///
    /// Returns `Ok(Some(healthy))` when the blob differs from the stored
    /// one (observers have been notified), `Ok(None)` when it is unchanged
    /// or empty. The new value is stored atomically with the comparison.
    pub fn observe(&self, conn_hash: &str, blob: &str) -> Result<Option<usize>, ClusterError> {
        if blob.trim().is_empty() {
            return Ok(None);
        }
        let entries = parse_blob(blob)?;
        if entries.is_empty() {
            return Ok(None);
        }
        let canonical = canonicalize(&entries);
        let healthy = count_healthy(&entries);

        {
            let Ok(mut last) = self.last.write() else {
                return Ok(None);
            };
            match last.get(conn_hash) {
                Some(stored) if *stored == canonical => return Ok(None),
                _ => {
                    last.insert(conn_hash.to_string(), canonical);
                }
            }
        }

        info!(conn_hash, healthy, "cluster health changed");
        for observer in &self.observers {
            observer.on_healthy_count(conn_hash, healthy);
        }
        Ok(Some(healthy))
    }

    /// Last stored canonical blob for a key.
    pub fn last_blob(&self, conn_hash: &str) -> Option<String> {
        self.last.read().ok()?.get(conn_hash).cloned()
    }

    /// Drop the stored blob for a key (e.g. when its pool is torn down).
    pub fn forget(&self, conn_hash: &str) {
        if let Ok(mut last) = self.last.write() {
            if last.remove(conn_hash).is_some() {
                debug!(conn_hash, "forgot cluster health state");
            }
        }
    }
}
