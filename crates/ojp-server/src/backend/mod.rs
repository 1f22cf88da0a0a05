//! Backend seam: the interface a database driver must satisfy
//!
//! The proxy never talks to a database directly; it owns trait objects
//! created by a [`BackendConnector`]. The driver binaries themselves are
//! external collaborators; this module defines the contract the session
//! plane and dispatcher are written against, plus the connection-hash
//! fingerprint that keys pools, allocations, breakers, and health state.

pub mod memory;

use crate::error::ServerError;
use crate::value::DbValue;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Failures reported by a backend driver.
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    /// A SQL-level error; the message is preserved verbatim to the client
    #[error("{0}")]
    Sql(String),

    /// The connection to the backend is gone; the connection must be
    /// evicted from the pool
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Establishing a connection failed
    #[error("connect failed: {0}")]
    Connect(String),

    /// The driver does not support the requested operation
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl BackendError {
    /// Whether the connection that produced this error is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BackendError::ConnectionLost(_))
    }
}

/// Stable fingerprint of a datasource target: url + user + tuning
/// properties. Used as the coordination key everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHash(String);

impl ConnectionHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionHash {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Keys that identify the datasource target rather than tune it; the
/// password is deliberately excluded from the fingerprint.
const IDENTITY_KEYS: [&str; 2] = ["url", "user"];

/// Everything needed to open a backend connection.
#[derive(Debug, Clone)]
pub struct ConnectionDetails {
    pub url: String,
    pub user: String,
    pub password: String,
    /// Remaining client-supplied properties (pool tuning, driver options)
    pub properties: HashMap<String, String>,
}

impl ConnectionDetails {
    /// Build from the raw client property map. `url` is required.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self, ServerError> {
        let url = props
            .get("url")
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                ServerError::InvalidArgument("missing required property 'url'".to_string())
            })?
            .clone();
        let user = props.get("user").cloned().unwrap_or_default();
        let password = props.get("password").cloned().unwrap_or_default();
        let properties = props
            .iter()
            .filter(|(k, _)| !IDENTITY_KEYS.contains(&k.as_str()) && k.as_str() != "password")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Self {
            url,
            user,
            password,
            properties,
        })
    }

    /// Deterministic fingerprint over url, user, and sorted tuning
    /// properties. Identical inputs hash identically on every node.
    pub fn connection_hash(&self) -> ConnectionHash {
        let mut hasher = Sha256::new();
        hasher.update(self.url.as_bytes());
        hasher.update([0]);
        hasher.update(self.user.as_bytes());
        let mut keys: Vec<&String> = self.properties.keys().collect();
        keys.sort();
        for key in keys {
            hasher.update([0]);
            hasher.update(key.as_bytes());
            hasher.update([b'=']);
            hasher.update(self.properties[key].as_bytes());
        }
        let digest = hasher.finalize();
        ConnectionHash(
            digest
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<String>(),
        )
    }
}

/// Result of executing one statement.
#[derive(Debug, Clone)]
pub enum ExecuteOutcome {
    /// A query result set
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<DbValue>>,
    },
    /// An update count
    Update(u64),
}

/// One live backend connection, exclusively owned by its session.
#[async_trait::async_trait]
pub trait BackendConnection: Send + Sync {
    /// Execute a statement with bound parameters.
    async fn execute(&self, sql: &str, params: &[DbValue]) -> Result<ExecuteOutcome, BackendError>;

    /// Best-effort cancellation of the statement currently executing.
    async fn cancel(&self);

    async fn commit(&self) -> Result<(), BackendError>;

    async fn rollback(&self) -> Result<(), BackendError>;

    /// Whether this connection may be returned to the pool.
    fn is_usable(&self) -> bool;

    async fn close(&self);
}

/// A distributed-transaction branch identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xid {
    pub format_id: i32,
    pub global_txn_id: Vec<u8>,
    pub branch_qualifier: Vec<u8>,
}

/// XA prepare vote: everything persisted, commit will succeed.
pub const XA_OK: i32 = 0;
/// XA prepare vote: branch was read-only, no commit needed.
pub const XA_RDONLY: i32 = 3;

/// The XA resource attached to an XA session.
#[async_trait::async_trait]
pub trait XaResource: Send + Sync {
    async fn start(&self, xid: &Xid, flags: i64) -> Result<(), BackendError>;
    async fn end(&self, xid: &Xid, flags: i64) -> Result<(), BackendError>;
    async fn prepare(&self, xid: &Xid) -> Result<i32, BackendError>;
    async fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), BackendError>;
    async fn rollback(&self, xid: &Xid) -> Result<(), BackendError>;
    async fn recover(&self) -> Result<Vec<Xid>, BackendError>;
}

/// Shared handle to one backend connection.
pub type BackendConn = Arc<dyn BackendConnection>;

/// Pool of backend connections for one connection hash.
pub type BackendPool = ojp_core_resilience::ConnectionPool<BackendConn>;

/// The XA triple owned by an XA session: the physical connection that owns
/// the link, the logical connection statements run on, and the XA resource.
/// Terminating the session closes only the physical connection. The
/// logical one carries autocommit state the proxy does not own.
pub struct XaSessionHandle {
    pub physical: BackendConn,
    pub logical: BackendConn,
    pub resource: Arc<dyn XaResource>,
}

/// How a session holds its backend connection.
pub enum SessionConnection {
    /// A pooled plain connection plus the pool it returns to at terminate
    Direct {
        conn: BackendConn,
        pool: Arc<BackendPool>,
    },
    /// The XA triple
    Xa(XaSessionHandle),
}

/// Factory for backend connections; the seam a driver implements.
#[async_trait::async_trait]
pub trait BackendConnector: Send + Sync {
    /// Open a plain connection.
    async fn connect(&self, details: &ConnectionDetails) -> Result<BackendConn, BackendError>;

    /// Open an XA pair plus resource.
    async fn connect_xa(
        &self,
        details: &ConnectionDetails,
    ) -> Result<XaSessionHandle, BackendError>;

    /// Probe XA support once at startup. An error is recorded and later
    /// XA open-session calls fail with that reason.
    fn probe_xa_support(&self) -> Result<(), String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_details_require_url() {
        let err = ConnectionDetails::from_properties(&props(&[("user", "app")]));
        assert!(matches!(err, Err(ServerError::InvalidArgument(_))));
    }

    #[test]
    fn test_hash_is_stable_and_order_independent() {
        let a = ConnectionDetails::from_properties(&props(&[
            ("url", "db://h/1"),
            ("user", "app"),
            ("maximumPoolSize", "20"),
            ("dataSourceName", "main"),
        ]))
        .unwrap();
        let b = ConnectionDetails::from_properties(&props(&[
            ("dataSourceName", "main"),
            ("maximumPoolSize", "20"),
            ("user", "app"),
            ("url", "db://h/1"),
        ]))
        .unwrap();
        assert_eq!(a.connection_hash(), b.connection_hash());
    }

    #[test]
    fn test_hash_differs_by_target() {
        let a = ConnectionDetails::from_properties(&props(&[("url", "db://h/1"), ("user", "x")]))
            .unwrap();
        let b = ConnectionDetails::from_properties(&props(&[("url", "db://h/2"), ("user", "x")]))
            .unwrap();
        let c = ConnectionDetails::from_properties(&props(&[("url", "db://h/1"), ("user", "y")]))
            .unwrap();
        assert_ne!(a.connection_hash(), b.connection_hash());
        assert_ne!(a.connection_hash(), c.connection_hash());
    }

    #[test]
    fn test_password_not_in_hash() {
        let a = ConnectionDetails::from_properties(&props(&[
            ("url", "db://h/1"),
            ("user", "x"),
            ("password", "one"),
        ]))
        .unwrap();
        let b = ConnectionDetails::from_properties(&props(&[
            ("url", "db://h/1"),
            ("user", "x"),
            ("password", "two"),
        ]))
        .unwrap();
        assert_eq!(a.connection_hash(), b.connection_hash());
    }
}
