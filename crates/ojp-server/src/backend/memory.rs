//! In-memory backend connector
//!
//! A self-contained backend used for integration testing and local
//! development when no native driver is linked. It answers a small SQL
//! dialect (`SELECT 1`, `SELECT ...` echoes, DML returns update counts) and
//! exposes failure and latency injection so admission-control behavior can
//! be exercised deterministically.

use super::{
    BackendConn, BackendConnection, BackendConnector, BackendError, ConnectionDetails,
    ExecuteOutcome, XaResource, XaSessionHandle, Xid, XA_OK,
};
use crate::value::DbValue;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared failure/latency injection knobs.
#[derive(Default)]
pub struct FaultPlan {
    /// Fail this many upcoming `execute` calls with a SQL error
    fail_next_executes: AtomicUsize,
    /// Fail this many upcoming `execute` calls fatally (connection lost)
    drop_next_executes: AtomicUsize,
    /// Fail every `connect` while set
    fail_connect: AtomicBool,
    /// Added to every `execute`
    execute_delay_ms: AtomicU64,
}

impl FaultPlan {
    pub fn fail_next_executes(&self, n: usize) {
        self.fail_next_executes.store(n, Ordering::SeqCst);
    }

    pub fn drop_next_executes(&self, n: usize) {
        self.drop_next_executes.store(n, Ordering::SeqCst);
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_execute_delay(&self, delay: Duration) {
        self.execute_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn take_execute_fault(&self) -> Option<BackendError> {
        if self
            .drop_next_executes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Some(BackendError::ConnectionLost(
                "injected connection loss".to_string(),
            ));
        }
        if self
            .fail_next_executes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Some(BackendError::Sql("injected SQL failure".to_string()));
        }
        None
    }
}

/// One in-memory connection.
pub struct MemoryConnection {
    id: u64,
    plan: Arc<FaultPlan>,
    usable: AtomicBool,
    closed: AtomicBool,
    cancel_requests: AtomicUsize,
    /// Uncommitted statement log for the current transaction
    txn_log: Mutex<Vec<String>>,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel_requests(&self) -> usize {
        self.cancel_requests.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl BackendConnection for MemoryConnection {
    async fn execute(&self, sql: &str, params: &[DbValue]) -> Result<ExecuteOutcome, BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::ConnectionLost("connection closed".to_string()));
        }
        let delay = self.plan.execute_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if let Some(fault) = self.plan.take_execute_fault() {
            if fault.is_fatal() {
                self.usable.store(false, Ordering::SeqCst);
            }
            return Err(fault);
        }

        let trimmed = sql.trim();
        let lowered = trimmed.to_ascii_lowercase();
        if lowered == "select 1" {
            return Ok(ExecuteOutcome::Rows {
                columns: vec!["1".to_string()],
                rows: vec![vec![DbValue::Int32(1)]],
            });
        }
        if let Some(rest) = lowered.strip_prefix("sleep ") {
            let ms: u64 = rest.trim().parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            return Ok(ExecuteOutcome::Update(0));
        }
        if lowered.starts_with("select") {
            // Echo the statement and its parameters back as one row.
            let mut row = vec![DbValue::Text(trimmed.to_string())];
            row.extend(params.iter().cloned());
            let columns = (0..row.len()).map(|i| format!("c{}", i)).collect();
            return Ok(ExecuteOutcome::Rows {
                columns,
                rows: vec![row],
            });
        }
        if let Ok(mut log) = self.txn_log.lock() {
            log.push(trimmed.to_string());
        }
        Ok(ExecuteOutcome::Update(1))
    }

    async fn cancel(&self) {
        self.cancel_requests.fetch_add(1, Ordering::SeqCst);
    }

    async fn commit(&self) -> Result<(), BackendError> {
        if let Ok(mut log) = self.txn_log.lock() {
            log.clear();
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), BackendError> {
        if let Ok(mut log) = self.txn_log.lock() {
            log.clear();
        }
        Ok(())
    }

    fn is_usable(&self) -> bool {
        self.usable.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// XA resource over an in-memory connection pair.
pub struct MemoryXaResource {
    prepared: Mutex<Vec<Xid>>,
}

impl MemoryXaResource {
    pub(crate) fn new() -> Self {
        Self {
            prepared: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl XaResource for MemoryXaResource {
    async fn start(&self, _xid: &Xid, _flags: i64) -> Result<(), BackendError> {
        Ok(())
    }

    async fn end(&self, _xid: &Xid, _flags: i64) -> Result<(), BackendError> {
        Ok(())
    }

    async fn prepare(&self, xid: &Xid) -> Result<i32, BackendError> {
        if let Ok(mut prepared) = self.prepared.lock() {
            prepared.push(xid.clone());
        }
        Ok(XA_OK)
    }

    async fn commit(&self, xid: &Xid, _one_phase: bool) -> Result<(), BackendError> {
        if let Ok(mut prepared) = self.prepared.lock() {
            prepared.retain(|p| p != xid);
        }
        Ok(())
    }

    async fn rollback(&self, xid: &Xid) -> Result<(), BackendError> {
        if let Ok(mut prepared) = self.prepared.lock() {
            prepared.retain(|p| p != xid);
        }
        Ok(())
    }

    async fn recover(&self) -> Result<Vec<Xid>, BackendError> {
        Ok(self
            .prepared
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default())
    }
}

/// Connector producing in-memory connections.
pub struct MemoryConnector {
    plan: Arc<FaultPlan>,
    next_id: AtomicU64,
    xa_supported: bool,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self {
            plan: Arc::new(FaultPlan::default()),
            next_id: AtomicU64::new(1),
            xa_supported: true,
        }
    }

    /// A connector whose XA probe fails.
    pub fn without_xa() -> Self {
        Self {
            plan: Arc::new(FaultPlan::default()),
            next_id: AtomicU64::new(1),
            xa_supported: false,
        }
    }

    /// Failure/latency injection handle.
    pub fn faults(&self) -> Arc<FaultPlan> {
        self.plan.clone()
    }

    pub(crate) fn new_connection(&self) -> Arc<MemoryConnection> {
        Arc::new(MemoryConnection {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            plan: self.plan.clone(),
            usable: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            cancel_requests: AtomicUsize::new(0),
            txn_log: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl BackendConnector for MemoryConnector {
    async fn connect(&self, _details: &ConnectionDetails) -> Result<BackendConn, BackendError> {
        if self.plan.fail_connect.load(Ordering::SeqCst) {
            return Err(BackendError::Connect("injected connect failure".to_string()));
        }
        Ok(self.new_connection())
    }

    async fn connect_xa(
        &self,
        _details: &ConnectionDetails,
    ) -> Result<XaSessionHandle, BackendError> {
        if !self.xa_supported {
            return Err(BackendError::Unsupported("XA not supported".to_string()));
        }
        if self.plan.fail_connect.load(Ordering::SeqCst) {
            return Err(BackendError::Connect("injected connect failure".to_string()));
        }
        Ok(XaSessionHandle {
            physical: self.new_connection(),
            logical: self.new_connection(),
            resource: Arc::new(MemoryXaResource::new()),
        })
    }

    fn probe_xa_support(&self) -> Result<(), String> {
        if self.xa_supported {
            Ok(())
        } else {
            Err("in-memory backend built without XA support".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn details() -> ConnectionDetails {
        let mut props = HashMap::new();
        props.insert("url".to_string(), "mem://test".to_string());
        ConnectionDetails::from_properties(&props).unwrap()
    }

    #[tokio::test]
    async fn test_select_one() {
        let connector = MemoryConnector::new();
        let conn = connector.connect(&details()).await.unwrap();
        let outcome = conn.execute("SELECT 1", &[]).await.unwrap();
        match outcome {
            ExecuteOutcome::Rows { rows, .. } => {
                assert_eq!(rows, vec![vec![DbValue::Int32(1)]]);
            }
            other => panic!("expected rows, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_injected_sql_failure() {
        let connector = MemoryConnector::new();
        let conn = connector.connect(&details()).await.unwrap();
        connector.faults().fail_next_executes(1);

        assert!(conn.execute("SELECT 1", &[]).await.is_err());
        // The fault is consumed; the connection remains usable.
        assert!(conn.is_usable());
        assert!(conn.execute("SELECT 1", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_connection_loss_marks_unusable() {
        let connector = MemoryConnector::new();
        let conn = connector.connect(&details()).await.unwrap();
        connector.faults().drop_next_executes(1);

        let err = conn.execute("SELECT 1", &[]).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(!conn.is_usable());
    }

    #[tokio::test]
    async fn test_xa_prepare_recover_commit() {
        let connector = MemoryConnector::new();
        let handle = connector.connect_xa(&details()).await.unwrap();
        let xid = Xid {
            format_id: 1,
            global_txn_id: vec![1],
            branch_qualifier: vec![2],
        };

        handle.resource.start(&xid, 0).await.unwrap();
        handle.resource.end(&xid, 0).await.unwrap();
        assert_eq!(handle.resource.prepare(&xid).await.unwrap(), XA_OK);
        assert_eq!(handle.resource.recover().await.unwrap(), vec![xid.clone()]);
        handle.resource.commit(&xid, false).await.unwrap();
        assert!(handle.resource.recover().await.unwrap().is_empty());
    }
}
