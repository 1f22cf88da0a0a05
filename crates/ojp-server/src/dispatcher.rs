//! Per-RPC request dispatcher
//!
//! Every inbound RPC passes through the same pipeline: whitelist check,
//! piggy-backed cluster-health observation, session resolution, circuit
//! breaker admission, slow-query slot admission, backend execution, and
//! finally error classification and outcome recording. Slots, the
//! per-session operation queue entry, and breaker bookkeeping are released
//! on every exit path, including client cancellation, which drops the
//! in-flight future and lets the RAII guards clean up.

use crate::backend::{
    BackendConn, BackendConnector, ConnectionDetails, ConnectionHash, ExecuteOutcome,
    SessionConnection, Xid,
};
use crate::config::ServerConfig;
use crate::datasource::{DatasourceConfig, PoolRegistry};
use crate::error::ServerError;
use crate::session::{Cursor, ResultCursor, Session};
use crate::session_manager::SessionManager;
use crate::value::DbValue;
use crate::whitelist::{IpWhitelist, WhitelistError};
use crate::wire;
use crate::xa::XaManager;
use dashmap::DashMap;
use ojp_core_cluster::{ClusterHealthTracker, HealthObserver, PoolCoordinator, XaCoordinator};
use ojp_core_resilience::{BreakerRegistry, QuerySegregator, SegregationConfig, SlotPermit};
use ojp_proto::{
    ExecuteRequest, ExecuteResponse, FetchRequest, FetchResponse, LobReadRequest, LobReadResponse,
    LobWriteRequest, LobWriteResponse, OpenSessionRequest, SessionDescriptor, StatementKind,
    XaOp, XaRequest, XaResponse,
};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Stable fingerprint of a statement: whitespace-normalized, case-folded,
/// first eight bytes of the SHA-256.
pub fn fingerprint(sql: &str) -> u64 {
    let normalized = sql
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Fires a best-effort backend cancel unless disarmed before drop.
struct CancelGuard {
    conn: Option<BackendConn>,
}

impl CancelGuard {
    fn arm(conn: BackendConn) -> Self {
        Self { conn: Some(conn) }
    }

    fn disarm(mut self) {
        self.conn = None;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tokio::spawn(async move {
                conn.cancel().await;
            });
        }
    }
}

pub struct Dispatcher {
    config: ServerConfig,
    whitelist: IpWhitelist,
    tracker: ClusterHealthTracker,
    breakers: BreakerRegistry,
    segregators: DashMap<String, Arc<QuerySegregator>>,
    /// Slot counts recorded at session open, used to size segregators
    slot_counts: DashMap<String, usize>,
    sessions: Arc<SessionManager>,
    pools: Arc<PoolRegistry>,
    xa: Arc<XaManager>,
    connector: Arc<dyn BackendConnector>,
}

impl Dispatcher {
    /// Wire up the full request plane from configuration and a backend
    /// connector. Fails only on an invalid whitelist.
    pub fn new(
        config: ServerConfig,
        connector: Arc<dyn BackendConnector>,
    ) -> Result<Arc<Self>, WhitelistError> {
        let whitelist = IpWhitelist::parse(&config.allowed_ips)?;
        let pool_coordinator = Arc::new(PoolCoordinator::new());
        let xa_coordinator = Arc::new(XaCoordinator::new());
        let observers: Vec<Arc<dyn HealthObserver>> =
            vec![pool_coordinator.clone(), xa_coordinator.clone()];
        let tracker = ClusterHealthTracker::new(observers);
        let breakers = BreakerRegistry::new(config.breaker_config());
        let sessions = Arc::new(SessionManager::new(config.connection_idle_timeout()));
        let pools = Arc::new(PoolRegistry::new(connector.clone(), pool_coordinator));
        let xa = Arc::new(XaManager::new(connector.probe_xa_support(), xa_coordinator));

        Ok(Arc::new(Self {
            config,
            whitelist,
            tracker,
            breakers,
            segregators: DashMap::new(),
            slot_counts: DashMap::new(),
            sessions,
            pools,
            xa,
            connector,
        }))
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn pools(&self) -> &Arc<PoolRegistry> {
        &self.pools
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Maintenance tick: reap idle sessions and apply coordinator targets.
    pub async fn run_maintenance(&self) {
        let reaped = self.sessions.reap().await;
        if reaped > 0 {
            info!(reaped, "idle session sweep");
        }
        self.pools.apply_targets().await;
    }

    /// Shutdown: terminate every session and close every pool.
    pub async fn shutdown(&self) {
        self.sessions.close_all().await;
        self.pools.close_all().await;
    }

    fn check_ip(&self, remote: Option<IpAddr>) -> Result<(), ServerError> {
        // Non-TCP transports (in-process, uds) carry no peer address.
        let Some(addr) = remote else {
            return Ok(());
        };
        if self.whitelist.allows(addr) {
            Ok(())
        } else {
            warn!(%addr, "rejected caller outside whitelist");
            Err(ServerError::PermissionDenied(addr.to_string()))
        }
    }

    fn observe_health(&self, conn_hash: &ConnectionHash, blob: &str) -> Result<(), ServerError> {
        self.tracker.observe(conn_hash.as_str(), blob)?;
        Ok(())
    }

    fn resolve(&self, descriptor: Option<&SessionDescriptor>) -> Result<Arc<Session>, ServerError> {
        let descriptor = descriptor.ok_or_else(|| {
            ServerError::InvalidArgument("missing session descriptor".to_string())
        })?;
        let session = self.sessions.get(&descriptor.session_id)?;
        session.touch();
        Ok(session)
    }

    fn descriptor(session: &Session) -> SessionDescriptor {
        SessionDescriptor {
            conn_hash: session.conn_hash().as_str().to_string(),
            client_id: session.client_id().to_string(),
            session_id: session.session_id().to_string(),
            is_xa: session.is_xa(),
        }
    }

    fn segregator_for(&self, conn_hash: &ConnectionHash) -> Arc<QuerySegregator> {
        self.segregators
            .entry(conn_hash.as_str().to_string())
            .or_insert_with(|| {
                let total_slots = self
                    .slot_counts
                    .get(conn_hash.as_str())
                    .map(|s| *s)
                    .unwrap_or(SegregationConfig::default().total_slots);
                Arc::new(QuerySegregator::new(
                    self.config.segregation_config(total_slots),
                ))
            })
            .clone()
    }

    /// Segregator admission, recording slot-wait timeouts into the breaker.
    async fn acquire_slot(
        &self,
        conn_hash: &ConnectionHash,
        fp: u64,
    ) -> Result<Option<(Arc<QuerySegregator>, SlotPermit)>, ServerError> {
        if !self.config.slow_query_segregation.enabled {
            return Ok(None);
        }
        let segregator = self.segregator_for(conn_hash);
        match segregator.acquire(fp, None).await {
            Ok(permit) => Ok(Some((segregator, permit))),
            Err(err) => {
                let mapped = ServerError::from(err);
                if mapped.is_breaker_failure() {
                    self.breakers.record_failure(conn_hash.as_str()).await;
                }
                Err(mapped)
            }
        }
    }

    /// Execute on the backend under the transaction timeout, with a
    /// best-effort cancel if the caller goes away mid-flight.
    async fn run_backend(
        &self,
        session: &Session,
        conn: BackendConn,
        sql: &str,
        params: &[DbValue],
    ) -> Result<ExecuteOutcome, ServerError> {
        let guard = CancelGuard::arm(conn.clone());
        let txn_timeout = session.transaction_timeout();
        let result = if txn_timeout > 0 {
            match tokio::time::timeout(
                Duration::from_secs(u64::from(txn_timeout)),
                conn.execute(sql, params),
            )
            .await
            {
                // Guard stays armed: the abandoned statement gets a cancel.
                Err(_) => {
                    return Err(ServerError::Timeout(format!(
                        "transaction timeout after {}s",
                        txn_timeout
                    )))
                }
                Ok(result) => result,
            }
        } else {
            conn.execute(sql, params).await
        };
        guard.disarm();
        result.map_err(ServerError::from)
    }

    pub async fn open_session(
        &self,
        remote: Option<IpAddr>,
        req: OpenSessionRequest,
    ) -> Result<SessionDescriptor, ServerError> {
        self.check_ip(remote)?;
        if req.client_id.is_empty() {
            return Err(ServerError::InvalidArgument(
                "missing client id".to_string(),
            ));
        }
        let details = ConnectionDetails::from_properties(&req.properties)?;
        let conn_hash = details.connection_hash();
        self.observe_health(&conn_hash, &req.cluster_health)?;

        if let Some(existing) = self
            .sessions
            .lookup_existing(&req.client_id, &conn_hash, req.is_xa)
        {
            debug!(session_id = %existing.session_id(), "reusing live session");
            existing.touch();
            return Ok(Self::descriptor(&existing));
        }

        let ds = DatasourceConfig::from_properties(&req.properties)?;
        let txn_timeout: Option<u32> = match req.properties.get("transactionTimeout") {
            None => None,
            Some(raw) => Some(raw.parse().map_err(|_| {
                ServerError::InvalidArgument(format!(
                    "invalid value '{}' for property 'transactionTimeout'",
                    raw
                ))
            })?),
        };
        self.breakers.admit(conn_hash.as_str()).await?;

        let connection = if req.is_xa {
            self.xa.ensure_available()?;
            self.xa
                .register_budget(&conn_hash, ds.max_xa_transactions, &req.endpoints);
            match self.connector.connect_xa(&details).await {
                Ok(handle) => SessionConnection::Xa(handle),
                Err(err) => {
                    self.breakers.record_failure(conn_hash.as_str()).await;
                    return Err(err.into());
                }
            }
        } else {
            let pool = self.pools.pool_for(&conn_hash, &details, &ds, &req.endpoints);
            self.slot_counts.insert(
                conn_hash.as_str().to_string(),
                pool.stats().await.max_size,
            );
            match pool.acquire_timeout(ds.connection_timeout).await {
                Ok(conn) => SessionConnection::Direct { conn, pool },
                Err(err) => {
                    let mapped = ServerError::from(err);
                    if mapped.is_breaker_failure() {
                        self.breakers.record_failure(conn_hash.as_str()).await;
                    }
                    return Err(mapped);
                }
            }
        };
        self.breakers.record_success(conn_hash.as_str()).await;

        let session = Session::new(req.client_id, conn_hash, req.is_xa, connection);
        if let Some(secs) = txn_timeout {
            session.set_transaction_timeout(secs)?;
        }
        info!(
            session_id = %session.session_id(),
            client_id = %session.client_id(),
            is_xa = session.is_xa(),
            "opened session"
        );
        self.sessions.insert(session.clone());
        Ok(Self::descriptor(&session))
    }

    /// Idempotent: closing an unknown or already-closed session succeeds.
    pub async fn close_session(
        &self,
        remote: Option<IpAddr>,
        descriptor: Option<&SessionDescriptor>,
        cluster_health: &str,
    ) -> Result<(), ServerError> {
        self.check_ip(remote)?;
        let Some(descriptor) = descriptor else {
            return Err(ServerError::InvalidArgument(
                "missing session descriptor".to_string(),
            ));
        };
        if !descriptor.conn_hash.is_empty() {
            self.observe_health(
                &ConnectionHash::from(descriptor.conn_hash.clone()),
                cluster_health,
            )?;
        }
        self.sessions.close(&descriptor.session_id).await;
        Ok(())
    }

    pub async fn execute(
        &self,
        remote: Option<IpAddr>,
        req: ExecuteRequest,
    ) -> Result<ExecuteResponse, ServerError> {
        self.check_ip(remote)?;
        let session = self.resolve(req.session.as_ref())?;
        self.observe_health(session.conn_hash(), &req.cluster_health)?;
        let params = wire::decode_params(&req.params)?;
        let kind = req.kind();
        let fp = fingerprint(&req.sql);
        let conn_hash = session.conn_hash().clone();

        let _op = session.begin_op().await?;
        self.breakers.admit(conn_hash.as_str()).await?;
        let slot = self.acquire_slot(&conn_hash, fp).await?;

        let started = Instant::now();
        let conn = session.connection()?;
        let result = self.run_backend(&session, conn, &req.sql, &params).await;

        match result {
            Ok(outcome) => {
                self.breakers.record_success(conn_hash.as_str()).await;
                if let Some((segregator, _permit)) = &slot {
                    segregator.record_completion(fp, started.elapsed());
                }
                self.build_execute_response(&session, kind, &req.sql, fp, req.max_rows, outcome)
            }
            Err(err) => {
                if err.is_breaker_failure() {
                    self.breakers.record_failure(conn_hash.as_str()).await;
                }
                Err(err)
            }
        }
    }

    fn build_execute_response(
        &self,
        session: &Session,
        kind: StatementKind,
        sql: &str,
        fp: u64,
        max_rows: u32,
        outcome: ExecuteOutcome,
    ) -> Result<ExecuteResponse, ServerError> {
        // Keep a statement handle per distinct statement text; it is
        // reused across executions and closed at terminate.
        let statement_id = format!("stmt-{:016x}", fp);
        let handle = match kind {
            StatementKind::Prepared => Cursor::Prepared {
                sql: sql.to_string(),
            },
            StatementKind::Callable => Cursor::Callable {
                sql: sql.to_string(),
            },
            _ => Cursor::Statement {
                sql: sql.to_string(),
            },
        };
        session.register_statement(&statement_id, handle)?;

        match outcome {
            ExecuteOutcome::Rows { columns, rows } => {
                let mut cursor = ResultCursor::new(columns.clone(), rows);
                let (batch, has_more) = cursor.next_batch(max_rows as usize);
                let cursor_id = session.put_cursor(Cursor::ResultSet(cursor))?;
                Ok(ExecuteResponse {
                    session: Some(Self::descriptor(session)),
                    cursor_id,
                    columns,
                    rows: batch.iter().map(|row| wire::encode_row(row)).collect(),
                    has_more,
                    update_count: 0,
                })
            }
            ExecuteOutcome::Update(count) => Ok(ExecuteResponse {
                session: Some(Self::descriptor(session)),
                cursor_id: String::new(),
                columns: Vec::new(),
                rows: Vec::new(),
                has_more: false,
                update_count: count,
            }),
        }
    }

    pub async fn fetch(
        &self,
        remote: Option<IpAddr>,
        req: FetchRequest,
    ) -> Result<FetchResponse, ServerError> {
        self.check_ip(remote)?;
        let session = self.resolve(req.session.as_ref())?;
        self.observe_health(session.conn_hash(), &req.cluster_health)?;

        let _op = session.begin_op().await?;
        let (rows, has_more) = session.fetch_batch(&req.cursor_id, req.max_rows as usize)?;
        Ok(FetchResponse {
            rows: rows.iter().map(|row| wire::encode_row(row)).collect(),
            has_more,
        })
    }

    /// Local (non-XA) transaction control. These bypass the slow lane:
    /// stalling a commit behind slow queries would hold backend locks.
    pub async fn commit(
        &self,
        remote: Option<IpAddr>,
        descriptor: Option<&SessionDescriptor>,
        cluster_health: &str,
    ) -> Result<(), ServerError> {
        self.transaction_control(remote, descriptor, cluster_health, true)
            .await
    }

    pub async fn rollback(
        &self,
        remote: Option<IpAddr>,
        descriptor: Option<&SessionDescriptor>,
        cluster_health: &str,
    ) -> Result<(), ServerError> {
        self.transaction_control(remote, descriptor, cluster_health, false)
            .await
    }

    async fn transaction_control(
        &self,
        remote: Option<IpAddr>,
        descriptor: Option<&SessionDescriptor>,
        cluster_health: &str,
        commit: bool,
    ) -> Result<(), ServerError> {
        self.check_ip(remote)?;
        let session = self.resolve(descriptor)?;
        self.observe_health(session.conn_hash(), cluster_health)?;
        let conn_hash = session.conn_hash().clone();

        let _op = session.begin_op().await?;
        self.breakers.admit(conn_hash.as_str()).await?;
        let conn = session.connection()?;
        let result = if commit {
            conn.commit().await
        } else {
            conn.rollback().await
        };
        match result {
            Ok(()) => {
                self.breakers.record_success(conn_hash.as_str()).await;
                Ok(())
            }
            Err(err) => {
                self.breakers.record_failure(conn_hash.as_str()).await;
                Err(err.into())
            }
        }
    }

    /// XA transaction control. Bypasses the slow lane for the same reason
    /// as local commit/rollback; still passes the circuit breaker.
    pub async fn xa_operation(
        &self,
        remote: Option<IpAddr>,
        req: XaRequest,
    ) -> Result<XaResponse, ServerError> {
        self.check_ip(remote)?;
        let session = self.resolve(req.session.as_ref())?;
        if !session.is_xa() {
            return Err(ServerError::InvalidArgument(format!(
                "session {} is not an XA session",
                session.session_id()
            )));
        }
        self.observe_health(session.conn_hash(), &req.cluster_health)?;
        let conn_hash = session.conn_hash().clone();
        let op = req.op();

        let xid = req.xid.as_ref().map(|xid| Xid {
            format_id: xid.format_id,
            global_txn_id: xid.global_txn_id.clone(),
            branch_qualifier: xid.branch_qualifier.clone(),
        });
        let xid = match op {
            XaOp::Recover => xid,
            _ => Some(xid.ok_or_else(|| {
                ServerError::InvalidArgument("missing xid".to_string())
            })?),
        };

        let _op_guard = session.begin_op().await?;
        self.breakers.admit(conn_hash.as_str()).await?;
        let resource = session.xa_resource()?;

        let empty = XaResponse {
            vote: 0,
            recovered: Vec::new(),
        };
        let result: Result<XaResponse, ServerError> = match (op, xid) {
            (XaOp::Start, Some(xid)) => {
                self.xa.begin(&conn_hash)?;
                match resource.start(&xid, req.flags).await {
                    Ok(()) => Ok(empty),
                    Err(err) => {
                        self.xa.finish(&conn_hash);
                        Err(err.into())
                    }
                }
            }
            (XaOp::End, Some(xid)) => resource
                .end(&xid, req.flags)
                .await
                .map(|_| empty)
                .map_err(Into::into),
            (XaOp::Prepare, Some(xid)) => resource
                .prepare(&xid)
                .await
                .map(|vote| XaResponse {
                    vote,
                    recovered: Vec::new(),
                })
                .map_err(Into::into),
            (XaOp::Commit, Some(xid)) => {
                let result = resource.commit(&xid, req.one_phase).await;
                if result.is_ok() {
                    self.xa.finish(&conn_hash);
                }
                result.map(|_| empty).map_err(Into::into)
            }
            (XaOp::Rollback, Some(xid)) => {
                let result = resource.rollback(&xid).await;
                if result.is_ok() {
                    self.xa.finish(&conn_hash);
                }
                result.map(|_| empty).map_err(Into::into)
            }
            (XaOp::Recover, _) => resource
                .recover()
                .await
                .map(|xids| XaResponse {
                    vote: 0,
                    recovered: xids
                        .into_iter()
                        .map(|xid| ojp_proto::Xid {
                            format_id: xid.format_id,
                            global_txn_id: xid.global_txn_id,
                            branch_qualifier: xid.branch_qualifier,
                        })
                        .collect(),
                })
                .map_err(Into::into),
            (XaOp::Unspecified, _) | (_, None) => Err(ServerError::InvalidArgument(
                "unspecified XA operation".to_string(),
            )),
        };

        match &result {
            Ok(_) => self.breakers.record_success(conn_hash.as_str()).await,
            Err(err) if err.is_breaker_failure() => {
                self.breakers.record_failure(conn_hash.as_str()).await
            }
            Err(_) => {}
        }
        result
    }

    pub async fn lob_write(
        &self,
        remote: Option<IpAddr>,
        req: LobWriteRequest,
    ) -> Result<LobWriteResponse, ServerError> {
        self.check_ip(remote)?;
        let session = self.resolve(req.session.as_ref())?;
        self.observe_health(session.conn_hash(), &req.cluster_health)?;

        let _op = session.begin_op().await?;
        let lob_id = if req.lob_id.is_empty() {
            None
        } else {
            Some(req.lob_id.as_str())
        };
        let (lob_id, written) = session.lob_write(lob_id, req.offset, &req.data)?;
        Ok(LobWriteResponse { lob_id, written })
    }

    pub async fn lob_read(
        &self,
        remote: Option<IpAddr>,
        req: LobReadRequest,
    ) -> Result<LobReadResponse, ServerError> {
        self.check_ip(remote)?;
        let session = self.resolve(req.session.as_ref())?;
        self.observe_health(session.conn_hash(), &req.cluster_health)?;

        let _op = session.begin_op().await?;
        let (data, eof) = session.lob_read(&req.lob_id, req.offset, req.length)?;
        Ok(LobReadResponse { data, eof })
    }
}
