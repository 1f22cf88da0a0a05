//! Server-side session: one backend connection and everything derived from it
//!
//! A session owns exactly one backend connection (or the XA triple), a
//! tagged cursor table, a LOB handle map, and an attribute bag. It is
//! created on the first client request for a (client, connection-hash) pair
//! and transitions to closed on explicit terminate or idle expiry. The
//! closed flag is monotonic: once closed, every accessor fails with
//! `SessionClosed` and the session is never reopened.
//!
//! Operations on one session are serialized in arrival order: the backend
//! connection never sees two concurrent statements. Concurrent RPCs on the
//! same session queue on the operation lock, with a bounded waiter count so
//! a stuck backend cannot accumulate unbounded work.

use crate::backend::{BackendConn, BackendPool, ConnectionHash, SessionConnection, XaResource};
use crate::error::ServerError;
use crate::value::DbValue;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Maximum RPCs allowed to wait on one session's operation lock.
pub const MAX_OP_QUEUE: usize = 32;

/// Default rows per fetch batch when the client sends zero.
pub const DEFAULT_FETCH_SIZE: usize = 100;

/// A server-side result cursor: buffered rows plus a read position.
#[derive(Debug)]
pub struct ResultCursor {
    pub columns: Vec<String>,
    rows: Vec<Vec<DbValue>>,
    position: usize,
}

impl ResultCursor {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<DbValue>>) -> Self {
        Self {
            columns,
            rows,
            position: 0,
        }
    }

    /// Take the next batch of at most `max_rows` rows.
    pub fn next_batch(&mut self, max_rows: usize) -> (Vec<Vec<DbValue>>, bool) {
        let max_rows = if max_rows == 0 {
            DEFAULT_FETCH_SIZE
        } else {
            max_rows
        };
        let end = (self.position + max_rows).min(self.rows.len());
        let batch = self.rows[self.position..end].to_vec();
        self.position = end;
        (batch, self.position < self.rows.len())
    }

    pub fn remaining(&self) -> usize {
        self.rows.len() - self.position
    }
}

/// Tagged handle table entry. Plain/prepared/callable statements and result
/// sets share one table keyed by a server-issued cursor id; no runtime type
/// checks happen on the hot path.
#[derive(Debug)]
pub enum Cursor {
    ResultSet(ResultCursor),
    Statement { sql: String },
    Prepared { sql: String },
    Callable { sql: String },
}

/// A session-owned large object.
#[derive(Debug, Default)]
pub struct LobHandle {
    data: Vec<u8>,
}

impl LobHandle {
    /// Write a chunk at an offset, zero-filling any gap.
    pub fn write_at(&mut self, offset: u64, chunk: &[u8]) -> u64 {
        let offset = offset as usize;
        if self.data.len() < offset {
            self.data.resize(offset, 0);
        }
        let overlap = self.data.len().saturating_sub(offset).min(chunk.len());
        self.data[offset..offset + overlap].copy_from_slice(&chunk[..overlap]);
        self.data.extend_from_slice(&chunk[overlap..]);
        chunk.len() as u64
    }

    /// Read up to `length` bytes from `offset`. Returns the data and
    /// whether the end of the object was reached.
    pub fn read_at(&self, offset: u64, length: u32) -> (Vec<u8>, bool) {
        let offset = (offset as usize).min(self.data.len());
        let end = (offset + length as usize).min(self.data.len());
        (self.data[offset..end].to_vec(), end == self.data.len())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Guard proving the holder owns the session's operation slot.
pub struct OpGuard {
    _guard: OwnedMutexGuard<()>,
}

/// One live logical database session.
pub struct Session {
    session_id: String,
    client_id: String,
    conn_hash: ConnectionHash,
    is_xa: bool,
    closed: AtomicBool,
    last_used: StdMutex<Instant>,
    /// Transaction timeout in seconds; zero means none
    transaction_timeout: AtomicU32,
    cursors: DashMap<String, Cursor>,
    lobs: DashMap<String, LobHandle>,
    attributes: DashMap<String, String>,
    connection: StdMutex<Option<SessionConnection>>,
    op_lock: Arc<Mutex<()>>,
    op_waiters: AtomicUsize,
}

impl Session {
    pub fn new(
        client_id: impl Into<String>,
        conn_hash: ConnectionHash,
        is_xa: bool,
        connection: SessionConnection,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            client_id: client_id.into(),
            conn_hash,
            is_xa,
            closed: AtomicBool::new(false),
            last_used: StdMutex::new(Instant::now()),
            transaction_timeout: AtomicU32::new(0),
            cursors: DashMap::new(),
            lobs: DashMap::new(),
            attributes: DashMap::new(),
            connection: StdMutex::new(Some(connection)),
            op_lock: Arc::new(Mutex::new(())),
            op_waiters: AtomicUsize::new(0),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn conn_hash(&self) -> &ConnectionHash {
        &self.conn_hash
    }

    pub fn is_xa(&self) -> bool {
        self.is_xa
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), ServerError> {
        if self.is_closed() {
            Err(ServerError::SessionClosed(self.session_id.clone()))
        } else {
            Ok(())
        }
    }

    /// Record activity for idle-expiry accounting.
    pub fn touch(&self) {
        if let Ok(mut last) = self.last_used.lock() {
            *last = Instant::now();
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    pub fn transaction_timeout(&self) -> u32 {
        self.transaction_timeout.load(Ordering::SeqCst)
    }

    pub fn set_transaction_timeout(&self, secs: u32) -> Result<(), ServerError> {
        self.ensure_open()?;
        self.transaction_timeout.store(secs, Ordering::SeqCst);
        Ok(())
    }

    /// Enter the session's serialized operation queue.
    ///
    /// Waits behind earlier operations; rejects with `Overloaded` once the
    /// bounded waiter count is exceeded, and with `SessionClosed` if the
    /// session terminates while queued.
    pub async fn begin_op(&self) -> Result<OpGuard, ServerError> {
        self.ensure_open()?;
        let waiting = self.op_waiters.fetch_add(1, Ordering::SeqCst);
        if waiting >= MAX_OP_QUEUE {
            self.op_waiters.fetch_sub(1, Ordering::SeqCst);
            return Err(ServerError::Overloaded(format!(
                "session {} operation queue full",
                self.session_id
            )));
        }
        let guard = self.op_lock.clone().lock_owned().await;
        self.op_waiters.fetch_sub(1, Ordering::SeqCst);
        self.ensure_open()?;
        Ok(OpGuard { _guard: guard })
    }

    /// The connection statements execute on. For an XA session this is the
    /// logical connection of the pair.
    pub fn connection(&self) -> Result<BackendConn, ServerError> {
        self.ensure_open()?;
        let connection = self
            .connection
            .lock()
            .map_err(|_| ServerError::SessionClosed(self.session_id.clone()))?;
        match connection.as_ref() {
            Some(SessionConnection::Direct { conn, .. }) => Ok(conn.clone()),
            Some(SessionConnection::Xa(handle)) => Ok(handle.logical.clone()),
            None => Err(ServerError::SessionClosed(self.session_id.clone())),
        }
    }

    /// The XA resource, present only on XA sessions.
    pub fn xa_resource(&self) -> Result<Arc<dyn XaResource>, ServerError> {
        self.ensure_open()?;
        let connection = self
            .connection
            .lock()
            .map_err(|_| ServerError::SessionClosed(self.session_id.clone()))?;
        match connection.as_ref() {
            Some(SessionConnection::Xa(handle)) => Ok(handle.resource.clone()),
            Some(SessionConnection::Direct { .. }) => Err(ServerError::InvalidArgument(format!(
                "session {} is not an XA session",
                self.session_id
            ))),
            None => Err(ServerError::SessionClosed(self.session_id.clone())),
        }
    }

    /// Store a cursor and return its server-issued id. Ids are unique
    /// within this session only.
    pub fn put_cursor(&self, cursor: Cursor) -> Result<String, ServerError> {
        self.ensure_open()?;
        let id = uuid::Uuid::new_v4().to_string();
        self.cursors.insert(id.clone(), cursor);
        Ok(id)
    }

    /// Read the next batch from a result cursor.
    pub fn fetch_batch(
        &self,
        cursor_id: &str,
        max_rows: usize,
    ) -> Result<(Vec<Vec<DbValue>>, bool), ServerError> {
        self.ensure_open()?;
        let mut entry = self.cursors.get_mut(cursor_id).ok_or_else(|| {
            ServerError::InvalidArgument(format!("unknown cursor '{}'", cursor_id))
        })?;
        match entry.value_mut() {
            Cursor::ResultSet(cursor) => Ok(cursor.next_batch(max_rows)),
            _ => Err(ServerError::InvalidArgument(format!(
                "cursor '{}' is not a result set",
                cursor_id
            ))),
        }
    }

    /// Register a statement handle under a caller-chosen id. An existing
    /// handle with the same id is reused, so repeated executions of the
    /// same statement text share one entry.
    pub fn register_statement(&self, id: &str, cursor: Cursor) -> Result<(), ServerError> {
        self.ensure_open()?;
        self.cursors.entry(id.to_string()).or_insert(cursor);
        Ok(())
    }

    pub fn close_cursor(&self, cursor_id: &str) {
        self.cursors.remove(cursor_id);
    }

    pub fn cursor_count(&self) -> usize {
        self.cursors.len()
    }

    /// Append or overwrite LOB data. An empty `lob_id` allocates a handle.
    pub fn lob_write(
        &self,
        lob_id: Option<&str>,
        offset: u64,
        chunk: &[u8],
    ) -> Result<(String, u64), ServerError> {
        self.ensure_open()?;
        let id = match lob_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        let mut handle = self.lobs.entry(id.clone()).or_default();
        let written = handle.write_at(offset, chunk);
        Ok((id, written))
    }

    /// Read a LOB range.
    pub fn lob_read(
        &self,
        lob_id: &str,
        offset: u64,
        length: u32,
    ) -> Result<(Vec<u8>, bool), ServerError> {
        self.ensure_open()?;
        let handle = self
            .lobs
            .get(lob_id)
            .ok_or_else(|| ServerError::InvalidArgument(format!("unknown LOB '{}'", lob_id)))?;
        Ok(handle.read_at(offset, length))
    }

    pub fn set_attribute(&self, key: &str, value: &str) -> Result<(), ServerError> {
        self.ensure_open()?;
        self.attributes.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn attribute(&self, key: &str) -> Result<Option<String>, ServerError> {
        self.ensure_open()?;
        Ok(self.attributes.get(key).map(|v| v.clone()))
    }

    /// Terminate the session. Idempotent: every call after the first is a
    /// no-op. Clears the cursor and LOB tables, then disposes of the
    /// backend connection: a plain session's pooled connection goes back
    /// to (or is evicted from) its pool; an XA session closes only the XA
    /// physical connection, since the logical connection carries
    /// autocommit state the proxy does not own.
    pub async fn terminate(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(session_id = %self.session_id, "terminating session");
        self.cursors.clear();
        self.lobs.clear();
        self.attributes.clear();

        let connection = self
            .connection
            .lock()
            .ok()
            .and_then(|mut connection| connection.take());
        match connection {
            Some(SessionConnection::Direct { conn, pool }) => {
                if conn.is_usable() {
                    pool.release(conn).await;
                } else {
                    pool.discard(conn).await;
                }
            }
            Some(SessionConnection::Xa(handle)) => {
                handle.physical.close().await;
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryConnector;
    use crate::backend::{ConnectionDetails, XaSessionHandle};
    use crate::datasource::BackendConnectionFactory;
    use ojp_core_resilience::{ConnectionPool, PoolConfig};
    use std::collections::HashMap;

    fn details() -> ConnectionDetails {
        let mut props = HashMap::new();
        props.insert("url".to_string(), "mem://test".to_string());
        ConnectionDetails::from_properties(&props).unwrap()
    }

    fn test_pool() -> Arc<BackendPool> {
        let factory = BackendConnectionFactory::new(Arc::new(MemoryConnector::new()), details());
        Arc::new(ConnectionPool::new(
            Arc::new(factory),
            PoolConfig {
                max_size: 2,
                min_idle: 0,
                ..Default::default()
            },
        ))
    }

    async fn direct_session(pool: Arc<BackendPool>) -> Arc<Session> {
        let conn = pool.acquire().await.unwrap();
        Session::new(
            "client-1",
            details().connection_hash(),
            false,
            SessionConnection::Direct { conn, pool },
        )
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let pool = test_pool();
        let session = direct_session(pool.clone()).await;
        session.put_cursor(Cursor::Statement { sql: "SELECT 1".into() }).unwrap();

        session.terminate().await;
        let stats_after_first = pool.stats().await;
        session.terminate().await;
        session.terminate().await;
        let stats_after_third = pool.stats().await;

        assert!(session.is_closed());
        assert_eq!(session.cursor_count(), 0);
        assert_eq!(stats_after_first.idle, stats_after_third.idle);
        assert_eq!(stats_after_first.active, 0);
    }

    #[tokio::test]
    async fn test_accessors_fail_after_terminate() {
        let pool = test_pool();
        let session = direct_session(pool).await;
        session.terminate().await;

        assert!(matches!(
            session.connection(),
            Err(ServerError::SessionClosed(_))
        ));
        assert!(matches!(
            session.begin_op().await,
            Err(ServerError::SessionClosed(_))
        ));
        assert!(matches!(
            session.put_cursor(Cursor::Statement { sql: "x".into() }),
            Err(ServerError::SessionClosed(_))
        ));
        assert!(matches!(
            session.lob_write(None, 0, b"x"),
            Err(ServerError::SessionClosed(_))
        ));
        assert!(matches!(
            session.set_attribute("k", "v"),
            Err(ServerError::SessionClosed(_))
        ));
        assert!(matches!(
            session.set_transaction_timeout(5),
            Err(ServerError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_terminate_returns_connection_to_pool() {
        let pool = test_pool();
        let session = direct_session(pool.clone()).await;
        assert_eq!(pool.stats().await.active, 1);

        session.terminate().await;
        let stats = pool.stats().await;
        assert_eq!(stats.active, 0);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn test_xa_terminate_closes_physical_only() {
        let connector = MemoryConnector::new();
        let physical = connector.new_connection();
        let logical = connector.new_connection();
        let session = Session::new(
            "client-1",
            details().connection_hash(),
            true,
            SessionConnection::Xa(XaSessionHandle {
                physical: physical.clone(),
                logical: logical.clone(),
                resource: Arc::new(crate::backend::memory::MemoryXaResource::new()),
            }),
        );

        session.terminate().await;

        assert!(physical.is_closed());
        assert!(!logical.is_closed());
    }

    #[tokio::test]
    async fn test_result_cursor_batching() {
        let pool = test_pool();
        let session = direct_session(pool).await;

        let rows: Vec<Vec<DbValue>> = (0..5).map(|i| vec![DbValue::Int32(i)]).collect();
        let id = session
            .put_cursor(Cursor::ResultSet(ResultCursor::new(
                vec!["n".to_string()],
                rows,
            )))
            .unwrap();

        let (batch, more) = session.fetch_batch(&id, 2).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(more);

        let (batch, more) = session.fetch_batch(&id, 2).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(more);

        let (batch, more) = session.fetch_batch(&id, 2).unwrap();
        assert_eq!(batch.len(), 1);
        assert!(!more);

        let (batch, more) = session.fetch_batch(&id, 2).unwrap();
        assert!(batch.is_empty());
        assert!(!more);
    }

    #[tokio::test]
    async fn test_fetch_unknown_cursor_rejected() {
        let pool = test_pool();
        let session = direct_session(pool).await;
        assert!(matches!(
            session.fetch_batch("nope", 10),
            Err(ServerError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_lob_write_read_roundtrip() {
        let pool = test_pool();
        let session = direct_session(pool).await;

        let (id, written) = session.lob_write(None, 0, b"hello ").unwrap();
        assert_eq!(written, 6);
        let (_, _) = session.lob_write(Some(&id), 6, b"world").unwrap();

        let (data, eof) = session.lob_read(&id, 0, 64).unwrap();
        assert_eq!(data, b"hello world");
        assert!(eof);

        let (data, eof) = session.lob_read(&id, 6, 3).unwrap();
        assert_eq!(data, b"wor");
        assert!(!eof);
    }

    #[tokio::test]
    async fn test_op_queue_serializes() {
        let pool = test_pool();
        let session = direct_session(pool).await;

        let guard = session.begin_op().await.unwrap();
        let session2 = session.clone();
        let waiter = tokio::spawn(async move { session2.begin_op().await.map(|_| ()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_attributes() {
        let pool = test_pool();
        let session = direct_session(pool).await;
        session.set_attribute("schema", "public").unwrap();
        assert_eq!(
            session.attribute("schema").unwrap(),
            Some("public".to_string())
        );
        assert_eq!(session.attribute("missing").unwrap(), None);
    }
}
