//! Generic connection pool for reusable backend connections
//!
//! Provides connection reuse with configurable limits, idle timeouts,
//! health checking, and cooperative resizing. The coordinator layer never
//! resizes a pool directly; it advertises new targets and the pool applies
//! them through [`ConnectionPool::resize`] on its next maintenance cycle.

use super::error::ResilienceError;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info};

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool name used in logs and diagnostics
    pub name: String,
    /// Maximum number of connections in the pool
    pub max_size: usize,
    /// Minimum number of idle connections to maintain
    pub min_idle: usize,
    /// Maximum time a connection can remain idle before being closed
    pub idle_timeout: Option<Duration>,
    /// Maximum lifetime of a connection
    pub max_lifetime: Option<Duration>,
    /// Timeout for acquiring a connection from the pool
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "pool".to_string(),
            max_size: 10,
            min_idle: 2,
            idle_timeout: Some(Duration::from_secs(600)),
            max_lifetime: Some(Duration::from_secs(1800)),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// A connection wrapper that tracks metadata
#[derive(Debug)]
struct PooledConnection<T> {
    /// The actual connection
    conn: T,
    /// When this connection was created
    created_at: Instant,
    /// When this connection was last used
    last_used: Instant,
}

impl<T> PooledConnection<T> {
    fn new(conn: T) -> Self {
        let now = Instant::now();
        Self {
            conn,
            created_at: now,
            last_used: now,
        }
    }

    fn is_expired(&self, idle_timeout: Option<Duration>, max_lifetime: Option<Duration>) -> bool {
        if let Some(idle_timeout) = idle_timeout {
            if self.last_used.elapsed() > idle_timeout {
                return true;
            }
        }
        if let Some(max_lifetime) = max_lifetime {
            if self.created_at.elapsed() > max_lifetime {
                return true;
            }
        }
        false
    }

    fn update_last_used(&mut self) {
        self.last_used = Instant::now();
    }
}

/// Factory trait for creating and validating connections
#[async_trait::async_trait]
pub trait ConnectionFactory<T: Send + 'static>: Send + Sync {
    /// Create a new connection
    async fn create(&self) -> Result<T, ResilienceError>;

    /// Check if a connection is still healthy
    async fn is_healthy(&self, conn: &T) -> bool;

    /// Close a connection (optional cleanup)
    async fn close(&self, conn: T) {
        drop(conn);
    }
}

/// Internal pool state
struct PoolState<T> {
    /// Available connections
    idle: Vec<PooledConnection<T>>,
    /// Number of connections currently in use
    active_count: usize,
    /// Current maximum pool size (resize target applied)
    max_size: usize,
    /// Current minimum idle target
    min_idle: usize,
    /// Permits owed to the semaphore after a shrink; repaid on release
    permit_debt: usize,
    /// Whether the pool has been closed
    closed: bool,
}

impl<T> PoolState<T> {
    fn total_count(&self) -> usize {
        self.idle.len() + self.active_count
    }
}

/// A generic connection pool.
///
/// The semaphore bounds connections in active use; `max_size` bounds the
/// total (active + idle). Shrinking takes effect lazily: available permits
/// are swallowed immediately and the remainder is repaid as active
/// connections are released.
pub struct ConnectionPool<T> {
    idle_timeout: Option<Duration>,
    max_lifetime: Option<Duration>,
    acquire_timeout: Duration,
    name: String,
    factory: Arc<dyn ConnectionFactory<T>>,
    state: Arc<Mutex<PoolState<T>>>,
    semaphore: Arc<Semaphore>,
}

impl<T: Send + 'static> ConnectionPool<T> {
    /// Create a new connection pool
    pub fn new(factory: Arc<dyn ConnectionFactory<T>>, config: PoolConfig) -> Self {
        let max_size = config.max_size;
        Self {
            idle_timeout: config.idle_timeout,
            max_lifetime: config.max_lifetime,
            acquire_timeout: config.acquire_timeout,
            name: config.name,
            factory,
            state: Arc::new(Mutex::new(PoolState {
                idle: Vec::new(),
                active_count: 0,
                max_size,
                min_idle: config.min_idle,
                permit_debt: 0,
                closed: false,
            })),
            semaphore: Arc::new(Semaphore::new(max_size)),
        }
    }

    /// Create a connection pool with default configuration
    pub fn new_default(factory: Arc<dyn ConnectionFactory<T>>) -> Self {
        Self::new(factory, PoolConfig::default())
    }

    /// Pool name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire a connection using the configured timeout
    pub async fn acquire(&self) -> Result<T, ResilienceError> {
        self.acquire_timeout(self.acquire_timeout).await
    }

    /// Acquire a connection from the pool with an explicit timeout.
    ///
    /// If no idle connection is available and the pool is below capacity a
    /// new connection is created; at capacity the call waits until a
    /// connection is released or the timeout elapses.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<T, ResilienceError> {
        let permit = match tokio::time::timeout(timeout, self.semaphore.acquire()).await {
            Err(_) => return Err(ResilienceError::Timeout(timeout)),
            Ok(Err(_)) => return Err(ResilienceError::PoolClosed),
            Ok(Ok(permit)) => permit,
        };
        // Permits are managed manually from here on.
        permit.forget();

        let mut state = self.state.lock().await;
        if state.closed {
            Self::return_permit(&self.semaphore, &mut state);
            return Err(ResilienceError::PoolClosed);
        }

        // Drop expired idle connections.
        let (idle_timeout, max_lifetime) = (self.idle_timeout, self.max_lifetime);
        let expired: Vec<PooledConnection<T>> = {
            let mut kept = Vec::with_capacity(state.idle.len());
            let mut expired = Vec::new();
            for conn in state.idle.drain(..) {
                if conn.is_expired(idle_timeout, max_lifetime) {
                    expired.push(conn);
                } else {
                    kept.push(conn);
                }
            }
            state.idle = kept;
            expired
        };

        // Try to reuse an idle connection.
        loop {
            let Some(mut pooled) = state.idle.pop() else {
                break;
            };
            if self.factory.is_healthy(&pooled.conn).await {
                pooled.update_last_used();
                state.active_count += 1;
                drop(state);
                for dead in expired {
                    self.factory.close(dead.conn).await;
                }
                return Ok(pooled.conn);
            }
            self.factory.close(pooled.conn).await;
        }

        // No idle connections, create a new one.
        state.active_count += 1;
        drop(state);
        for dead in expired {
            self.factory.close(dead.conn).await;
        }

        match self.factory.create().await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                let mut state = self.state.lock().await;
                state.active_count -= 1;
                Self::return_permit(&self.semaphore, &mut state);
                Err(e)
            }
        }
    }

    /// Return a connection to the pool.
    ///
    /// The connection is health-checked before re-entering the idle set; an
    /// unhealthy connection, or one over the (possibly shrunk) capacity, is
    /// closed instead.
    pub async fn release(&self, conn: T) {
        let healthy = self.factory.is_healthy(&conn).await;
        let mut state = self.state.lock().await;
        state.active_count -= 1;

        let should_keep = !state.closed && state.total_count() < state.max_size && healthy;
        if should_keep {
            state.idle.push(PooledConnection::new(conn));
            Self::return_permit(&self.semaphore, &mut state);
        } else {
            Self::return_permit(&self.semaphore, &mut state);
            drop(state);
            self.factory.close(conn).await;
        }
    }

    /// Evict a connection that is in an unusable state.
    ///
    /// The connection is closed and never re-enters the idle set.
    pub async fn discard(&self, conn: T) {
        let mut state = self.state.lock().await;
        state.active_count -= 1;
        Self::return_permit(&self.semaphore, &mut state);
        drop(state);
        debug!(pool = %self.name, "discarding unusable connection");
        self.factory.close(conn).await;
    }

    /// Apply a new capacity target advertised by the coordinator.
    ///
    /// Growing adds permits immediately. Shrinking swallows currently
    /// available permits and records the remainder as debt repaid on
    /// release; surplus idle connections are closed right away.
    pub async fn resize(&self, max_size: usize, min_idle: usize) {
        let max_size = max_size.max(1);
        let mut surplus = Vec::new();
        {
            let mut state = self.state.lock().await;
            if state.closed || state.max_size == max_size {
                state.min_idle = min_idle;
                return;
            }
            info!(
                pool = %self.name,
                from = state.max_size,
                to = max_size,
                "resizing pool"
            );
            if max_size > state.max_size {
                let grow = max_size - state.max_size;
                // Growth first repays debt, then adds real permits.
                let repaid = grow.min(state.permit_debt);
                state.permit_debt -= repaid;
                self.semaphore.add_permits(grow - repaid);
            } else {
                let mut shrink = state.max_size - max_size;
                while shrink > 0 {
                    match self.semaphore.try_acquire() {
                        Ok(permit) => {
                            permit.forget();
                            shrink -= 1;
                        }
                        Err(_) => break,
                    }
                }
                state.permit_debt += shrink;
                while state.total_count() > max_size && !state.idle.is_empty() {
                    if let Some(pooled) = state.idle.pop() {
                        surplus.push(pooled);
                    }
                }
            }
            state.max_size = max_size;
            state.min_idle = min_idle;
        }
        for pooled in surplus {
            self.factory.close(pooled.conn).await;
        }
    }

    /// Close the pool.
    ///
    /// Waiting acquires fail with [`ResilienceError::PoolClosed`]; idle
    /// connections are closed immediately. Connections in active use are
    /// closed as they are released.
    pub async fn close(&self) {
        let idle = {
            let mut state = self.state.lock().await;
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        self.semaphore.close();
        for pooled in idle {
            self.factory.close(pooled.conn).await;
        }
    }

    /// Get current pool statistics
    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            idle: state.idle.len(),
            active: state.active_count,
            total: state.total_count(),
            max_size: state.max_size,
        }
    }

    /// Maintain minimum idle connections
    pub async fn maintain_idle(&self) -> Result<(), ResilienceError> {
        let to_create = {
            let state = self.state.lock().await;
            if state.closed {
                return Ok(());
            }
            let needed = state.min_idle.saturating_sub(state.idle.len());
            if needed == 0 || state.total_count() >= state.max_size {
                return Ok(());
            }
            needed.min(state.max_size - state.total_count())
        };

        for _ in 0..to_create {
            let conn = self.factory.create().await?;
            let mut state = self.state.lock().await;
            if state.closed || state.total_count() >= state.max_size {
                drop(state);
                self.factory.close(conn).await;
                return Ok(());
            }
            state.idle.push(PooledConnection::new(conn));
        }
        Ok(())
    }

    fn return_permit(semaphore: &Semaphore, state: &mut PoolState<T>) {
        if state.permit_debt > 0 {
            state.permit_debt -= 1;
        } else {
            semaphore.add_permits(1);
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Number of idle connections
    pub idle: usize,
    /// Number of active connections
    pub active: usize,
    /// Total connections (idle + active)
    pub total: usize,
    /// Maximum pool size
    pub max_size: usize,
}

impl PoolStats {
    /// Get pool utilization as a percentage
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            (self.total as f64 / self.max_size as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct TestConnection {
        id: usize,
        healthy: Arc<Mutex<bool>>,
    }

    struct TestFactory {
        counter: Arc<Mutex<usize>>,
    }

    impl TestFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                counter: Arc::new(Mutex::new(0)),
            })
        }
    }

    #[async_trait::async_trait]
    impl ConnectionFactory<TestConnection> for TestFactory {
        async fn create(&self) -> Result<TestConnection, ResilienceError> {
            let mut counter = self.counter.lock().await;
            *counter += 1;
            Ok(TestConnection {
                id: *counter,
                healthy: Arc::new(Mutex::new(true)),
            })
        }

        async fn is_healthy(&self, conn: &TestConnection) -> bool {
            *conn.healthy.lock().await
        }
    }

    fn small_config(max_size: usize) -> PoolConfig {
        PoolConfig {
            max_size,
            min_idle: 0,
            acquire_timeout: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_pool_acquire_release() {
        let pool = ConnectionPool::new(TestFactory::new(), small_config(5));

        let conn1 = pool.acquire().await.unwrap();
        assert_eq!(conn1.id, 1);

        let stats = pool.stats().await;
        assert_eq!(stats.active, 1);
        assert_eq!(stats.idle, 0);

        pool.release(conn1).await;

        let stats = pool.stats().await;
        assert_eq!(stats.active, 0);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn test_pool_reuse() {
        let pool = ConnectionPool::new(TestFactory::new(), small_config(5));

        let conn1 = pool.acquire().await.unwrap();
        let id1 = conn1.id;
        pool.release(conn1).await;

        let conn2 = pool.acquire().await.unwrap();
        assert_eq!(conn2.id, id1);
    }

    #[tokio::test]
    async fn test_pool_max_size_blocks() {
        let pool = Arc::new(ConnectionPool::new(TestFactory::new(), small_config(2)));

        let conn1 = pool.acquire().await.unwrap();
        let conn2 = pool.acquire().await.unwrap();

        let result = pool.acquire().await;
        assert!(matches!(result, Err(ResilienceError::Timeout(_))));

        pool.release(conn1).await;
        let _conn3 = pool.acquire().await.unwrap();

        pool.release(conn2).await;
    }

    #[tokio::test]
    async fn test_unhealthy_connection_not_reused() {
        let pool = ConnectionPool::new(TestFactory::new(), small_config(5));

        let conn = pool.acquire().await.unwrap();
        *conn.healthy.lock().await = false;
        pool.release(conn).await;

        assert_eq!(pool.stats().await.idle, 0);
        // The next acquire creates a fresh connection.
        let conn2 = pool.acquire().await.unwrap();
        assert_eq!(conn2.id, 2);
    }

    #[tokio::test]
    async fn test_discard_frees_capacity() {
        let pool = ConnectionPool::new(TestFactory::new(), small_config(1));

        let conn = pool.acquire().await.unwrap();
        pool.discard(conn).await;

        // Capacity is available again and the connection is gone.
        let conn2 = pool.acquire().await.unwrap();
        assert_eq!(conn2.id, 2);
        assert_eq!(pool.stats().await.total, 1);
    }

    #[tokio::test]
    async fn test_resize_grow() {
        let pool = Arc::new(ConnectionPool::new(TestFactory::new(), small_config(1)));

        let conn1 = pool.acquire().await.unwrap();
        assert!(pool.acquire().await.is_err());

        pool.resize(2, 0).await;
        let conn2 = pool.acquire().await.unwrap();

        pool.release(conn1).await;
        pool.release(conn2).await;
        assert_eq!(pool.stats().await.max_size, 2);
    }

    #[tokio::test]
    async fn test_resize_shrink_applies_lazily() {
        let pool = Arc::new(ConnectionPool::new(TestFactory::new(), small_config(3)));

        let conn1 = pool.acquire().await.unwrap();
        let conn2 = pool.acquire().await.unwrap();

        // Shrink while two connections are in use: the surviving capacity
        // is one, so after both releases only one acquire may proceed.
        pool.resize(1, 0).await;

        pool.release(conn1).await;
        pool.release(conn2).await;

        let stats = pool.stats().await;
        assert_eq!(stats.max_size, 1);
        assert!(stats.total <= 1);

        let conn3 = pool.acquire().await.unwrap();
        assert!(pool.acquire().await.is_err());
        pool.release(conn3).await;
    }

    #[tokio::test]
    async fn test_resize_shrink_closes_surplus_idle() {
        let pool = Arc::new(ConnectionPool::new(TestFactory::new(), small_config(3)));

        let conn1 = pool.acquire().await.unwrap();
        let conn2 = pool.acquire().await.unwrap();
        pool.release(conn1).await;
        pool.release(conn2).await;
        assert_eq!(pool.stats().await.idle, 2);

        pool.resize(1, 0).await;
        assert!(pool.stats().await.total <= 1);
    }

    #[tokio::test]
    async fn test_close_rejects_acquire() {
        let pool = ConnectionPool::new(TestFactory::new(), small_config(2));

        let conn = pool.acquire().await.unwrap();
        pool.close().await;

        assert!(matches!(
            pool.acquire().await,
            Err(ResilienceError::PoolClosed)
        ));
        // Releasing after close closes the connection rather than pooling it.
        pool.release(conn).await;
        assert_eq!(pool.stats().await.idle, 0);
    }

    #[tokio::test]
    async fn test_maintain_idle() {
        let config = PoolConfig {
            max_size: 5,
            min_idle: 3,
            acquire_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let pool = ConnectionPool::new(TestFactory::new(), config);

        pool.maintain_idle().await.unwrap();
        assert_eq!(pool.stats().await.idle, 3);
    }
}
