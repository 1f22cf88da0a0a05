//! Datasource configuration and pool construction
//!
//! Per-datasource pool parameters come from client-supplied properties with
//! documented defaults. The pool configurer merges those with the
//! coordinator's divided allocation, installs fixed operational defaults,
//! and names the pool `OJP-Pool-<datasource>-<epoch-ms>`. The registry
//! holds one pool per connection hash and applies coordinator targets on
//! the maintenance cycle, never mid-request.

use crate::backend::{
    BackendConn, BackendConnector, BackendPool, ConnectionDetails, ConnectionHash,
};
use crate::error::ServerError;
use dashmap::DashMap;
use ojp_core_cluster::PoolCoordinator;
use ojp_core_resilience::{ConnectionFactory, PoolConfig, ResilienceError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;

/// Per-datasource pool parameters resolved from client properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasourceConfig {
    pub data_source_name: String,
    pub maximum_pool_size: usize,
    pub minimum_idle: usize,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub connection_timeout: Duration,
    /// Requested cluster-wide cap on concurrent XA transactions
    pub max_xa_transactions: usize,
}

impl Default for DatasourceConfig {
    fn default() -> Self {
        Self {
            data_source_name: "default".to_string(),
            maximum_pool_size: 10,
            minimum_idle: 10,
            idle_timeout: Duration::from_millis(600_000),
            max_lifetime: Duration::from_millis(1_800_000),
            connection_timeout: Duration::from_millis(30_000),
            max_xa_transactions: 10,
        }
    }
}

impl DatasourceConfig {
    /// Resolve from the raw client property map. Unknown keys are ignored;
    /// a malformed number is an invalid argument. `minimumIdle` defaults to
    /// the maximum pool size when absent.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self, ServerError> {
        let mut config = Self::default();
        if let Some(name) = props.get("dataSourceName") {
            if !name.is_empty() {
                config.data_source_name = name.clone();
            }
        }
        if let Some(max) = parse_prop::<usize>(props, "maximumPoolSize")? {
            config.maximum_pool_size = max.max(1);
            config.minimum_idle = config.maximum_pool_size;
        }
        if let Some(min) = parse_prop::<usize>(props, "minimumIdle")? {
            config.minimum_idle = min.min(config.maximum_pool_size);
        }
        if let Some(ms) = parse_prop::<u64>(props, "idleTimeout")? {
            config.idle_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_prop::<u64>(props, "maxLifetime")? {
            config.max_lifetime = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_prop::<u64>(props, "connectionTimeout")? {
            config.connection_timeout = Duration::from_millis(ms);
        }
        if let Some(max) = parse_prop::<usize>(props, "maximumXaTransactions")? {
            config.max_xa_transactions = max.max(1);
        }
        Ok(config)
    }
}

fn parse_prop<T: std::str::FromStr>(
    props: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, ServerError> {
    match props.get(key) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            ServerError::InvalidArgument(format!("invalid value '{}' for property '{}'", raw, key))
        }),
    }
}

/// Fixed operational defaults installed on every pool.
#[derive(Debug, Clone)]
pub struct OperationalDefaults {
    pub statement_cache_enabled: bool,
    pub leak_detection: Duration,
    pub validation_timeout: Duration,
    pub initialization_fail_timeout: Duration,
}

impl Default for OperationalDefaults {
    fn default() -> Self {
        Self {
            statement_cache_enabled: true,
            leak_detection: Duration::from_secs(60),
            validation_timeout: Duration::from_secs(5),
            initialization_fail_timeout: Duration::from_secs(10),
        }
    }
}

/// Adapts a [`BackendConnector`] to the generic pool's factory seam.
pub struct BackendConnectionFactory {
    connector: Arc<dyn BackendConnector>,
    details: ConnectionDetails,
}

impl BackendConnectionFactory {
    pub fn new(connector: Arc<dyn BackendConnector>, details: ConnectionDetails) -> Self {
        Self { connector, details }
    }
}

#[async_trait::async_trait]
impl ConnectionFactory<BackendConn> for BackendConnectionFactory {
    async fn create(&self) -> Result<BackendConn, ResilienceError> {
        self.connector
            .connect(&self.details)
            .await
            .map_err(|e| ResilienceError::Setup(e.to_string()))
    }

    async fn is_healthy(&self, conn: &BackendConn) -> bool {
        conn.is_usable()
    }

    async fn close(&self, conn: BackendConn) {
        conn.close().await;
    }
}

/// Builds the resolved pool configuration for a datasource.
pub struct PoolConfigurer {
    coordinator: Arc<PoolCoordinator>,
    defaults: OperationalDefaults,
}

impl PoolConfigurer {
    pub fn new(coordinator: Arc<PoolCoordinator>) -> Self {
        Self {
            coordinator,
            defaults: OperationalDefaults::default(),
        }
    }

    /// Merge client parameters with the coordinator's divided allocation.
    pub fn configure(
        &self,
        conn_hash: &ConnectionHash,
        ds: &DatasourceConfig,
        endpoints: &[String],
    ) -> PoolConfig {
        let allocation = self.coordinator.calculate_pool_sizes(
            conn_hash.as_str(),
            ds.maximum_pool_size,
            ds.minimum_idle,
            endpoints,
        );
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let name = format!("OJP-Pool-{}-{}", ds.data_source_name, epoch_ms);
        info!(
            pool = %name,
            max = allocation.current_max(),
            min_idle = allocation.current_min_idle(),
            statement_cache = self.defaults.statement_cache_enabled,
            leak_detection_s = self.defaults.leak_detection.as_secs(),
            validation_s = self.defaults.validation_timeout.as_secs(),
            init_fail_s = self.defaults.initialization_fail_timeout.as_secs(),
            "configured pool"
        );
        PoolConfig {
            name,
            max_size: allocation.current_max(),
            min_idle: allocation.current_min_idle(),
            idle_timeout: Some(ds.idle_timeout),
            max_lifetime: Some(ds.max_lifetime),
            acquire_timeout: ds.connection_timeout,
        }
    }
}

/// One pool per connection hash.
pub struct PoolRegistry {
    pools: DashMap<String, Arc<BackendPool>>,
    connector: Arc<dyn BackendConnector>,
    configurer: PoolConfigurer,
    coordinator: Arc<PoolCoordinator>,
}

impl PoolRegistry {
    pub fn new(connector: Arc<dyn BackendConnector>, coordinator: Arc<PoolCoordinator>) -> Self {
        Self {
            pools: DashMap::new(),
            connector,
            configurer: PoolConfigurer::new(coordinator.clone()),
            coordinator,
        }
    }

    /// Get or build the pool for a connection hash.
    pub fn pool_for(
        &self,
        conn_hash: &ConnectionHash,
        details: &ConnectionDetails,
        ds: &DatasourceConfig,
        endpoints: &[String],
    ) -> Arc<BackendPool> {
        self.pools
            .entry(conn_hash.as_str().to_string())
            .or_insert_with(|| {
                let config = self.configurer.configure(conn_hash, ds, endpoints);
                let factory = Arc::new(BackendConnectionFactory::new(
                    self.connector.clone(),
                    details.clone(),
                ));
                Arc::new(BackendPool::new(factory, config))
            })
            .clone()
    }

    /// The pool for a connection hash, if one has been built.
    pub fn get(&self, conn_hash: &ConnectionHash) -> Option<Arc<BackendPool>> {
        self.pools.get(conn_hash.as_str()).map(|p| p.clone())
    }

    /// Apply the coordinator's current targets to every pool and top up
    /// minimum idle connections. Called from the maintenance tick.
    pub async fn apply_targets(&self) {
        let pools: Vec<(String, Arc<BackendPool>)> = self
            .pools
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (conn_hash, pool) in pools {
            if let Some(allocation) = self.coordinator.current(&conn_hash) {
                pool.resize(allocation.current_max(), allocation.current_min_idle())
                    .await;
            }
            if let Err(e) = pool.maintain_idle().await {
                tracing::warn!(pool = pool.name(), error = %e, "idle top-up failed");
            }
        }
    }

    /// Close every pool (shutdown path).
    pub async fn close_all(&self) {
        let pools: Vec<Arc<BackendPool>> = self.pools.iter().map(|e| e.value().clone()).collect();
        for pool in pools {
            pool.close().await;
        }
        self.pools.clear();
    }
}
