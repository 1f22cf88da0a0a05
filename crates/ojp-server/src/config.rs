//! Process-wide configuration with defined defaults and overrides
//!
//! Every option is readable from the TOML config file or from the
//! environment (key path with dots replaced by underscores, upper-cased:
//! `server.port` → `SERVER_PORT`). Resolution order is defaults, then
//! environment, then the config file; the process-wide config file wins.

use ojp_core_resilience::{BreakerConfig, SegregationConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("failed to merge config file '{path}': {reason}")]
    Merge { path: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { port: 1407 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrometheusSection {
    pub port: u16,
    pub allowed_ips: Vec<String>,
}

impl Default for PrometheusSection {
    fn default() -> Self {
        Self {
            port: 9159,
            allowed_ips: vec!["*".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenTelemetrySection {
    pub enabled: bool,
    pub endpoint: String,
}

impl Default for OpenTelemetrySection {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub timeout_ms: u64,
    pub threshold: usize,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlowQuerySegregationSection {
    pub enabled: bool,
    pub slow_slot_percentage: u8,
    pub idle_timeout_ms: u64,
    pub slow_slot_timeout_ms: u64,
    pub fast_slot_timeout_ms: u64,
    pub update_global_avg_interval_s: u64,
}

impl Default for SlowQuerySegregationSection {
    fn default() -> Self {
        Self {
            enabled: true,
            slow_slot_percentage: 20,
            idle_timeout_ms: 10_000,
            slow_slot_timeout_ms: 120_000,
            fast_slot_timeout_ms: 60_000,
            update_global_avg_interval_s: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub prometheus: PrometheusSection,
    pub opentelemetry: OpenTelemetrySection,
    pub thread_pool_size: usize,
    /// Maximum decoded request size in bytes
    pub max_request_size: usize,
    pub log_level: String,
    pub allowed_ips: Vec<String>,
    pub connection_idle_timeout_ms: u64,
    pub circuit_breaker: CircuitBreakerSection,
    pub slow_query_segregation: SlowQuerySegregationSection,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            prometheus: PrometheusSection::default(),
            opentelemetry: OpenTelemetrySection::default(),
            thread_pool_size: 200,
            max_request_size: 4 * 1024 * 1024,
            log_level: "INFO".to_string(),
            allowed_ips: vec!["*".to_string()],
            connection_idle_timeout_ms: 30_000,
            circuit_breaker: CircuitBreakerSection::default(),
            slow_query_segregation: SlowQuerySegregationSection::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration: defaults, then environment overrides, then the
    /// config file if one was given. The file wins per key; keys it does
    /// not mention keep their environment or default values.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env();
        let Some(path) = path else {
            return Ok(config);
        };

        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let parse_err = |source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        };
        let overlay: toml::Value = toml::from_str(&raw).map_err(parse_err)?;
        let mut base = toml::Value::try_from(&config).map_err(|e| ConfigError::Merge {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        merge_value(&mut base, overlay);
        base.try_into().map_err(parse_err)
    }

    /// Apply environment-variable overrides.
    pub fn apply_env(&mut self) {
        if let Some(port) = env_parse("SERVER_PORT") {
            self.server.port = port;
        }
        if let Some(port) = env_parse("PROMETHEUS_PORT") {
            self.prometheus.port = port;
        }
        if let Some(ips) = env_list("PROMETHEUS_ALLOWED_IPS") {
            self.prometheus.allowed_ips = ips;
        }
        if let Some(enabled) = env_parse("OPENTELEMETRY_ENABLED") {
            self.opentelemetry.enabled = enabled;
        }
        if let Ok(endpoint) = std::env::var("OPENTELEMETRY_ENDPOINT") {
            self.opentelemetry.endpoint = endpoint;
        }
        if let Some(size) = env_parse("THREAD_POOL_SIZE") {
            self.thread_pool_size = size;
        }
        if let Some(size) = env_parse("MAX_REQUEST_SIZE") {
            self.max_request_size = size;
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(ips) = env_list("ALLOWED_IPS") {
            self.allowed_ips = ips;
        }
        if let Some(ms) = env_parse("CONNECTION_IDLE_TIMEOUT") {
            self.connection_idle_timeout_ms = ms;
        }
        if let Some(ms) = env_parse("CIRCUIT_BREAKER_TIMEOUT") {
            self.circuit_breaker.timeout_ms = ms;
        }
        if let Some(threshold) = env_parse("CIRCUIT_BREAKER_THRESHOLD") {
            self.circuit_breaker.threshold = threshold;
        }
        if let Some(enabled) = env_parse("SLOW_QUERY_SEGREGATION_ENABLED") {
            self.slow_query_segregation.enabled = enabled;
        }
        if let Some(pct) = env_parse("SLOW_QUERY_SEGREGATION_SLOW_SLOT_PERCENTAGE") {
            self.slow_query_segregation.slow_slot_percentage = pct;
        }
        if let Some(ms) = env_parse("SLOW_QUERY_SEGREGATION_IDLE_TIMEOUT") {
            self.slow_query_segregation.idle_timeout_ms = ms;
        }
        if let Some(ms) = env_parse("SLOW_QUERY_SEGREGATION_SLOW_SLOT_TIMEOUT") {
            self.slow_query_segregation.slow_slot_timeout_ms = ms;
        }
        if let Some(ms) = env_parse("SLOW_QUERY_SEGREGATION_FAST_SLOT_TIMEOUT") {
            self.slow_query_segregation.fast_slot_timeout_ms = ms;
        }
        if let Some(s) = env_parse("SLOW_QUERY_SEGREGATION_UPDATE_GLOBAL_AVG_INTERVAL") {
            self.slow_query_segregation.update_global_avg_interval_s = s;
        }
    }

    pub fn connection_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_idle_timeout_ms)
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.circuit_breaker.threshold,
            open_timeout: Duration::from_millis(self.circuit_breaker.timeout_ms),
        }
    }

    /// Segregation parameters for a pool of `total_slots` slots.
    pub fn segregation_config(&self, total_slots: usize) -> SegregationConfig {
        let section = &self.slow_query_segregation;
        SegregationConfig {
            total_slots,
            slow_slot_percentage: section.slow_slot_percentage,
            fast_slot_timeout: Duration::from_millis(section.fast_slot_timeout_ms),
            slow_slot_timeout: Duration::from_millis(section.slow_slot_timeout_ms),
            idle_timeout: Duration::from_millis(section.idle_timeout_ms),
            update_interval: Duration::from_secs(section.update_global_avg_interval_s),
            ..SegregationConfig::default()
        }
    }
}

/// Deep-merge `overlay` into `base`: tables merge per key, every other
/// value type replaces wholesale.
fn merge_value(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_value(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    Some(
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.server.port, 1407);
        assert_eq!(config.prometheus.port, 9159);
        assert!(config.opentelemetry.enabled);
        assert_eq!(config.thread_pool_size, 200);
        assert_eq!(config.max_request_size, 4 * 1024 * 1024);
        assert_eq!(config.log_level, "INFO");
        assert_eq!(config.allowed_ips, vec!["*".to_string()]);
        assert_eq!(config.connection_idle_timeout_ms, 30_000);
        assert_eq!(config.circuit_breaker.timeout_ms, 60_000);
        assert_eq!(config.circuit_breaker.threshold, 3);
        assert!(config.slow_query_segregation.enabled);
        assert_eq!(config.slow_query_segregation.slow_slot_percentage, 20);
        assert_eq!(config.slow_query_segregation.idle_timeout_ms, 10_000);
        assert_eq!(config.slow_query_segregation.slow_slot_timeout_ms, 120_000);
        assert_eq!(config.slow_query_segregation.fast_slot_timeout_ms, 60_000);
        assert_eq!(
            config.slow_query_segregation.update_global_avg_interval_s,
            300
        );
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            log_level = "DEBUG"

            [server]
            port = 2000

            [circuit_breaker]
            threshold = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 2000);
        assert_eq!(config.log_level, "DEBUG");
        assert_eq!(config.circuit_breaker.threshold, 5);
        // Untouched keys keep their defaults.
        assert_eq!(config.circuit_breaker.timeout_ms, 60_000);
        assert_eq!(config.prometheus.port, 9159);
    }

    #[test]
    fn test_file_overrides_win_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ojp.toml");
        std::fs::write(
            &path,
            r#"
            [server]
            port = 1500

            [slow_query_segregation]
            slow_slot_percentage = 35
            "#,
        )
        .unwrap();

        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 1500);
        assert_eq!(config.slow_query_segregation.slow_slot_percentage, 35);
        // Keys the file does not mention keep their defaults.
        assert_eq!(config.slow_query_segregation.slow_slot_timeout_ms, 120_000);
        assert_eq!(config.circuit_breaker.threshold, 3);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = ServerConfig::load(Some(std::path::Path::new("/nonexistent/ojp.toml")));
        assert!(matches!(err, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_breaker_config_conversion() {
        let config = ServerConfig::default();
        let breaker = config.breaker_config();
        assert_eq!(breaker.failure_threshold, 3);
        assert_eq!(breaker.open_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_segregation_config_conversion() {
        let config = ServerConfig::default();
        let seg = config.segregation_config(10);
        assert_eq!(seg.total_slots, 10);
        assert_eq!(seg.slow_slot_percentage, 20);
        assert_eq!(seg.fast_slot_timeout, Duration::from_secs(60));
        assert_eq!(seg.slow_slot_timeout, Duration::from_secs(120));
        assert_eq!(seg.update_interval, Duration::from_secs(300));
    }
}
