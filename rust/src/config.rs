use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use uuid::Uuid;

use crate::gateway::cluster::LoadBalancingStrategy;
use crate::gateway::reliability::BackoffKind;
use crate::jwt::JwtConfig;

// Gateway configuration. Defaults are applied first, then an optional YAML
// file named by WSE_GATEWAY_CONFIG, then single-value environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    // Global concurrent-connection ceiling, shared by all workers.
    pub max_connections: usize,
    pub rate_limit: RateLimitConfig,
    pub ddos_protection: DdosProtectionConfig,
    pub queue: QueueConfig,
    pub dispatcher: DispatcherConfig,
    pub cluster: ClusterConfig,
    pub compression: CompressionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub bind: SocketAddr,
    // Identifies this process on the bus. Random when unset.
    pub instance_id: String,
    pub shutdown_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub issuer: String,
    pub audience: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max_requests: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DdosProtectionConfig {
    // New connections per source tolerated within one window.
    pub max_connections: u32,
    // Window length; also the blacklist duration.
    #[serde(alias = "connectionWindow")]
    pub connection_window_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueConfig {
    pub max_size: usize,
    pub batch_size: usize,
    pub batch_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DispatcherConfig {
    pub max_concurrent_per_device: usize,
    #[serde(alias = "defaultTimeout")]
    pub default_timeout_ms: u64,
    pub max_queue_size: usize,
    pub queue_if_offline: bool,
    pub retry_strategy: RetryStrategyConfig,
    // Completed command outcomes kept for duplicate detection.
    pub completed_cache_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryStrategyConfig {
    // Total attempts, first try included.
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    #[serde(alias = "initialDelay")]
    pub initial_delay_ms: u64,
    #[serde(alias = "maxDelay")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterConfig {
    pub workers: usize,
    pub load_balancing: LoadBalancingConfig,
    pub health_check_interval_ms: u64,
    pub metrics_interval_ms: u64,
    pub bus: BusConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoadBalancingConfig {
    pub strategy: LoadBalancingStrategy,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BusConfig {
    // In-process bus when unset.
    pub redis_url: Option<String>,
    // Unsigned envelopes when unset.
    pub signing_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompressionConfig {
    pub threshold_bytes: usize,
    pub level: u32,
}

const DEFAULT_BIND_PORT: u16 = 5006;

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            max_connections: 10_000,
            rate_limit: RateLimitConfig::default(),
            ddos_protection: DdosProtectionConfig::default(),
            queue: QueueConfig::default(),
            dispatcher: DispatcherConfig::default(),
            cluster: ClusterConfig::default(),
            compression: CompressionConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_BIND_PORT)),
            instance_id: Uuid::now_v7().to_string(),
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 1_000,
            max_requests: 100,
        }
    }
}

impl Default for DdosProtectionConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            connection_window_ms: 10_000,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1_000,
            batch_size: 10,
            batch_interval_ms: 100,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_device: 1,
            default_timeout_ms: 30_000,
            max_queue_size: 100,
            queue_if_offline: true,
            retry_strategy: RetryStrategyConfig::default(),
            completed_cache_size: 10_000,
        }
    }
}

impl Default for RetryStrategyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Exponential,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            load_balancing: LoadBalancingConfig::default(),
            health_check_interval_ms: 5_000,
            metrics_interval_ms: 10_000,
            bus: BusConfig::default(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: 1_024,
            level: 6,
        }
    }
}

impl GatewayConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = match std::env::var("WSE_GATEWAY_CONFIG") {
            Ok(path) => {
                let contents = fs::read_to_string(&path)
                    .with_context(|| format!("read WSE_GATEWAY_CONFIG: {path}"))?;
                Self::from_yaml_str(&contents)?
            }
            Err(_) => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).with_context(|| "parse gateway config yaml")
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("WSE_GATEWAY_BIND") {
            self.server.bind = value.parse().with_context(|| "parse WSE_GATEWAY_BIND")?;
        }
        if let Ok(value) = std::env::var("WSE_GATEWAY_JWT_SECRET") {
            self.auth.jwt_secret = value;
        }
        if let Ok(value) = std::env::var("WSE_GATEWAY_REDIS_URL") {
            self.cluster.bus.redis_url = Some(value).filter(|v| !v.is_empty());
        }
        if let Some(workers) = std::env::var("WSE_GATEWAY_WORKERS")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
        {
            self.cluster.workers = workers;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, bool); 10] = [
            ("maxConnections", self.max_connections > 0),
            ("rateLimit.windowMs", self.rate_limit.window_ms > 0),
            ("queue.maxSize", self.queue.max_size > 0),
            ("queue.batchSize", self.queue.batch_size > 0),
            ("queue.batchIntervalMs", self.queue.batch_interval_ms > 0),
            (
                "dispatcher.maxConcurrentPerDevice",
                self.dispatcher.max_concurrent_per_device > 0,
            ),
            (
                "dispatcher.retryStrategy.maxAttempts",
                self.dispatcher.retry_strategy.max_attempts > 0,
            ),
            ("cluster.workers", self.cluster.workers > 0),
            (
                "cluster.healthCheckIntervalMs",
                self.cluster.health_check_interval_ms > 0,
            ),
            (
                "cluster.metricsIntervalMs",
                self.cluster.metrics_interval_ms > 0,
            ),
        ];
        for (name, ok) in checks {
            anyhow::ensure!(ok, "{name} must be greater than zero");
        }
        Ok(())
    }

    pub fn jwt_config(&self) -> JwtConfig {
        JwtConfig {
            secret: self.auth.jwt_secret.as_bytes().to_vec(),
            issuer: self.auth.issuer.clone(),
            audience: self.auth.audience.clone(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl DdosProtectionConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.connection_window_ms)
    }
}

impl QueueConfig {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }
}

impl ClusterConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = GatewayConfig::default();
        config.validate().unwrap();
        assert_eq!(config.queue.max_size, 1_000);
        assert_eq!(config.queue.batch_size, 10);
        assert_eq!(config.queue.batch_interval(), Duration::from_millis(100));
        assert_eq!(config.cluster.health_check_interval(), Duration::from_secs(5));
        assert_eq!(config.dispatcher.retry_strategy.backoff, BackoffKind::Exponential);
    }

    #[test]
    fn yaml_uses_camel_case_keys_and_keeps_defaults() {
        let yaml = r#"
maxConnections: 200
rateLimit:
  windowMs: 1000
  maxRequests: 10
ddosProtection:
  maxConnections: 5
  connectionWindow: 2000
dispatcher:
  maxConcurrentPerDevice: 2
  defaultTimeout: 500
  retryStrategy:
    maxAttempts: 4
    backoff: linear
    initialDelay: 100
    maxDelay: 1000
cluster:
  workers: 3
  loadBalancing:
    strategy: least-connections
"#;
        let config = GatewayConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.max_connections, 200);
        assert_eq!(config.rate_limit.max_requests, 10);
        assert_eq!(config.ddos_protection.connection_window_ms, 2000);
        assert_eq!(config.dispatcher.max_concurrent_per_device, 2);
        assert_eq!(config.dispatcher.default_timeout_ms, 500);
        assert_eq!(config.dispatcher.retry_strategy.max_attempts, 4);
        assert_eq!(config.dispatcher.retry_strategy.backoff, BackoffKind::Linear);
        assert_eq!(config.cluster.workers, 3);
        assert_eq!(
            config.cluster.load_balancing.strategy,
            LoadBalancingStrategy::LeastConnections
        );
        // untouched sections keep their defaults
        assert_eq!(config.queue.max_size, 1_000);
        assert_eq!(config.dispatcher.max_queue_size, 100);
    }

    #[test]
    fn validate_rejects_zero_sizes() {
        let mut config = GatewayConfig::default();
        config.queue.batch_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("queue.batchSize"));
    }
}
