//! Immutable configuration snapshot handed to each component at construction.
//! Loading (file, env) is the host's job; this module only defines the schema,
//! defaults and validation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub proxies: Vec<ProxyConfig>,
    pub splitting: SplittingConfig,
    pub proxy: ProxyPolicy,
    pub server: ServerConfig,
    pub tunnel: TunnelConfig,
    pub supervisor: SupervisorConfig,
    pub logging: LoggingConfig,
}

/// One upstream CONNECT proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SplittingConfig {
    pub enabled: bool,
    /// Number of worker slots used for chunk accounting.
    pub parts: usize,
    pub chunk_size: usize,
    pub max_retries: u32,
    pub timeout_per_part_ms: u64,
    /// Upper bound of the random delay before each chunk write. 0 disables it.
    pub delivery_jitter_ms: u64,
    pub session_ttl_secs: u64,
    pub eviction_interval_secs: u64,
}

impl Default for SplittingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            parts: 32,
            chunk_size: 4096,
            max_retries: 3,
            timeout_per_part_ms: 30_000,
            delivery_jitter_ms: 0,
            session_ttl_secs: 300,
            eviction_interval_secs: 60,
        }
    }
}

impl SplittingConfig {
    pub fn timeout_per_part(&self) -> Duration {
        Duration::from_millis(self.timeout_per_part_ms)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancing {
    RoundRobin,
    WeightedRoundRobin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyPolicy {
    pub rotation_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub max_failures: u32,
    pub load_balancing: LoadBalancing,
}

impl Default for ProxyPolicy {
    fn default() -> Self {
        Self {
            rotation_interval_ms: 20_000,
            health_check_interval_ms: 10_000,
            probe_timeout_ms: 5_000,
            max_failures: 3,
            load_balancing: LoadBalancing::WeightedRoundRobin,
        }
    }
}

impl ProxyPolicy {
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_millis(self.rotation_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub base_port: u16,
    pub max_connections: usize,
    /// Idle timeout for a relaying session.
    pub timeout_ms: u64,
    pub dial_timeout_ms: u64,
    /// Slot load counters are rebased once the largest exceeds this.
    pub rebase_threshold: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            base_port: 2323,
            max_connections: 10_000,
            timeout_ms: 60_000,
            dial_timeout_ms: 10_000,
            rebase_threshold: 1000,
        }
    }
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

/// Fixed CONNECT preamble sent on every upstream socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelConfig {
    pub target: String,
    pub user_agent: String,
    pub identity_header: String,
    pub identity_value: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            target: "lifetwist.net:443".to_string(),
            user_agent: "Mozilla/5.0 (Linux; Android 14; SM-A245F Build/UP1A.231005.007; wv) \
                         AppleWebKit/537.36 (KHTML, like Gecko) Version/4.0 \
                         Chrome/133.0.6943.138 Mobile Safari/537.36 \
                         [FBAN/InternetOrgApp;FBAV/166.0.0.0.169;]"
                .to_string(),
            identity_header: "x-iorg-bsid".to_string(),
            identity_value: "a08359b0-d7ec-4cb5-97bf-000bdc29ec87".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    pub heartbeat_interval_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 10_000,
        }
    }
}

impl SupervisorConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no proxies configured")]
    NoProxies,
    #[error("proxy {host}:{port} has zero weight")]
    ZeroWeight { host: String, port: u16 },
    #[error("splitting.chunk_size must be positive")]
    ZeroChunkSize,
    #[error("splitting.parts must be positive")]
    ZeroParts,
    #[error("proxy.max_failures must be positive")]
    ZeroMaxFailures,
    #[error("server.rebase_threshold must be positive")]
    ZeroRebaseThreshold,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxies.is_empty() {
            return Err(ConfigError::NoProxies);
        }
        if let Some(p) = self.proxies.iter().find(|p| p.weight == 0) {
            return Err(ConfigError::ZeroWeight {
                host: p.host.clone(),
                port: p.port,
            });
        }
        if self.splitting.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.splitting.parts == 0 {
            return Err(ConfigError::ZeroParts);
        }
        if self.proxy.max_failures == 0 {
            return Err(ConfigError::ZeroMaxFailures);
        }
        if self.server.rebase_threshold == 0 {
            return Err(ConfigError::ZeroRebaseThreshold);
        }
        Ok(())
    }

    /// Listening port for a given worker.
    pub fn worker_port(&self, worker_id: u16) -> u16 {
        self.server.base_port.saturating_add(worker_id)
    }
}
