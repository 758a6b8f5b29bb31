use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::CoreError;
use crate::types::{ClusterType, ServerAddress};

/// How a monitor observes its node once the first heartbeat has succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitoringMode {
    /// Stream when the node reports a topology version, otherwise poll.
    Auto,
    Stream,
    Poll,
}

/// Cluster connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Seed list, `host[:port]`
    pub hosts: Vec<String>,
    pub replica_set: Option<String>,
    pub direct_connection: bool,
    pub load_balanced: bool,
    pub heartbeat_frequency_ms: u64,
    /// Floor for back-to-back checks, including requested ones
    pub min_heartbeat_frequency_ms: u64,
    pub connect_timeout_ms: u64,
    pub server_selection_timeout_ms: u64,
    /// Latency window added to the fastest eligible server's RTT
    pub local_threshold_ms: u64,
    pub monitoring_mode: MonitoringMode,
    pub pool: PoolConfig,
}

/// Per-node connection pool settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_pool_size: usize,
    pub min_pool_size: usize,
    pub wait_queue_timeout_ms: u64,
    /// 0 disables idle expiry
    pub max_idle_time_ms: u64,
    pub maintenance_interval_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["localhost:27017".to_string()],
            replica_set: None,
            direct_connection: false,
            load_balanced: false,
            heartbeat_frequency_ms: 10_000,
            min_heartbeat_frequency_ms: 500,
            connect_timeout_ms: 10_000,
            server_selection_timeout_ms: 30_000,
            local_threshold_ms: 15,
            monitoring_mode: MonitoringMode::Auto,
            pool: PoolConfig::default(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 100,
            min_pool_size: 0,
            wait_queue_timeout_ms: 10_000,
            max_idle_time_ms: 0,
            maintenance_interval_ms: 1_000,
        }
    }
}

impl ClusterConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read cluster config: {:?}", path))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to load cluster config: {:?}", path))?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> std::result::Result<Self, CoreError> {
        let config: Self =
            toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), CoreError> {
        let seeds = self.seed_addresses()?;
        if seeds.is_empty() {
            return Err(CoreError::Config("at least one host is required".to_string()));
        }
        if self.direct_connection && seeds.len() > 1 {
            return Err(CoreError::Config(
                "direct connection requires exactly one host".to_string(),
            ));
        }
        if self.load_balanced {
            if seeds.len() > 1 {
                return Err(CoreError::Config(
                    "load-balanced mode requires exactly one host".to_string(),
                ));
            }
            if self.replica_set.is_some() || self.direct_connection {
                return Err(CoreError::Config(
                    "load-balanced mode cannot be combined with replica set or direct connection"
                        .to_string(),
                ));
            }
        }
        if self.min_heartbeat_frequency_ms == 0
            || self.heartbeat_frequency_ms < self.min_heartbeat_frequency_ms
        {
            return Err(CoreError::Config(format!(
                "heartbeat frequency {}ms must be at least the minimum of {}ms",
                self.heartbeat_frequency_ms, self.min_heartbeat_frequency_ms
            )));
        }
        if self.pool.max_pool_size == 0 {
            return Err(CoreError::Config("max pool size must be positive".to_string()));
        }
        if self.pool.min_pool_size > self.pool.max_pool_size {
            return Err(CoreError::Config(format!(
                "min pool size {} exceeds max pool size {}",
                self.pool.min_pool_size, self.pool.max_pool_size
            )));
        }
        Ok(())
    }

    pub fn seed_addresses(&self) -> std::result::Result<Vec<ServerAddress>, CoreError> {
        let mut seeds: Vec<ServerAddress> = Vec::with_capacity(self.hosts.len());
        for host in &self.hosts {
            let address = ServerAddress::parse(host)?;
            if !seeds.contains(&address) {
                seeds.push(address);
            }
        }
        Ok(seeds)
    }

    pub fn initial_cluster_type(&self) -> ClusterType {
        if self.load_balanced {
            ClusterType::LoadBalanced
        } else if self.direct_connection {
            ClusterType::Single
        } else if self.replica_set.is_some() {
            ClusterType::ReplicaSetNoPrimary
        } else {
            ClusterType::Unknown
        }
    }

    pub fn heartbeat_frequency(&self) -> Duration {
        Duration::from_millis(self.heartbeat_frequency_ms)
    }

    pub fn min_heartbeat_frequency(&self) -> Duration {
        Duration::from_millis(self.min_heartbeat_frequency_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn server_selection_timeout(&self) -> Duration {
        Duration::from_millis(self.server_selection_timeout_ms)
    }

    pub fn local_threshold(&self) -> Duration {
        Duration::from_millis(self.local_threshold_ms)
    }
}

impl PoolConfig {
    pub fn wait_queue_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_queue_timeout_ms)
    }

    pub fn max_idle_time(&self) -> Option<Duration> {
        (self.max_idle_time_ms > 0).then(|| Duration::from_millis(self.max_idle_time_ms))
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config() {
        let config = ClusterConfig::from_toml_str(
            r#"
            hosts = ["a.example.com:27017", "b.example.com:27018", "A.example.com"]
            replica_set = "rs0"
            heartbeat_frequency_ms = 5000
            monitoring_mode = "poll"

            [pool]
            max_pool_size = 10
            min_pool_size = 2
            "#,
        )
        .unwrap();

        // duplicates after normalisation collapse
        assert_eq!(config.seed_addresses().unwrap().len(), 2);
        assert_eq!(config.initial_cluster_type(), ClusterType::ReplicaSetNoPrimary);
        assert_eq!(config.heartbeat_frequency(), Duration::from_secs(5));
        assert_eq!(config.monitoring_mode, MonitoringMode::Poll);
        assert_eq!(config.pool.max_pool_size, 10);
        // untouched fields keep defaults
        assert_eq!(config.local_threshold_ms, 15);
        assert_eq!(config.pool.max_idle_time(), None);
    }

    #[test]
    fn test_rejects_conflicting_options() {
        assert!(ClusterConfig::from_toml_str(
            r#"
            hosts = ["a:1", "b:1"]
            direct_connection = true
            "#
        )
        .is_err());

        assert!(ClusterConfig::from_toml_str(
            r#"
            hosts = ["lb:1"]
            load_balanced = true
            replica_set = "rs0"
            "#
        )
        .is_err());

        assert!(ClusterConfig::from_toml_str(
            r#"
            [pool]
            max_pool_size = 2
            min_pool_size = 3
            "#
        )
        .is_err());

        assert!(ClusterConfig::from_toml_str("hosts = []").is_err());
    }

    #[test]
    fn test_package_name_matches_crate_path() {
        assert_eq!(env!("CARGO_PKG_NAME"), "common");
        assert_eq!(env!("CARGO_CRATE_NAME"), "common");
    }
}
