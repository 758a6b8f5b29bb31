use anyhow::{Context, Result};
use common::ClusterConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    #[serde(default)]
    pub simulation: SimulationConfig,
    pub cluster: ClusterConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        let simulation = SimulationConfig::default();
        let cluster = ClusterConfig {
            hosts: simulation.members.iter().take(1).cloned().collect(),
            replica_set: Some(simulation.set_name.clone()),
            heartbeat_frequency_ms: 200,
            min_heartbeat_frequency_ms: 20,
            server_selection_timeout_ms: 2_000,
            ..ClusterConfig::default()
        };
        Self { simulation, cluster }
    }
}

/// Shape of the scripted in-memory replica set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub set_name: String,
    /// First member starts as primary
    pub members: Vec<String>,
    pub phase_timeout_ms: u64,
    /// Concurrent callers in the pool exhaustion phase
    pub clients: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            set_name: "rs0".to_string(),
            members: vec![
                "node-a:27017".to_string(),
                "node-b:27017".to_string(),
                "node-c:27017".to_string(),
            ],
            phase_timeout_ms: 5_000,
            clients: 8,
        }
    }
}

impl SimulationConfig {
    pub fn phase_timeout(&self) -> Duration {
        Duration::from_millis(self.phase_timeout_ms)
    }
}

impl SimulatorConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read simulator config: {:?}", path))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse simulator config: {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.simulation.members.is_empty() {
            anyhow::bail!("simulation needs at least one member");
        }
        self.cluster.validate().context("Invalid cluster settings")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let config: SimulatorConfig = toml::from_str(
            r#"
            [simulation]
            clients = 3

            [cluster]
            hosts = ["x:1"]
            "#,
        )
        .unwrap();
        assert_eq!(config.simulation.clients, 3);
        assert_eq!(config.simulation.set_name, "rs0");
        assert_eq!(config.cluster.hosts, vec!["x:1".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_members() {
        let mut config = SimulatorConfig::default();
        config.simulation.members.clear();
        assert!(config.validate().is_err());
    }
}
