//! Server configuration

use anyhow::{bail, Context};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strata_core::replica::ChannelConfig;
use strata_core::storage::StorageConfig;
use strata_core::{LiveNodes, NodeId, StatefulNode};

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "STRATA_CONFIG";

/// A database served by this node
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    #[serde(default = "default_shards")]
    pub num_of_shards: u32,
}

fn default_shards() -> u32 {
    1
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Listen address of the replication receiver
    pub replica_addr: SocketAddr,
    /// Id of this node, leader of every local shard
    pub node_id: NodeId,
    /// Replication target; the local receiver when unset
    pub leader_addr: Option<String>,
    /// Data directory
    pub data_dir: PathBuf,
    /// Slot width in milliseconds
    pub interval_ms: i64,
    /// Period of the storage flush
    pub flush_interval_ms: u64,
    /// Shard channel settings
    pub channel: ChannelConfig,
    pub databases: Vec<DatabaseConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8086)),
            replica_addr: SocketAddr::from(([127, 0, 0, 1], 2891)),
            node_id: 1,
            leader_addr: None,
            data_dir: PathBuf::from("data"),
            interval_ms: strata_core::config::SLOT_INTERVAL_MS,
            flush_interval_ms: strata_core::config::STORAGE_FLUSH_INTERVAL_MS,
            channel: ChannelConfig::default(),
            databases: vec![DatabaseConfig {
                name: "default".to_string(),
                num_of_shards: 1,
            }],
        }
    }
}

impl ServerConfig {
    /// Load from the file given as first argument or in `STRATA_CONFIG`,
    /// defaults otherwise
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::args()
            .nth(1)
            .or_else(|| std::env::var(CONFIG_ENV).ok());
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&data)
            .with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval_ms <= 0 {
            bail!("interval_ms must be positive");
        }
        if self.flush_interval_ms == 0 {
            bail!("flush_interval_ms must be positive");
        }
        if self.channel.queue_capacity == 0 {
            bail!("channel.queue_capacity must be positive");
        }
        for db in &self.databases {
            if db.name.is_empty() {
                bail!("database name must not be empty");
            }
            if db.num_of_shards == 0 {
                bail!("database {} needs at least one shard", db.name);
            }
        }
        Ok(())
    }

    /// Address the broker streams chunks to
    pub fn replication_target(&self) -> String {
        self.leader_addr
            .clone()
            .unwrap_or_else(|| self.replica_addr.to_string())
    }

    /// Live nodes as seen by this node: itself, at its replication target
    pub fn live_nodes(&self) -> LiveNodes {
        let mut nodes = LiveNodes::new();
        nodes.insert(
            self.node_id,
            StatefulNode {
                id: self.node_id,
                address: self.replication_target(),
            },
        );
        nodes
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            data_dir: self.data_dir.clone(),
            interval_ms: self.interval_ms,
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.replication_target(), "127.0.0.1:2891");
        assert_eq!(config.live_nodes()[&1].address, "127.0.0.1:2891");
    }

    #[test]
    fn test_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("strata.json");
        std::fs::write(
            &path,
            r#"{
                "http_addr": "127.0.0.1:9000",
                "leader_addr": "10.0.0.2:2891",
                "channel": {"queue_capacity": 16},
                "databases": [{"name": "metrics", "num_of_shards": 4}, {"name": "logs"}]
            }"#,
        )
        .unwrap();

        let config = ServerConfig::from_file(&path).unwrap();
        assert_eq!(config.http_addr, SocketAddr::from(([127, 0, 0, 1], 9000)));
        assert_eq!(config.replication_target(), "10.0.0.2:2891");
        assert_eq!(config.channel.queue_capacity, 16);
        assert_eq!(config.channel.chunk_max_items, strata_core::config::CHUNK_MAX_ITEMS);
        assert_eq!(config.databases[0].num_of_shards, 4);
        assert_eq!(config.databases[1].num_of_shards, 1);
    }

    #[test]
    fn test_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.json");
        std::fs::write(&path, r#"{"databases": [{"name": "db", "num_of_shards": 0}]}"#).unwrap();
        assert!(ServerConfig::from_file(&path).is_err());

        std::fs::write(&path, "not json").unwrap();
        assert!(ServerConfig::from_file(&path).is_err());
        assert!(ServerConfig::from_file(temp_dir.path().join("missing.json")).is_err());
    }
}
