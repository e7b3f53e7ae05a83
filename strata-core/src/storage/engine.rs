//! Storage engine - top-level coordinator of the storage node

use super::{Shard, ShardStats, StorageConfig};
use crate::replica::ReplicaSink;
use crate::{Metric, Result, ShardId, StrataError};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Strata storage engine
pub struct StorageEngine {
    config: StorageConfig,
    shards: RwLock<HashMap<(String, ShardId), Arc<Shard>>>,
}

impl StorageEngine {
    /// Create a new storage engine
    pub fn new(config: StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let engine = Self {
            config,
            shards: RwLock::new(HashMap::new()),
        };

        // Load existing shards
        engine.load_shards()?;

        Ok(engine)
    }

    /// Get or create the shard of a database
    pub fn get_or_create_shard(&self, database: &str, shard_id: ShardId) -> Result<Arc<Shard>> {
        let key = (database.to_string(), shard_id);
        if let Some(shard) = self.shards.read().get(&key) {
            return Ok(shard.clone());
        }

        let mut shards = self.shards.write();
        if let Some(shard) = shards.get(&key) {
            return Ok(shard.clone());
        }
        let shard = Arc::new(self.open_shard(database, shard_id)?);
        shards.insert(key, shard.clone());
        info!(database, shard = shard_id, "Created shard");
        Ok(shard)
    }

    /// Get a shard
    pub fn shard(&self, database: &str, shard_id: ShardId) -> Result<Arc<Shard>> {
        self.shards
            .read()
            .get(&(database.to_string(), shard_id))
            .cloned()
            .ok_or_else(|| StrataError::ShardNotFound {
                database: database.to_string(),
                shard_id,
            })
    }

    /// Write metrics into a shard; returns the number accepted
    pub fn write(&self, database: &str, shard_id: ShardId, metrics: &[Metric]) -> Result<usize> {
        let shard = self.get_or_create_shard(database, shard_id)?;
        Ok(shard.write(metrics))
    }

    /// Flush all shards; returns the number of files written
    pub fn flush_all(&self) -> Result<usize> {
        let shards: Vec<_> = self.shards.read().values().cloned().collect();
        let mut files = 0;
        for shard in shards {
            files += shard.flush()?.len();
        }
        Ok(files)
    }

    /// Get engine statistics
    pub fn stats(&self) -> EngineStats {
        let mut shards: Vec<_> = self.shards.read().values().map(|s| s.stats()).collect();
        shards.sort_by(|a, b| (&a.database, a.shard_id).cmp(&(&b.database, b.shard_id)));

        EngineStats {
            shard_count: shards.len(),
            total_files: shards.iter().map(|s| s.files).sum(),
            buffered_values: shards.iter().map(|s| s.buffered_values).sum(),
            shards,
        }
    }

    fn open_shard(&self, database: &str, shard_id: ShardId) -> Result<Shard> {
        Shard::open(
            database,
            shard_id,
            self.config
                .data_dir
                .join(database)
                .join(shard_id.to_string()),
            self.config.interval_ms,
        )
    }

    fn load_shards(&self) -> Result<()> {
        for entry in std::fs::read_dir(&self.config.data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let database = entry.file_name().to_string_lossy().to_string();

            // Skip hidden directories
            if database.starts_with('.') {
                continue;
            }

            for shard_entry in std::fs::read_dir(entry.path())? {
                let shard_entry = shard_entry?;
                if !shard_entry.file_type()?.is_dir() {
                    continue;
                }
                let shard_id = match shard_entry.file_name().to_string_lossy().parse::<ShardId>() {
                    Ok(id) => id,
                    Err(_) => continue,
                };

                match self.open_shard(&database, shard_id) {
                    Ok(shard) => {
                        self.shards
                            .write()
                            .insert((database.clone(), shard_id), Arc::new(shard));
                        info!(database = %database, shard = shard_id, "Loaded shard");
                    }
                    Err(e) => {
                        warn!("Failed to load shard {}/{}: {}", database, shard_id, e);
                    }
                }
            }
        }

        Ok(())
    }
}

impl ReplicaSink for StorageEngine {
    fn write_metrics(&self, database: &str, shard_id: ShardId, metrics: Vec<Metric>) -> Result<()> {
        self.write(database, shard_id, &metrics).map(|_| ())
    }
}

/// Storage engine statistics
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub shard_count: usize,
    pub total_files: usize,
    pub buffered_values: usize,
    pub shards: Vec<ShardStats>,
}
