//! Storage engine - replicated shards on the storage node

mod engine;
mod shard;

pub use engine::{EngineStats, StorageEngine};
pub use shard::{Shard, ShardStats};

use std::path::PathBuf;

/// Storage engine configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Data directory, one sub directory per database and shard
    pub data_dir: PathBuf,
    /// Slot width in milliseconds
    pub interval_ms: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            interval_ms: crate::config::SLOT_INTERVAL_MS,
        }
    }
}
