//! Strata Core - write path of a distributed time-series database
//!
//! # Architecture
//!
//! Data written to a broker travels through the following components:
//!
//! - **Replica channels**: one bounded queue and flush loop per (database, shard),
//!   batching serialized metrics into chunks shipped to the shard leader
//! - **Replica receiver**: decodes chunks on the storage node
//! - **Memory database**: assigns metric/field/series ids and buffers values per slot
//! - **Metric blocks**: columnar, bitmap-indexed per-metric blocks written
//!   through a store writer and read back for a subset of series

pub mod field;
pub mod kv;
pub mod memdb;
pub mod metricsdata;
pub mod replica;
pub mod storage;
pub mod timeutil;

mod error;
mod types;

pub use error::{Result, StrataError};
pub use types::*;

/// Strata version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Capacity of the pending write queue of one shard channel
    pub const CHANNEL_QUEUE_CAPACITY: usize = 1024;

    /// Interval of the time-based chunk flush (1s)
    pub const CHANNEL_FLUSH_INTERVAL_MS: u64 = 1000;

    /// Maximum serialized writes held by one chunk
    pub const CHUNK_MAX_ITEMS: usize = 1000;

    /// Maximum bytes held by one chunk before it is flushed (1MB)
    pub const CHUNK_MAX_BYTES: usize = 1024 * 1024;

    /// Largest frame accepted on a replication stream (64MB)
    pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

    /// Width of one storage slot (10s)
    pub const SLOT_INTERVAL_MS: i64 = 10 * 1000;

    /// Period of the storage flush (30s)
    pub const STORAGE_FLUSH_INTERVAL_MS: u64 = 30 * 1000;
}
