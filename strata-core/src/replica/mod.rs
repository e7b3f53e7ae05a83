//! Shard replication: per-shard write channels on the broker side and the
//! chunk receiver on the storage side
//!
//! ```text
//! write ──► Channel (bounded queue) ──► flush loop ──► Chunk ──► Sender
//!                                                               │ TCP frames
//! ReplicaSink ◄── decode_chunk ◄── ReplicaReceiver ◄────────────┘
//! ```

mod channel;
mod chunk;
mod manager;
mod receiver;
mod sender;
mod stream;

#[cfg(test)]
pub(crate) mod mock;

pub use channel::{Channel, ChannelStats};
pub use chunk::{decode_chunk, Chunk, CompressedChunk};
pub use manager::ChannelManager;
pub use receiver::{ReceiverStats, ReplicaReceiver, ReplicaSink};
pub use sender::{Sender, SenderFactory, StreamSender, StreamSenderFactory};
pub use stream::{read_frame, write_frame, StreamHeader};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shard channel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Pending writes held before `write` reports backpressure
    pub queue_capacity: usize,
    /// Period of the time-based chunk flush
    pub flush_interval_ms: u64,
    /// Writes per chunk before it is flushed
    pub chunk_max_items: usize,
    /// Bytes per chunk before it is flushed
    pub chunk_max_bytes: usize,
}

impl ChannelConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            queue_capacity: crate::config::CHANNEL_QUEUE_CAPACITY,
            flush_interval_ms: crate::config::CHANNEL_FLUSH_INTERVAL_MS,
            chunk_max_items: crate::config::CHUNK_MAX_ITEMS,
            chunk_max_bytes: crate::config::CHUNK_MAX_BYTES,
        }
    }
}
