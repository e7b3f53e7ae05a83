//! Error types for Strata

use crate::ShardId;
use thiserror::Error;

/// Result type alias for Strata operations
pub type Result<T> = std::result::Result<T, StrataError>;

/// Strata error types
#[derive(Error, Debug)]
pub enum StrataError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Serialization of an in-memory value failed
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Pending write queue of a shard channel is full
    #[error("Channel full: database {database}, shard {shard_id}")]
    ChannelFull { database: String, shard_id: ShardId },

    /// Shard channel stopped accepting writes
    #[error("Channel closed: database {database}, shard {shard_id}")]
    ChannelClosed { database: String, shard_id: ShardId },

    /// Replication stream failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Database not found
    #[error("Database not found: {0}")]
    DatabaseNotFound(String),

    /// Shard not found
    #[error("Shard not found: database {database}, shard {shard_id}")]
    ShardNotFound { database: String, shard_id: ShardId },

    /// Metric rejected before buffering
    #[error("Invalid metric: {0}")]
    InvalidMetric(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StrataError::Io(_) | StrataError::Transport(_) | StrataError::ChannelFull { .. }
        )
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StrataError::Corruption(_) | StrataError::ChecksumMismatch { .. }
        )
    }

    /// Check if error is an overload signal for the writer
    pub fn is_backpressure(&self) -> bool {
        matches!(self, StrataError::ChannelFull { .. })
    }
}

impl From<bincode::Error> for StrataError {
    fn from(err: bincode::Error) -> Self {
        StrataError::Encoding(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let full = StrataError::ChannelFull {
            database: "db".into(),
            shard_id: 1,
        };
        assert!(full.is_backpressure());
        assert!(full.is_retryable());
        assert_eq!(full.to_string(), "Channel full: database db, shard 1");

        let crc = StrataError::ChecksumMismatch {
            expected: 1,
            actual: 2,
        };
        assert!(crc.is_corruption());
        assert!(!crc.is_retryable());
    }
}
