//! Broker side entry of the write path

use super::channel::{Channel, ChannelStats};
use super::sender::SenderFactory;
use super::ChannelConfig;
use crate::{LiveNodes, MetricList, Result, ShardId, ShardState, StrataError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Owns one [`Channel`] per (database, shard) and routes writes to them
pub struct ChannelManager {
    ctx: CancellationToken,
    config: ChannelConfig,
    factory: Arc<dyn SenderFactory>,
    // database name -> number of shards
    databases: RwLock<HashMap<String, u32>>,
    channels: RwLock<HashMap<(String, ShardId), Arc<Channel>>>,
}

impl ChannelManager {
    /// Create a manager; channels stop when `parent` is cancelled
    pub fn new(
        parent: &CancellationToken,
        config: ChannelConfig,
        factory: Arc<dyn SenderFactory>,
    ) -> Self {
        Self {
            ctx: parent.child_token(),
            config,
            factory,
            databases: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Declare a database and its shard count
    pub fn register_database(&self, name: &str, num_of_shards: u32) -> Result<()> {
        if num_of_shards == 0 {
            return Err(StrataError::Config(format!(
                "database {} needs at least one shard",
                name
            )));
        }
        self.databases
            .write()
            .insert(name.to_string(), num_of_shards);
        info!(database = name, shards = num_of_shards, "database registered");
        Ok(())
    }

    /// Registered databases with their shard count
    pub fn databases(&self) -> Vec<(String, u32)> {
        let mut databases: Vec<_> = self
            .databases
            .read()
            .iter()
            .map(|(name, shards)| (name.clone(), *shards))
            .collect();
        databases.sort();
        databases
    }

    /// Get or create the channel of a shard
    pub fn create_channel(
        &self,
        database: &str,
        num_of_shards: u32,
        shard_id: ShardId,
    ) -> Result<Arc<Channel>> {
        if shard_id >= num_of_shards {
            return Err(StrataError::ShardNotFound {
                database: database.to_string(),
                shard_id,
            });
        }
        if self.ctx.is_cancelled() {
            return Err(StrataError::ChannelClosed {
                database: database.to_string(),
                shard_id,
            });
        }

        let key = (database.to_string(), shard_id);
        if let Some(channel) = self.channels.read().get(&key) {
            return Ok(channel.clone());
        }

        let mut channels = self.channels.write();
        // another writer may have created it meanwhile
        if let Some(channel) = channels.get(&key) {
            return Ok(channel.clone());
        }
        let channel = Arc::new(Channel::new(
            self.ctx.child_token(),
            database,
            shard_id,
            &self.config,
            self.factory.as_ref(),
        ));
        channels.insert(key, channel.clone());
        Ok(channel)
    }

    /// Existing channel of a shard
    pub fn channel(&self, database: &str, shard_id: ShardId) -> Option<Arc<Channel>> {
        self.channels
            .read()
            .get(&(database.to_string(), shard_id))
            .cloned()
    }

    /// Route every metric to the channel of its shard
    ///
    /// The batch is validated before anything is enqueued. Enqueueing stops at
    /// the first rejected metric; metrics before it stay buffered.
    pub fn write(&self, database: &str, metrics: &MetricList) -> Result<()> {
        let num_of_shards = self.num_of_shards(database)?;
        for metric in &metrics.metrics {
            metric.validate()?;
        }
        for metric in &metrics.metrics {
            let shard_id = metric.series_hash() % num_of_shards;
            self.create_channel(database, num_of_shards, shard_id)?
                .write(metric)?;
        }
        Ok(())
    }

    /// Propagate the topology of one shard to its channel
    pub fn sync_shard_state(
        &self,
        database: &str,
        state: ShardState,
        live_nodes: LiveNodes,
    ) -> Result<()> {
        let num_of_shards = self.num_of_shards(database)?;
        self.create_channel(database, num_of_shards, state.id)?
            .sync_shard_state(state, live_nodes);
        Ok(())
    }

    /// Counters of every channel, ordered by database and shard
    pub fn stats(&self) -> Vec<ChannelStats> {
        let mut stats: Vec<_> = self.channels.read().values().map(|c| c.stats()).collect();
        stats.sort_by(|a, b| (&a.database, a.shard_id).cmp(&(&b.database, b.shard_id)));
        stats
    }

    /// Stop every channel and wait until their queues are flushed
    pub async fn shutdown(&self) {
        self.ctx.cancel();
        let channels: Vec<_> = self.channels.read().values().cloned().collect();
        for channel in &channels {
            channel.join().await;
        }
        info!(channels = channels.len(), "replica channels stopped");
    }

    fn num_of_shards(&self, database: &str) -> Result<u32> {
        self.databases
            .read()
            .get(database)
            .copied()
            .ok_or_else(|| StrataError::DatabaseNotFound(database.to_string()))
    }
}
