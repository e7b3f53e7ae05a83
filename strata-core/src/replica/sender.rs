//! Senders shipping marshaled chunks to the shard leader

use super::stream::{write_frame, StreamHeader};
use crate::{LiveNodes, Result, ShardId, ShardState, StrataError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Remote end of a shard channel
#[async_trait]
pub trait Sender: Send + Sync {
    /// Ship one marshaled chunk; an error loses that chunk only
    async fn send(&self, chunk: Bytes) -> Result<()>;

    /// Topology notification, best effort
    fn sync_shard_state(&self, state: ShardState, live_nodes: LiveNodes);
}

/// Builds the sender of a newly created channel
pub trait SenderFactory: Send + Sync {
    fn new_sender(&self, database: &str, shard_id: ShardId) -> Arc<dyn Sender>;
}

impl<F> SenderFactory for F
where
    F: Fn(&str, ShardId) -> Arc<dyn Sender> + Send + Sync,
{
    fn new_sender(&self, database: &str, shard_id: ShardId) -> Arc<dyn Sender> {
        self(database, shard_id)
    }
}

/// Factory of [`StreamSender`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamSenderFactory;

impl SenderFactory for StreamSenderFactory {
    fn new_sender(&self, database: &str, shard_id: ShardId) -> Arc<dyn Sender> {
        Arc::new(StreamSender::new(database, shard_id))
    }
}

#[derive(Debug, Default)]
struct Target {
    address: Option<String>,
    // bumped on every leader change
    generation: u64,
}

struct Connection {
    generation: u64,
    stream: TcpStream,
}

/// Sender streaming chunks over TCP to the current shard leader
///
/// The connection is opened on the first chunk after a leader is known and
/// starts with a [`StreamHeader`] frame. A failed write drops the
/// connection; the next chunk reconnects.
pub struct StreamSender {
    header: StreamHeader,
    target: Mutex<Target>,
    conn: tokio::sync::Mutex<Option<Connection>>,
}

impl StreamSender {
    pub fn new(database: impl Into<String>, shard_id: ShardId) -> Self {
        Self {
            header: StreamHeader::new(database, shard_id),
            target: Mutex::new(Target::default()),
            conn: tokio::sync::Mutex::new(None),
        }
    }

    /// Address of the leader chunks are streamed to
    pub fn leader_address(&self) -> Option<String> {
        self.target.lock().address.clone()
    }

    async fn connect(&self, address: &str, generation: u64) -> Result<Connection> {
        let mut stream = TcpStream::connect(address)
            .await
            .map_err(|e| StrataError::Transport(format!("connect {}: {}", address, e)))?;
        stream.set_nodelay(true)?;
        write_frame(&mut stream, &self.header.encode()?).await?;
        info!(
            database = %self.header.database,
            shard = self.header.shard_id,
            address,
            "replication stream opened"
        );
        Ok(Connection { generation, stream })
    }
}

#[async_trait]
impl Sender for StreamSender {
    async fn send(&self, chunk: Bytes) -> Result<()> {
        let (address, generation) = {
            let target = self.target.lock();
            (target.address.clone(), target.generation)
        };
        let address = address.ok_or_else(|| {
            StrataError::Transport(format!(
                "no leader for database {} shard {}",
                self.header.database, self.header.shard_id
            ))
        })?;

        let mut guard = self.conn.lock().await;
        let mut conn = match guard.take() {
            Some(conn) if conn.generation == generation => conn,
            _ => self.connect(&address, generation).await?,
        };

        match write_frame(&mut conn.stream, &chunk).await {
            Ok(()) => {
                *guard = Some(conn);
                Ok(())
            }
            Err(e) => {
                warn!(
                    database = %self.header.database,
                    shard = self.header.shard_id,
                    address,
                    error = %e,
                    "replication stream broken"
                );
                Err(StrataError::Transport(format!("send to {}: {}", address, e)))
            }
        }
    }

    fn sync_shard_state(&self, state: ShardState, live_nodes: LiveNodes) {
        let address = state
            .leader
            .and_then(|leader| live_nodes.get(&leader))
            .map(|node| node.address.clone());

        let mut target = self.target.lock();
        if target.address != address {
            debug!(
                database = %self.header.database,
                shard = self.header.shard_id,
                leader = ?state.leader,
                address = ?address,
                "shard leader changed"
            );
            target.address = address;
            target.generation += 1;
        }
    }
}
