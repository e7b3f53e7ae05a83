//! Storage side of the replication stream

use super::chunk::decode_chunk;
use super::stream::{read_frame, StreamHeader};
use crate::{Metric, Result, ShardId};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consumer of replicated metrics
pub trait ReplicaSink: Send + Sync {
    fn write_metrics(&self, database: &str, shard_id: ShardId, metrics: Vec<Metric>) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReceiverStats {
    pub streams: u64,
    /// Streams currently open
    pub active_streams: u64,
    pub chunks: u64,
    pub metrics: u64,
    pub bad_chunks: u64,
    pub bad_metrics: u64,
}

#[derive(Debug, Default)]
struct Counters {
    streams: AtomicU64,
    active_streams: AtomicU64,
    chunks: AtomicU64,
    metrics: AtomicU64,
    bad_chunks: AtomicU64,
    bad_metrics: AtomicU64,
}

/// Accepts replication streams and feeds their chunks to a [`ReplicaSink`]
pub struct ReplicaReceiver {
    sink: Arc<dyn ReplicaSink>,
    counters: Counters,
}

impl ReplicaReceiver {
    pub fn new(sink: Arc<dyn ReplicaSink>) -> Self {
        Self {
            sink,
            counters: Counters::default(),
        }
    }

    /// Accept streams until `ctx` is cancelled
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        ctx: CancellationToken,
    ) -> Result<()> {
        info!(address = ?listener.local_addr().ok(), "replica receiver listening");
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "accept replication stream failed");
                            continue;
                        }
                    };
                    let receiver = self.clone();
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = receiver.handle_stream(stream, peer, ctx).await {
                            warn!(peer = %peer, error = %e, "replication stream closed with error");
                        }
                    });
                }
            }
        }
        info!("replica receiver stopped");
        Ok(())
    }

    /// Read a header then chunks until end of stream or cancellation
    pub async fn handle_stream<R>(
        &self,
        mut stream: R,
        peer: SocketAddr,
        ctx: CancellationToken,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let header = match read_frame(&mut stream).await? {
            Some(frame) => StreamHeader::decode(&frame)?,
            None => return Ok(()),
        };
        self.counters.streams.fetch_add(1, Ordering::Relaxed);
        self.counters.active_streams.fetch_add(1, Ordering::Relaxed);
        info!(
            peer = %peer,
            database = %header.database,
            shard = header.shard_id,
            "replication stream accepted"
        );
        let result = self.read_chunks(&mut stream, &header, ctx).await;
        self.counters.active_streams.fetch_sub(1, Ordering::Relaxed);
        debug!(
            peer = %peer,
            database = %header.database,
            shard = header.shard_id,
            "replication stream ended"
        );
        result
    }

    async fn read_chunks<R>(
        &self,
        stream: &mut R,
        header: &StreamHeader,
        ctx: CancellationToken,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame = tokio::select! {
                _ = ctx.cancelled() => break,
                frame = read_frame(&mut *stream) => frame?,
            };
            match frame {
                Some(chunk) => self.receive_chunk(header, &chunk),
                None => break,
            }
        }
        Ok(())
    }

    /// Wait until every open stream has ended, at most `timeout`
    ///
    /// Returns whether the receiver is idle.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let idle = async {
            while self.counters.active_streams.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }

    fn receive_chunk(&self, header: &StreamHeader, chunk: &[u8]) {
        let items = match decode_chunk(chunk) {
            Ok(items) => items,
            Err(e) => {
                warn!(
                    database = %header.database,
                    shard = header.shard_id,
                    error = %e,
                    "dropping undecodable chunk"
                );
                self.counters.bad_chunks.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        self.counters.chunks.fetch_add(1, Ordering::Relaxed);

        let mut metrics = Vec::with_capacity(items.len());
        for item in &items {
            match Metric::unmarshal(item) {
                Ok(metric) => metrics.push(metric),
                Err(e) => {
                    warn!(database = %header.database, error = %e, "dropping undecodable metric");
                    self.counters.bad_metrics.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        let count = metrics.len() as u64;
        if let Err(e) = self
            .sink
            .write_metrics(&header.database, header.shard_id, metrics)
        {
            error!(
                database = %header.database,
                shard = header.shard_id,
                error = %e,
                "write replicated metrics failed"
            );
            return;
        }
        self.counters.metrics.fetch_add(count, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ReceiverStats {
        let c = &self.counters;
        ReceiverStats {
            streams: c.streams.load(Ordering::Relaxed),
            active_streams: c.active_streams.load(Ordering::Relaxed),
            chunks: c.chunks.load(Ordering::Relaxed),
            metrics: c.metrics.load(Ordering::Relaxed),
            bad_chunks: c.bad_chunks.load(Ordering::Relaxed),
            bad_metrics: c.bad_metrics.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::{write_frame, Chunk, CompressedChunk};
    use crate::{SimpleFieldType, StrataError};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<(String, ShardId, Metric)>>);

    impl ReplicaSink for CollectingSink {
        fn write_metrics(
            &self,
            database: &str,
            shard_id: ShardId,
            metrics: Vec<Metric>,
        ) -> Result<()> {
            let mut received = self.0.lock();
            for metric in metrics {
                received.push((database.to_string(), shard_id, metric));
            }
            Ok(())
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    fn chunk_of(metrics: &[Metric]) -> bytes::Bytes {
        let mut chunk = CompressedChunk::new(100, 1024 * 1024);
        for m in metrics {
            chunk.append(&m.marshal().unwrap());
        }
        chunk.marshal_binary().unwrap()
    }

    #[tokio::test]
    async fn test_handle_stream() {
        let sink = Arc::new(CollectingSink::default());
        let receiver = ReplicaReceiver::new(sink.clone());
        let metric = Metric::new("cpu", 1).with_field("f", SimpleFieldType::DeltaSum, 1.0);

        let (mut client, server) = tokio::io::duplex(64 * 1024);
        write_frame(&mut client, &StreamHeader::new("db", 3).encode().unwrap())
            .await
            .unwrap();
        write_frame(&mut client, &chunk_of(&[metric.clone(), metric.clone()]))
            .await
            .unwrap();
        write_frame(&mut client, &[1, 2, 3]).await.unwrap();
        write_frame(&mut client, &chunk_of(&[metric.clone()])).await.unwrap();
        drop(client);

        receiver
            .handle_stream(server, peer(), CancellationToken::new())
            .await
            .unwrap();

        let received = sink.0.lock();
        assert_eq!(received.len(), 3);
        assert!(received.iter().all(|(db, shard, m)| db == "db" && *shard == 3 && *m == metric));
        let stats = receiver.stats();
        assert_eq!(stats.streams, 1);
        assert_eq!(stats.active_streams, 0);
        assert!(receiver.drain(std::time::Duration::from_millis(10)).await);
        assert_eq!(stats.chunks, 2);
        assert_eq!(stats.bad_chunks, 1);
        assert_eq!(stats.metrics, 3);
    }

    #[tokio::test]
    async fn test_handle_stream_bad_header() {
        let receiver = ReplicaReceiver::new(Arc::new(CollectingSink::default()));
        let (mut client, server) = tokio::io::duplex(1024);
        write_frame(&mut client, &[0xFF]).await.unwrap();
        drop(client);
        assert!(matches!(
            receiver.handle_stream(server, peer(), CancellationToken::new()).await,
            Err(StrataError::Encoding(_))
        ));
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancel() {
        let receiver = Arc::new(ReplicaReceiver::new(Arc::new(CollectingSink::default())));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ctx = CancellationToken::new();
        let task = tokio::spawn(receiver.serve(listener, ctx.clone()));
        ctx.cancel();
        task.await.unwrap().unwrap();
    }
}
