//! Per-shard write channel

use super::chunk::{Chunk, CompressedChunk};
use super::sender::{Sender, SenderFactory};
use super::ChannelConfig;
use crate::{LiveNodes, Metric, Result, ShardId, ShardState, StrataError};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    written_bytes: AtomicU64,
    rejected: AtomicU64,
    flushed_chunks: AtomicU64,
    flushed_bytes: AtomicU64,
    sent_bytes: AtomicU64,
    dropped_bytes: AtomicU64,
    send_failures: AtomicU64,
    marshal_failures: AtomicU64,
}

/// Channel counters
///
/// Once the flush loop has exited, `written_bytes` equals
/// `flushed_bytes + dropped_bytes`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelStats {
    pub database: String,
    pub shard_id: ShardId,
    /// Writes waiting in the queue
    pub pending: usize,
    /// Writes accepted into the queue
    pub written: u64,
    /// Serialized bytes accepted into the queue
    pub written_bytes: u64,
    /// Writes rejected because the queue was full
    pub rejected: u64,
    /// Chunks handed to the sender successfully
    pub flushed_chunks: u64,
    /// Serialized bytes of the chunks sent successfully
    pub flushed_bytes: u64,
    /// Marshaled bytes sent, after compression
    pub sent_bytes: u64,
    /// Serialized bytes lost to marshal or send failures
    pub dropped_bytes: u64,
    pub send_failures: u64,
    pub marshal_failures: u64,
}

/// Write channel of one (database, shard)
///
/// `write` serializes a metric and enqueues it without blocking. A background
/// flush loop batches queued writes into a chunk and hands full chunks, or
/// any non-empty chunk on each tick, to the sender. Cancelling the token
/// stops the loop after the queued writes have been flushed.
pub struct Channel {
    database: String,
    shard_id: ShardId,
    capacity: usize,
    tx: mpsc::Sender<Bytes>,
    sender: Arc<dyn Sender>,
    shard_state: RwLock<Option<ShardState>>,
    counters: Arc<Counters>,
    ctx: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Create a channel and start its flush loop on the current runtime
    pub fn new(
        ctx: CancellationToken,
        database: impl Into<String>,
        shard_id: ShardId,
        config: &ChannelConfig,
        factory: &dyn SenderFactory,
    ) -> Self {
        let database = database.into();
        let sender = factory.new_sender(&database, shard_id);
        let chunk = Box::new(CompressedChunk::new(
            config.chunk_max_items,
            config.chunk_max_bytes,
        ));
        Self::with_chunk(ctx, database, shard_id, config, sender, chunk)
    }

    /// Create a channel flushing through the given chunk and sender
    pub fn with_chunk(
        ctx: CancellationToken,
        database: impl Into<String>,
        shard_id: ShardId,
        config: &ChannelConfig,
        sender: Arc<dyn Sender>,
        chunk: Box<dyn Chunk>,
    ) -> Self {
        let database = database.into();
        let capacity = config.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let counters = Arc::new(Counters::default());

        let worker = FlushWorker {
            database: database.clone(),
            shard_id,
            rx,
            chunk,
            sender: sender.clone(),
            counters: counters.clone(),
            pending_bytes: 0,
        };
        let handle = tokio::spawn(worker.run(ctx.clone(), config.flush_interval()));
        info!(database = %database, shard = shard_id, "replica channel started");

        Self {
            database,
            shard_id,
            capacity,
            tx,
            sender,
            shard_state: RwLock::new(None),
            counters,
            ctx,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Serialize and enqueue one metric
    ///
    /// Fails with `ChannelFull` when the queue is saturated and with
    /// `ChannelClosed` once the channel is shutting down.
    pub fn write(&self, metric: &Metric) -> Result<()> {
        if self.ctx.is_cancelled() {
            return Err(self.closed_err());
        }
        let payload = Bytes::from(metric.marshal()?);
        let len = payload.len() as u64;

        match self.tx.try_send(payload) {
            Ok(()) => {
                self.counters.written.fetch_add(1, Ordering::Relaxed);
                self.counters.written_bytes.fetch_add(len, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Err(StrataError::ChannelFull {
                    database: self.database.clone(),
                    shard_id: self.shard_id,
                })
            }
            Err(TrySendError::Closed(_)) => Err(self.closed_err()),
        }
    }

    /// Forward the shard topology to the sender and remember it
    pub fn sync_shard_state(&self, state: ShardState, live_nodes: LiveNodes) {
        self.sender.sync_shard_state(state.clone(), live_nodes);
        *self.shard_state.write() = Some(state);
    }

    /// Last shard state received
    pub fn shard_state(&self) -> Option<ShardState> {
        self.shard_state.read().clone()
    }

    pub fn stats(&self) -> ChannelStats {
        let c = &self.counters;
        ChannelStats {
            database: self.database.clone(),
            shard_id: self.shard_id,
            pending: self.capacity.saturating_sub(self.tx.capacity()),
            written: c.written.load(Ordering::Relaxed),
            written_bytes: c.written_bytes.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            flushed_chunks: c.flushed_chunks.load(Ordering::Relaxed),
            flushed_bytes: c.flushed_bytes.load(Ordering::Relaxed),
            sent_bytes: c.sent_bytes.load(Ordering::Relaxed),
            dropped_bytes: c.dropped_bytes.load(Ordering::Relaxed),
            send_failures: c.send_failures.load(Ordering::Relaxed),
            marshal_failures: c.marshal_failures.load(Ordering::Relaxed),
        }
    }

    /// Cancel the flush loop and wait until it has drained the queue
    pub async fn close(&self) {
        self.ctx.cancel();
        self.join().await;
    }

    /// Wait for the flush loop to exit; later calls return immediately
    pub async fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(
                    database = %self.database,
                    shard = self.shard_id,
                    error = %e,
                    "replica channel flush loop failed"
                );
            }
        }
    }

    fn closed_err(&self) -> StrataError {
        StrataError::ChannelClosed {
            database: self.database.clone(),
            shard_id: self.shard_id,
        }
    }
}

/// Single consumer of a channel queue; owns the chunk
struct FlushWorker {
    database: String,
    shard_id: ShardId,
    rx: mpsc::Receiver<Bytes>,
    chunk: Box<dyn Chunk>,
    sender: Arc<dyn Sender>,
    counters: Arc<Counters>,
    // serialized bytes appended to the chunk since the last flush
    pending_bytes: u64,
}

impl FlushWorker {
    async fn run(mut self, ctx: CancellationToken, flush_interval: Duration) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + flush_interval,
            flush_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    self.write_pending_before_close().await;
                    break;
                }
                item = self.rx.recv() => match item {
                    Some(payload) => self.write(&payload).await,
                    None => {
                        // channel dropped without cancellation
                        self.flush_chunk().await;
                        break;
                    }
                },
                _ = ticker.tick() => self.check_flush().await,
            }
        }
        info!(database = %self.database, shard = self.shard_id, "replica channel stopped");
    }

    async fn write(&mut self, payload: &[u8]) {
        self.chunk.append(payload);
        self.pending_bytes += payload.len() as u64;
        if self.chunk.is_full() {
            self.flush_chunk().await;
        }
    }

    async fn check_flush(&mut self) {
        if !self.chunk.is_empty() {
            self.flush_chunk().await;
        }
    }

    /// Marshal the chunk and send it; failures drop the chunk
    async fn flush_chunk(&mut self) {
        let payload_bytes = std::mem::take(&mut self.pending_bytes);
        let block = match self.chunk.marshal_binary() {
            Ok(block) => block,
            Err(e) => {
                error!(
                    database = %self.database,
                    shard = self.shard_id,
                    error = %e,
                    "marshal chunk failed, dropping it"
                );
                self.counters.marshal_failures.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .dropped_bytes
                    .fetch_add(payload_bytes, Ordering::Relaxed);
                return;
            }
        };
        if block.is_empty() {
            return;
        }

        let size = block.len() as u64;
        match self.sender.send(block).await {
            Ok(()) => {
                debug!(
                    database = %self.database,
                    shard = self.shard_id,
                    bytes = size,
                    "chunk sent"
                );
                self.counters.flushed_chunks.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .flushed_bytes
                    .fetch_add(payload_bytes, Ordering::Relaxed);
                self.counters.sent_bytes.fetch_add(size, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(
                    database = %self.database,
                    shard = self.shard_id,
                    bytes = size,
                    error = %e,
                    "send chunk failed, dropping it"
                );
                self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .dropped_bytes
                    .fetch_add(payload_bytes, Ordering::Relaxed);
            }
        }
    }

    /// Stop accepting writes, flush everything still queued
    async fn write_pending_before_close(&mut self) {
        self.rx.close();
        let mut drained = 0usize;
        while let Ok(payload) = self.rx.try_recv() {
            self.write(&payload).await;
            drained += 1;
        }
        self.flush_chunk().await;
        debug!(
            database = %self.database,
            shard = self.shard_id,
            drained,
            "pending writes flushed before close"
        );
    }
}
