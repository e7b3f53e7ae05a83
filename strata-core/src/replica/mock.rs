//! Test senders

use super::{decode_chunk, Sender};
use crate::{LiveNodes, Result, ShardState, StrataError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Records every chunk and shard state it receives; can be told to fail
#[derive(Default)]
pub(crate) struct RecordingSender {
    chunks: Mutex<Vec<Bytes>>,
    states: Mutex<Vec<ShardState>>,
    failing: AtomicBool,
}

impl RecordingSender {
    pub(crate) fn failing() -> Self {
        let sender = Self::default();
        sender.set_failing(true);
        sender
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn chunks(&self) -> Vec<Bytes> {
        self.chunks.lock().clone()
    }

    pub(crate) fn states(&self) -> Vec<ShardState> {
        self.states.lock().clone()
    }

    /// Every payload of every recorded chunk, in send order
    pub(crate) fn payloads(&self) -> Vec<Bytes> {
        self.chunks
            .lock()
            .iter()
            .flat_map(|chunk| decode_chunk(chunk).unwrap())
            .collect()
    }
}

#[async_trait]
impl Sender for RecordingSender {
    async fn send(&self, chunk: Bytes) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StrataError::Transport("injected failure".into()));
        }
        self.chunks.lock().push(chunk);
        Ok(())
    }

    fn sync_shard_state(&self, state: ShardState, _live_nodes: LiveNodes) {
        self.states.lock().push(state);
    }
}
