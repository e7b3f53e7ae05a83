//! Persistent store contract used by the metric block flusher
//!
//! Blocks are added under a `u32` key (the metric id) and become visible once
//! the writer is closed. Two writers are provided:
//!
//! - [`MemoryStoreWriter`]: keeps every block in memory
//! - [`FileStoreWriter`]: writes an immutable table file readable by [`TableReader`]

mod table;

pub use table::{FileStoreWriter, TableReader};

use crate::{Result, StrataError};
use bytes::Bytes;

/// Table file format version
pub const FORMAT_VERSION: u32 = 1;

/// Writer side of the persistent store
pub trait StoreWriter: Send {
    /// Add one value under `key`
    fn add(&mut self, key: u32, value: &[u8]) -> Result<()>;

    /// Finish the output; calling it again is a no-op
    fn close(&mut self) -> Result<()>;
}

impl<W: StoreWriter + ?Sized> StoreWriter for Box<W> {
    fn add(&mut self, key: u32, value: &[u8]) -> Result<()> {
        (**self).add(key, value)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// In-memory store writer
#[derive(Debug, Default)]
pub struct MemoryStoreWriter {
    entries: Vec<(u32, Bytes)>,
    closed: bool,
}

impl MemoryStoreWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value added, empty if nothing was added
    pub fn bytes(&self) -> Bytes {
        self.entries
            .last()
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    }

    /// Value added under `key`
    pub fn get(&self, key: u32) -> Option<Bytes> {
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn entries(&self) -> &[(u32, Bytes)] {
        &self.entries
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl StoreWriter for MemoryStoreWriter {
    fn add(&mut self, key: u32, value: &[u8]) -> Result<()> {
        if self.closed {
            return Err(StrataError::Internal("store writer already closed".into()));
        }
        self.entries.push((key, Bytes::copy_from_slice(value)));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_writer() {
        let mut writer = MemoryStoreWriter::new();
        assert!(writer.bytes().is_empty());

        writer.add(1, &[1, 2]).unwrap();
        writer.add(7, &[3]).unwrap();
        assert_eq!(writer.bytes().as_ref(), &[3]);
        assert_eq!(writer.get(1).unwrap().as_ref(), &[1, 2]);
        assert!(writer.get(2).is_none());

        writer.close().unwrap();
        writer.close().unwrap();
        assert!(writer.is_closed());
        assert!(writer.add(9, &[]).is_err());
        assert_eq!(writer.entries().len(), 2);
    }
}
