//! Table file writer and reader
//!
//! Layout:
//! - header: magic `STRT`, format version
//! - entries: key, value length, value, CRC32 of the value
//! - index: entry count, then key / value offset / value length per entry
//! - footer: index offset, index size, CRC32 of the index, magic `STRT`

use super::{StoreWriter, FORMAT_VERSION};
use crate::{Result, StrataError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const MAGIC: &[u8; 4] = b"STRT";
const HEADER_SIZE: usize = 8;
const FOOTER_SIZE: usize = 24;

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    offset: u64,
    size: u32,
}

/// Writes one immutable table file
pub struct FileStoreWriter {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    index: BTreeMap<u32, IndexEntry>,
    offset: u64,
}

impl FileStoreWriter {
    /// Create the file and write its header
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = BufWriter::new(File::create(&path)?);

        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_slice(MAGIC);
        buf.put_u32_le(FORMAT_VERSION);
        file.write_all(&buf)?;

        Ok(Self {
            path,
            file: Some(file),
            index: BTreeMap::new(),
            offset: HEADER_SIZE as u64,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of values added so far
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl StoreWriter for FileStoreWriter {
    fn add(&mut self, key: u32, value: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StrataError::Internal("table writer already closed".into()))?;
        if self.index.contains_key(&key) {
            return Err(StrataError::InvalidFormat(format!(
                "Duplicate table key: {}",
                key
            )));
        }

        let mut buf = BytesMut::with_capacity(value.len() + 12);
        buf.put_u32_le(key);
        buf.put_u32_le(value.len() as u32);
        buf.put_slice(value);
        buf.put_u32_le(crc32fast::hash(value));
        file.write_all(&buf)?;

        self.index.insert(
            key,
            IndexEntry {
                offset: self.offset + 8,
                size: value.len() as u32,
            },
        );
        self.offset += buf.len() as u64;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };

        let mut index = BytesMut::new();
        index.put_u32_le(self.index.len() as u32);
        for (key, entry) in &self.index {
            index.put_u32_le(*key);
            index.put_u64_le(entry.offset);
            index.put_u32_le(entry.size);
        }

        let mut footer = BytesMut::with_capacity(FOOTER_SIZE);
        footer.put_u64_le(self.offset);
        footer.put_u64_le(index.len() as u64);
        footer.put_u32_le(crc32fast::hash(&index));
        footer.put_slice(MAGIC);

        file.write_all(&index)?;
        file.write_all(&footer)?;
        file.flush()?;
        file.get_ref().sync_all()?;

        debug!(path = ?self.path, entries = self.index.len(), "table file closed");
        Ok(())
    }
}

/// Reads a table file produced by [`FileStoreWriter`]
pub struct TableReader {
    path: PathBuf,
    data: Bytes,
    index: BTreeMap<u32, IndexEntry>,
}

impl TableReader {
    /// Load a table file fully into memory
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = Bytes::from(std::fs::read(&path)?);
        let index = Self::parse(&data)?;
        Ok(Self { path, data, index })
    }

    fn parse(data: &[u8]) -> Result<BTreeMap<u32, IndexEntry>> {
        if data.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(StrataError::InvalidFormat("Table file too short".into()));
        }
        if &data[..4] != MAGIC {
            return Err(StrataError::InvalidFormat("Invalid table header".into()));
        }
        let version = (&data[4..8]).get_u32_le();
        if version != FORMAT_VERSION {
            return Err(StrataError::InvalidFormat(format!(
                "Unsupported version: {}",
                version
            )));
        }

        let mut footer = &data[data.len() - FOOTER_SIZE..];
        let index_offset = footer.get_u64_le() as usize;
        let index_size = footer.get_u64_le() as usize;
        let expected = footer.get_u32_le();
        if footer != MAGIC {
            return Err(StrataError::InvalidFormat("Invalid table magic".into()));
        }
        let index_end = index_offset
            .checked_add(index_size)
            .filter(|end| *end <= data.len() - FOOTER_SIZE)
            .ok_or_else(|| StrataError::InvalidFormat("Index out of bounds".into()))?;

        let index_data = &data[index_offset..index_end];
        let actual = crc32fast::hash(index_data);
        if expected != actual {
            return Err(StrataError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = index_data;
        if cursor.remaining() < 4 {
            return Err(StrataError::InvalidFormat("Index too short".into()));
        }
        let count = cursor.get_u32_le() as usize;
        if cursor.remaining() != count * 16 {
            return Err(StrataError::InvalidFormat("Index size mismatch".into()));
        }

        let mut index = BTreeMap::new();
        for _ in 0..count {
            let key = cursor.get_u32_le();
            let offset = cursor.get_u64_le();
            let size = cursor.get_u32_le();
            if offset as usize + size as usize + 4 > index_offset {
                return Err(StrataError::InvalidFormat(format!(
                    "Entry {} out of bounds",
                    key
                )));
            }
            index.insert(key, IndexEntry { offset, size });
        }
        Ok(index)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keys stored in the table, ascending
    pub fn keys(&self) -> impl Iterator<Item = u32> + '_ {
        self.index.keys().copied()
    }

    /// Value stored under `key`, checksum verified
    pub fn get(&self, key: u32) -> Result<Option<Bytes>> {
        let Some(entry) = self.index.get(&key) else {
            return Ok(None);
        };
        let start = entry.offset as usize;
        let end = start + entry.size as usize;
        let value = self.data.slice(start..end);

        let expected = (&self.data[end..end + 4]).get_u32_le();
        let actual = crc32fast::hash(&value);
        if expected != actual {
            return Err(StrataError::ChecksumMismatch { expected, actual });
        }
        Ok(Some(value))
    }
}
