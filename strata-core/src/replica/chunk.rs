//! Write chunks batching serialized metrics of one shard

use crate::{Result, StrataError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Append-only batch of serialized writes
///
/// Owned by the flush loop of one channel, never shared.
pub trait Chunk: Send {
    /// Append one serialized write
    fn append(&mut self, payload: &[u8]);

    /// Whether the size or item threshold has been reached
    fn is_full(&self) -> bool;

    /// Whether nothing was appended since the last marshal
    fn is_empty(&self) -> bool;

    /// Buffered bytes, before compression
    fn size(&self) -> usize;

    /// Encode the buffered writes into one block and reset the chunk
    ///
    /// An empty chunk yields an empty block.
    fn marshal_binary(&mut self) -> Result<Bytes>;
}

/// Chunk compressing its writes with LZ4
///
/// Block format:
/// - 4 bytes: item count
/// - 4 bytes: CRC32 of the compressed body
/// - N bytes: LZ4 body (size prepended) of `[u32 length][payload]` items
pub struct CompressedChunk {
    buf: BytesMut,
    count: usize,
    max_items: usize,
    max_bytes: usize,
}

impl CompressedChunk {
    pub fn new(max_items: usize, max_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            count: 0,
            max_items: max_items.max(1),
            max_bytes: max_bytes.max(1),
        }
    }

    /// Number of writes buffered
    pub fn len(&self) -> usize {
        self.count
    }
}

impl Chunk for CompressedChunk {
    fn append(&mut self, payload: &[u8]) {
        self.buf.put_u32_le(payload.len() as u32);
        self.buf.put_slice(payload);
        self.count += 1;
    }

    fn is_full(&self) -> bool {
        self.count >= self.max_items || self.buf.len() >= self.max_bytes
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn size(&self) -> usize {
        self.buf.len()
    }

    fn marshal_binary(&mut self) -> Result<Bytes> {
        if self.count == 0 {
            return Ok(Bytes::new());
        }
        let count = std::mem::take(&mut self.count);
        let raw = self.buf.split();
        let count = u32::try_from(count)
            .map_err(|_| StrataError::Encoding(format!("chunk holds {} items", count)))?;

        let body = lz4_flex::compress_prepend_size(&raw);
        let mut block = BytesMut::with_capacity(body.len() + 8);
        block.put_u32_le(count);
        block.put_u32_le(crc32fast::hash(&body));
        block.put_slice(&body);
        Ok(block.freeze())
    }
}

/// Split a marshaled chunk back into its serialized writes
pub fn decode_chunk(data: &[u8]) -> Result<Vec<Bytes>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    if data.len() < 8 {
        return Err(StrataError::InvalidFormat("Chunk too short".into()));
    }

    let mut header = &data[..8];
    let count = header.get_u32_le() as usize;
    let expected = header.get_u32_le();
    let body = &data[8..];
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(StrataError::ChecksumMismatch { expected, actual });
    }

    let raw = lz4_flex::decompress_size_prepended(body)
        .map_err(|e| StrataError::Compression(e.to_string()))?;
    let mut raw = Bytes::from(raw);

    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        if raw.remaining() < 4 {
            return Err(StrataError::InvalidFormat("Chunk item header truncated".into()));
        }
        let len = raw.get_u32_le() as usize;
        if raw.remaining() < len {
            return Err(StrataError::InvalidFormat("Chunk item truncated".into()));
        }
        items.push(raw.split_to(len));
    }
    if raw.has_remaining() {
        return Err(StrataError::InvalidFormat(format!(
            "Chunk has {} trailing bytes",
            raw.remaining()
        )));
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_chunk_marshal() {
        let mut chunk = CompressedChunk::new(10, 1024);
        assert!(chunk.is_empty());
        assert!(!chunk.is_full());
        let block = chunk.marshal_binary().unwrap();
        assert!(block.is_empty());
        assert!(decode_chunk(&block).unwrap().is_empty());
    }

    #[test]
    fn test_chunk_full_by_count_and_size() {
        let mut chunk = CompressedChunk::new(2, 1024);
        chunk.append(&[1, 2]);
        assert!(!chunk.is_full());
        chunk.append(&[3]);
        assert!(chunk.is_full());
        chunk.append(&[4]);
        assert!(chunk.is_full());
        assert_eq!(chunk.len(), 3);

        chunk.marshal_binary().unwrap();
        assert!(!chunk.is_full());
        assert!(chunk.is_empty());
        assert_eq!(chunk.size(), 0);

        let mut chunk = CompressedChunk::new(100, 16);
        chunk.append(&[0; 8]);
        assert!(!chunk.is_full());
        chunk.append(&[0; 8]);
        assert!(chunk.is_full());
    }

    #[test]
    fn test_marshal_and_decode() {
        let mut chunk = CompressedChunk::new(100, 1024 * 1024);
        let payloads: Vec<Vec<u8>> = (0..50u8).map(|i| vec![i; i as usize]).collect();
        for p in &payloads {
            chunk.append(p);
        }
        let block = chunk.marshal_binary().unwrap();
        let items = decode_chunk(&block).unwrap();
        assert_eq!(items.len(), payloads.len());
        for (item, p) in items.iter().zip(&payloads) {
            assert_eq!(item.as_ref(), p.as_slice());
        }

        // reusable after marshal
        chunk.append(&[7, 7]);
        let items = decode_chunk(&chunk.marshal_binary().unwrap()).unwrap();
        assert_eq!(items, vec![Bytes::from_static(&[7, 7])]);
    }

    #[test]
    fn test_decode_corrupted_chunk() {
        let mut chunk = CompressedChunk::new(100, 1024);
        chunk.append(&[1, 2, 3]);
        let mut block = chunk.marshal_binary().unwrap().to_vec();
        let last = block.len() - 1;
        block[last] ^= 0xFF;
        assert!(matches!(
            decode_chunk(&block),
            Err(StrataError::ChecksumMismatch { .. })
        ));
        assert!(decode_chunk(&[1, 2, 3]).is_err());
    }
}
