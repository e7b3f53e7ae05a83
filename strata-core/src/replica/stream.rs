//! Length-framed replication stream

use crate::config::MAX_FRAME_SIZE;
use crate::{Result, ShardId, StrataError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// First frame of every replication stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHeader {
    pub database: String,
    pub shard_id: ShardId,
}

impl StreamHeader {
    pub fn new(database: impl Into<String>, shard_id: ShardId) -> Self {
        Self {
            database: database.into(),
            shard_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Write one frame: u32 little-endian length followed by the body
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_SIZE {
        return Err(StrataError::Transport(format!(
            "frame of {} bytes exceeds limit {}",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }
    writer.write_u32_le(body.len() as u32).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `None` on a clean end of stream before a length prefix
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32_le().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(StrataError::Transport(format!(
            "frame of {} bytes exceeds limit {}",
            len, MAX_FRAME_SIZE
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(Bytes::from(body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let header = StreamHeader::new("db", 3);

        write_frame(&mut client, &header.encode().unwrap()).await.unwrap();
        write_frame(&mut client, &[]).await.unwrap();
        write_frame(&mut client, &[1, 2, 3]).await.unwrap();
        drop(client);

        let first = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(StreamHeader::decode(&first).unwrap(), header);
        assert!(read_frame(&mut server).await.unwrap().unwrap().is_empty());
        assert_eq!(
            read_frame(&mut server).await.unwrap().unwrap().as_ref(),
            &[1, 2, 3]
        );
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32_le(u32::MAX).await.unwrap();
        assert!(matches!(
            read_frame(&mut server).await,
            Err(StrataError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32_le(10).await.unwrap();
        client.write_all(&[1, 2]).await.unwrap();
        drop(client);
        assert!(matches!(read_frame(&mut server).await, Err(StrataError::Io(_))));
    }
}
