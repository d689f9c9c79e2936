use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio_util::io::{ReaderStream, StreamReader};

use crate::error::StoreError;

pub mod driver;
pub mod locked;
pub mod paths;

/// The capability set a shard store exposes to the shard manager:
/// reader, writer, deleter, flusher, sizer and key enumerator.
///
/// Implementations do not serialize access to a key. Concurrent writes and
/// reads of the same key race; wrap the adapter in
/// [`locked::KeyLocked`] when that matters.
#[async_trait::async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Opens the shard stored under `key` for streaming.
    ///
    /// Fails with [`StoreError::NotFound`] if no such shard exists.
    async fn get(&self, key: &str) -> Result<ShardHandle, StoreError>;

    /// Same contract as [`StorageAdapter::get`]. Never mutates the store.
    async fn peek(&self, key: &str) -> Result<ShardHandle, StoreError> {
        self.get(key).await
    }

    /// Writes the full payload under `key`, replacing any previous contents.
    async fn put(&self, key: &str, shard: ShardBody) -> Result<(), StoreError>;

    /// Removes the shard under `key`. Removing a missing shard is an error.
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    async fn flush(&self) -> Result<(), StoreError>;

    /// Bytes used by the shard under `key`, or by every shard when `None`.
    async fn size(&self, key: Option<&str>) -> Result<u64, StoreError>;

    /// Lists every stored key once, then ends. Each call starts a new listing.
    fn keys(&self) -> BoxStream<'static, Result<String, StoreError>>;
}

/// An open shard, bound to the key it was read under.
///
/// A handle obtained through [`locked::KeyLocked`] keeps the key's read lock
/// until it is dropped.
#[derive(Debug)]
pub struct ShardHandle {
    key: String,
    shard: File,
    _lock: Option<locked::KeyGuard>,
}

impl ShardHandle {
    pub fn new(key: impl Into<String>, shard: File) -> Self {
        ShardHandle {
            key: key.into(),
            shard,
            _lock: None,
        }
    }

    pub(crate) fn with_guard(mut self, guard: locked::KeyGuard) -> Self {
        self._lock = Some(guard);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn len(&self) -> io::Result<u64> {
        Ok(self.shard.metadata().await?.len())
    }

    /// Reads the rest of the shard into memory.
    pub async fn read_to_vec(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.shard.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    /// Gives up the handle for its file. Any key lock is released.
    pub fn into_file(self) -> File {
        self.shard
    }
}

impl AsyncRead for ShardHandle {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.shard).poll_read(cx, buf)
    }
}

/// The payload of a `put`, consumed as a stream of byte chunks.
///
/// An error yielded by the stream aborts the write and is returned to the
/// caller of `put` as is.
pub struct ShardBody {
    stream: BoxStream<'static, io::Result<Bytes>>,
}

impl ShardBody {
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        ShardBody {
            stream: stream.boxed(),
        }
    }

    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self::from_stream(ReaderStream::new(reader))
    }

    pub fn empty() -> Self {
        Self::from_stream(stream::empty())
    }

    pub(crate) fn into_reader(self) -> StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes> {
        StreamReader::new(self.stream)
    }
}

impl From<Bytes> for ShardBody {
    fn from(bytes: Bytes) -> Self {
        Self::from_stream(stream::once(async move { Ok(bytes) }))
    }
}

impl From<Vec<u8>> for ShardBody {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl From<&'static [u8]> for ShardBody {
    fn from(bytes: &'static [u8]) -> Self {
        Bytes::from_static(bytes).into()
    }
}

impl From<&'static str> for ShardBody {
    fn from(s: &'static str) -> Self {
        Bytes::from_static(s.as_bytes()).into()
    }
}

impl From<String> for ShardBody {
    fn from(s: String) -> Self {
        Bytes::from(s).into()
    }
}

impl std::fmt::Debug for ShardBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardBody").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(body: ShardBody) -> io::Result<Vec<u8>> {
        let mut reader = body.into_reader();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    #[tokio::test]
    async fn test_body_from_chunks() -> anyhow::Result<()> {
        let chunks = vec![
            Ok(Bytes::from_static(b"te")),
            Ok(Bytes::new()),
            Ok(Bytes::from_static(b"st")),
        ];
        let body = ShardBody::from_stream(stream::iter(chunks));
        assert_eq!(drain(body).await?, b"test");
        assert!(drain(ShardBody::empty()).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_body_from_reader() -> anyhow::Result<()> {
        let body = ShardBody::from_reader(&b"streamed shard"[..]);
        assert_eq!(drain(body).await?, b"streamed shard");
        Ok(())
    }

    #[tokio::test]
    async fn test_body_error_passes_through() {
        let body = ShardBody::from_stream(stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::other("Failed")),
        ]));
        let err = drain(body).await.unwrap_err();
        assert_eq!(err.to_string(), "Failed");
    }
}
