//! Local file source.
//!
//! Reads slices of a file on demand through the shared [`ChunkCache`].
//! All I/O happens in fixed 2 MiB chunks so that the demuxer's scattered
//! small reads (a few bytes of box header here, a packet there) each
//! cost at most one `read_at` per chunk, and repeated passes over the
//! same region (index parsing, seeking) are served from memory.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{Error, Result};

use super::{ChunkCache, Source, CHUNK_SIZE};

/// Local media source with chunked LRU caching.
///
/// The canonical path string is the cache namespace, so two sessions
/// over the same file share chunks.
pub struct FileSource {
    file: Option<tokio::fs::File>,
    path: PathBuf,
    cache_key: String,
    size: u64,
    position: u64,
    cache: Arc<Mutex<ChunkCache>>,
}

impl FileSource {
    /// Opens a local file source.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened or its metadata read.
    pub async fn open(path: impl AsRef<Path>, cache: Arc<Mutex<ChunkCache>>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::File::open(&path).await?;
        let size = file.metadata().await?.len();
        let cache_key = format!("file:{}", path.display());

        debug!("opened file source, {size} bytes: {}", path.display());
        Ok(Self {
            file: Some(file),
            path,
            cache_key,
            size,
            position: 0,
            cache,
        })
    }

    /// Loads one chunk, from cache when possible.
    async fn chunk(&mut self, index: u64) -> Result<Bytes> {
        if let Some(hit) = self
            .cache
            .lock()
            .expect("chunk cache lock poisoned")
            .get(&self.cache_key, index)
        {
            return Ok(hit);
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::cancelled("source closed"))?;

        let start = index * CHUNK_SIZE;
        let len = CHUNK_SIZE.min(self.size.saturating_sub(start));
        let mut buf = BytesMut::zeroed(usize::try_from(len).expect("chunk fits usize"));

        file.seek(SeekFrom::Start(start)).await?;
        file.read_exact(&mut buf).await?;

        let data = buf.freeze();
        self.cache
            .lock()
            .expect("chunk cache lock poisoned")
            .insert(&self.cache_key, index, data.clone());
        Ok(data)
    }
}

impl Source for FileSource {
    fn cache_key(&self) -> &str {
        &self.cache_key
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read(&mut self, offset: u64, length: u64) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin(async move {
            if self.file.is_none() {
                return Err(Error::cancelled("source closed"));
            }
            if offset >= self.size || length == 0 {
                return Ok(Bytes::new());
            }
            let length = length.min(self.size - offset);

            let first = offset / CHUNK_SIZE;
            let last = (offset + length - 1) / CHUNK_SIZE;

            // Single-chunk reads are the common case and avoid a copy.
            if first == last {
                let chunk = self.chunk(first).await?;
                let start = (offset - first * CHUNK_SIZE) as usize;
                let end = start + length as usize;
                self.position = offset + length;
                return Ok(chunk.slice(start..end.min(chunk.len())));
            }

            let mut out = BytesMut::with_capacity(usize::try_from(length).expect("read fits usize"));
            for index in first..=last {
                let chunk = self.chunk(index).await?;
                let chunk_start = index * CHUNK_SIZE;
                let begin = offset.max(chunk_start) - chunk_start;
                let end = (offset + length).min(chunk_start + chunk.len() as u64) - chunk_start;
                out.extend_from_slice(&chunk[begin as usize..end as usize]);
            }
            self.position = offset + length;
            Ok(out.freeze())
        })
    }

    fn seek(&mut self, offset: u64) -> u64 {
        self.position = offset.min(self.size);
        self.position
    }

    fn buffered_to(&self) -> u64 {
        // Local storage is random access at memory-like latency compared
        // to the network, so the whole file counts as buffered.
        self.size
    }

    fn close(&mut self) {
        self.file = None;
        self.cache
            .lock()
            .expect("chunk cache lock poisoned")
            .purge(&self.cache_key);
        trace!("closed file source: {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    async fn fixture(len: usize) -> (tempfile::NamedTempFile, FileSource) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let cache = Arc::new(Mutex::new(ChunkCache::new(64 * 1024 * 1024)));
        let source = FileSource::open(file.path(), cache).await.unwrap();
        (file, source)
    }

    #[tokio::test]
    async fn read_within_one_chunk() {
        let (_guard, mut source) = fixture(4096).await;
        assert_eq!(source.size(), 4096);

        let data = source.read(100, 16).await.unwrap();
        let expect: Vec<u8> = (100..116).map(|i| (i % 251) as u8).collect();
        assert_eq!(&data[..], &expect[..]);
    }

    #[tokio::test]
    async fn read_clamps_at_eof() {
        let (_guard, mut source) = fixture(1000).await;

        let data = source.read(990, 64).await.unwrap();
        assert_eq!(data.len(), 10);

        let data = source.read(2000, 8).await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn repeated_reads_hit_the_cache() {
        let (_guard, mut source) = fixture(4096).await;

        let first = source.read(0, 4096).await.unwrap();
        let second = source.read(0, 4096).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn close_rejects_further_reads() {
        let (_guard, mut source) = fixture(128).await;
        source.close();
        assert!(source.read(0, 16).await.is_err());
    }

    #[tokio::test]
    async fn whole_file_counts_as_buffered() {
        let (_guard, source) = fixture(128).await;
        assert_eq!(source.buffered_to(), 128);
    }
}
