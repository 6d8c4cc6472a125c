//! Byte-range media sources.
//!
//! A source is an ordered byte range `[0, size)` with random-access
//! reads. Two concrete implementations exist:
//!
//! * [`HttpSource`](http::HttpSource): byte-range requests against a
//!   remote server, with a sliding window buffer and retry policy
//! * [`FileSource`](file::FileSource): local reads fronted by a bounded
//!   LRU of fixed-size chunks
//!
//! Sources hand out owned [`Bytes`] buffers; the shared [`ChunkCache`]
//! holds immutable chunks that several sources with the same cache key
//! may reuse.
//!
//! All offsets are 64-bit. A source is created per media session and
//! closed when the session ends; reads after `close()` fail with
//! `Cancelled`.

pub mod file;
pub mod http;

use std::num::NonZeroUsize;

use bytes::Bytes;
use futures_util::future::BoxFuture;

use crate::error::Result;

/// Random-access byte source.
///
/// The async read is the only suspension point; `size`, `seek` and
/// `close` are bookkeeping. Implementations must tolerate reads past
/// EOF by returning a short (possibly empty) buffer.
pub trait Source: Send {
    /// Stable identifier used as the cache namespace for this source.
    fn cache_key(&self) -> &str;

    /// Total size of the byte range in bytes.
    fn size(&self) -> u64;

    /// Reads up to `length` bytes starting at `offset`.
    ///
    /// Returns fewer bytes only at EOF. The returned buffer is owned by
    /// the caller.
    fn read(&mut self, offset: u64, length: u64) -> BoxFuture<'_, Result<Bytes>>;

    /// Moves the logical read position, returning the clamped offset.
    ///
    /// Reads are absolute, so this only records intent; it exists
    /// because container parsers express their I/O as seek-then-read.
    fn seek(&mut self, offset: u64) -> u64;

    /// Furthest byte offset contiguously buffered from the current
    /// position. File-backed sources report their full size.
    fn buffered_to(&self) -> u64;

    /// Releases buffers and aborts outstanding requests.
    ///
    /// Subsequent reads fail with `Cancelled`.
    fn close(&mut self);
}

/// Fixed chunk size for cached reads (2 MiB).
pub const CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// Maximum number of chunks the cache will hold per source.
pub const MAX_CHUNKS: usize = 50;

/// Key of one cached chunk: source namespace plus chunk index.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct ChunkKey {
    namespace: String,
    index: u64,
}

/// Bounded LRU cache of immutable source chunks.
///
/// Shared across all sources created with the same key prefix. Insertion
/// evicts the least-recently-used entry whenever the byte total would
/// exceed the cap.
pub struct ChunkCache {
    entries: lru::LruCache<ChunkKey, Bytes>,
    total_bytes: u64,
    max_bytes: u64,
}

impl ChunkCache {
    /// Creates a cache bounded by `max_bytes` and [`MAX_CHUNKS`] entries.
    ///
    /// # Panics
    ///
    /// Panics if `MAX_CHUNKS` is zero, which it is not.
    #[must_use]
    pub fn new(max_bytes: u64) -> Self {
        Self {
            entries: lru::LruCache::new(NonZeroUsize::new(MAX_CHUNKS).expect("chunk cap is zero")),
            total_bytes: 0,
            max_bytes,
        }
    }

    /// Looks up a chunk, marking it most recently used.
    pub fn get(&mut self, namespace: &str, index: u64) -> Option<Bytes> {
        let key = ChunkKey {
            namespace: namespace.to_owned(),
            index,
        };
        self.entries.get(&key).cloned()
    }

    /// Inserts a chunk, evicting least-recently-used entries until both
    /// the byte and entry caps hold.
    pub fn insert(&mut self, namespace: &str, index: u64, data: Bytes) {
        let key = ChunkKey {
            namespace: namespace.to_owned(),
            index,
        };

        let size = data.len() as u64;
        if let Some(old) = self.entries.put(key, data) {
            self.total_bytes = self.total_bytes.saturating_sub(old.len() as u64);
        }
        self.total_bytes = self.total_bytes.saturating_add(size);

        while self.total_bytes > self.max_bytes {
            match self.entries.pop_lru() {
                Some((_, evicted)) => {
                    self.total_bytes = self.total_bytes.saturating_sub(evicted.len() as u64);
                }
                None => break,
            }
        }
    }

    /// Drops every chunk belonging to `namespace`.
    pub fn purge(&mut self, namespace: &str) {
        // `LruCache` has no retain; collect keys first.
        let keys: Vec<ChunkKey> = self
            .entries
            .iter()
            .filter(|(key, _)| key.namespace == namespace)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            if let Some(evicted) = self.entries.pop(&key) {
                self.total_bytes = self.total_bytes.saturating_sub(evicted.len() as u64);
            }
        }
    }

    /// Current byte total held by the cache.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}
