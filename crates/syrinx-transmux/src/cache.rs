#![forbid(unsafe_code)]

use bytes::{Bytes, BytesMut};

/// Append-only byte cache for pre-probe accumulation.
///
/// Chunks pushed before the container format is known are held here and
/// drained in one piece once probing succeeds (or discarded at segment
/// flush). Single-chunk drains hand the original buffer back without a
/// copy.
#[derive(Debug, Default)]
pub struct ChunkCache {
    chunks: Vec<Bytes>,
    len: usize,
}

impl ChunkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk, preserving arrival order.
    pub fn append(&mut self, data: Bytes) {
        self.len += data.len();
        self.chunks.push(data);
    }

    /// Total bytes accumulated.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drain the cache, returning all chunks concatenated in arrival order.
    pub fn flush(&mut self) -> Bytes {
        self.len = 0;
        if self.chunks.len() == 1 {
            return self.chunks.pop().unwrap_or_default();
        }
        let mut joined = BytesMut::with_capacity(self.chunks.iter().map(Bytes::len).sum());
        for chunk in self.chunks.drain(..) {
            joined.extend_from_slice(&chunk);
        }
        joined.freeze()
    }

    /// Empty the cache without returning anything.
    pub fn reset(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_concatenates_in_arrival_order() {
        let mut cache = ChunkCache::new();
        cache.append(Bytes::from_static(b"one"));
        cache.append(Bytes::from_static(b"two"));
        cache.append(Bytes::from_static(b"three"));
        assert_eq!(cache.len(), 11);
        assert_eq!(cache.flush().as_ref(), b"onetwothree");
        assert!(cache.is_empty());
    }

    #[test]
    fn single_chunk_flush_returns_original() {
        let mut cache = ChunkCache::new();
        let chunk = Bytes::from_static(b"only");
        cache.append(chunk.clone());
        let drained = cache.flush();
        assert_eq!(drained, chunk);
    }

    #[test]
    fn flush_empties_and_is_reusable() {
        let mut cache = ChunkCache::new();
        cache.append(Bytes::from_static(b"abc"));
        let _ = cache.flush();
        assert_eq!(cache.len(), 0);
        cache.append(Bytes::from_static(b"de"));
        assert_eq!(cache.flush().as_ref(), b"de");
    }

    #[test]
    fn reset_discards_without_returning() {
        let mut cache = ChunkCache::new();
        cache.append(Bytes::from_static(b"junk"));
        cache.reset();
        assert!(cache.is_empty());
        assert_eq!(cache.flush().len(), 0);
    }
}
