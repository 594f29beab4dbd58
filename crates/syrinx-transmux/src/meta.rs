#![forbid(unsafe_code)]

/// Timing record stamped by the transmuxer on every push/flush.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimingInfo {
    /// Clock millis when the transmuxer started working on the chunk.
    pub execute_start: f64,
    /// Clock millis when the result was handed back.
    pub execute_end: f64,
}

/// Identity of a chunk, carried through the transmuxer as a cookie.
///
/// The transmuxer stamps `transmuxing` and returns everything else
/// untouched so the host can correlate results with requests.
#[derive(Debug, Clone)]
pub struct ChunkMetadata {
    /// Playlist level the chunk belongs to.
    pub level: u32,
    /// Segment sequence number.
    pub sn: u64,
    /// Part index within the segment; -1 for whole segments.
    pub part: i32,
    /// Chunk payload size in bytes.
    pub size: usize,
    pub transmuxing: TimingInfo,
}

impl ChunkMetadata {
    pub fn new(level: u32, sn: u64, part: i32, size: usize) -> Self {
        Self {
            level,
            sn,
            part,
            size,
            transmuxing: TimingInfo::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_metadata_has_zeroed_timing() {
        let meta = ChunkMetadata::new(2, 14, -1, 4096);
        assert_eq!(meta.level, 2);
        assert_eq!(meta.sn, 14);
        assert_eq!(meta.part, -1);
        assert_eq!(meta.transmuxing, TimingInfo::default());
    }
}
