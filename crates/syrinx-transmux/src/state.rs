#![forbid(unsafe_code)]

//! Per-configure and per-push state records.

use bytes::Bytes;
use syrinx_demux::MediaTimestamp;

/// Segment-level configuration, replaced wholesale by `configure`.
#[derive(Debug, Clone, Default)]
pub struct TransmuxConfig {
    /// Audio codec hint from the playlist (`CODECS` attribute).
    pub audio_codec: Option<String>,
    /// Video codec hint from the playlist.
    pub video_codec: Option<String>,
    /// Init segment bytes for fMP4 renditions.
    pub init_segment_data: Option<Bytes>,
    /// Expected track duration in seconds.
    pub duration: f64,
    /// Timestamp anchor carried over from a previous transmuxer instance.
    pub default_init_pts: Option<MediaTimestamp>,
}

/// Continuity flags and offsets that travel with each push.
///
/// After a successful push the transmuxer flips `contiguous` on and clears
/// `discontinuity`/`track_switch`, so later chunks of the same segment skip
/// the reset work.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransmuxState {
    /// Segment comes from a different continuity counter.
    pub discontinuity: bool,
    /// Segment continues the previous one without a gap.
    pub contiguous: bool,
    /// `time_offset` is authoritative rather than estimated.
    pub accurate_time_offset: bool,
    /// Audio/video codec changed relative to the previous segment.
    pub track_switch: bool,
    /// Playlist-relative start time of this chunk, seconds.
    pub time_offset: f64,
    /// Caller supplied new init-segment bytes.
    pub init_segment_change: bool,
}

impl TransmuxState {
    pub fn new(
        discontinuity: bool,
        contiguous: bool,
        accurate_time_offset: bool,
        track_switch: bool,
        time_offset: f64,
        init_segment_change: bool,
    ) -> Self {
        Self {
            discontinuity,
            contiguous,
            accurate_time_offset,
            track_switch,
            time_offset,
            init_segment_change,
        }
    }
}

/// Construction-time options for the transmuxer.
#[derive(Debug, Clone, Copy)]
pub struct TransmuxerOptions {
    /// Decrypt AES-128 segments progressively in software; when off, whole
    /// segments are decrypted in one asynchronous shot.
    pub enable_software_aes: bool,
    /// Chunks arrive progressively; when off, each push carries a whole
    /// segment and demuxers may finalize frames eagerly.
    pub progressive: bool,
}

impl Default for TransmuxerOptions {
    fn default() -> Self {
        Self {
            enable_software_aes: true,
            progressive: false,
        }
    }
}
