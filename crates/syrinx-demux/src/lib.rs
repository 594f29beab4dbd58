#![forbid(unsafe_code)]

//! Container probing and demuxing.
//!
//! Four container families are recognized: fragmented MP4 (forwarded for
//! passthrough remuxing), MPEG-TS, elementary AAC/ADTS, and elementary MP3.
//! Each demuxer module exposes a `probe` predicate plus a `MIN_PROBE_LEN`
//! telling callers how many bytes the predicate needs before its verdict is
//! trustworthy.

pub mod adts;
pub mod id3;
pub mod mp4;
pub mod mpa;
mod tracks;
pub mod ts;

use async_trait::async_trait;
use bytes::Bytes;
use syrinx_drm::{DrmError, KeyData};
use thiserror::Error;

pub use tracks::{
    AudioCodecKind, AudioSample, AudioTrack, DemuxerResult, MPEG_TS_TIMESCALE, MediaTimestamp,
    MetadataSample, MetadataTrack, UserdataSample, UserdataTrack, VideoSample, VideoTrack,
};

/// Container family of a media segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Fmp4,
    MpegTs,
    Adts,
    Mp3,
}

/// What the downstream source buffer can ingest without transcoding.
///
/// Opaque capability record forwarded from the host; demuxers consult it
/// when a stream could be mapped to more than one output flavor.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypeSupported {
    /// `audio/mpeg` source buffers are accepted.
    pub mpeg: bool,
    /// `audio/mp4;codecs=mp3` is accepted.
    pub mp3: bool,
}

/// Demuxing errors.
#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("decryption failed: {0}")]
    Drm(#[from] DrmError),

    #[error("SAMPLE-AES is not supported for this container")]
    SampleAesUnsupported,
}

/// A container demuxer: parses segment bytes into elementary track streams.
///
/// Implementations keep parser state across calls (partial frames, PES
/// assembly, codec configuration) so that progressive chunked input works;
/// the `reset_*` methods selectively clear that state on segment
/// boundaries.
#[async_trait]
pub trait Demuxer: Send {
    /// Parse a chunk of segment bytes into track samples.
    ///
    /// `flush` signals whole-segment delivery: the demuxer may finalize
    /// frames it would otherwise hold back for the next chunk.
    fn demux(
        &mut self,
        data: Bytes,
        time_offset: f64,
        contiguous: bool,
        flush: bool,
    ) -> DemuxerResult;

    /// Parse a SAMPLE-AES encrypted chunk, decrypting sample payloads.
    async fn demux_sample_aes(
        &mut self,
        data: Bytes,
        key_data: KeyData,
        time_offset: f64,
    ) -> Result<DemuxerResult, DemuxError> {
        let _ = (data, key_data, time_offset);
        Err(DemuxError::SampleAesUnsupported)
    }

    /// Drain any buffered partial input at end of segment.
    async fn flush(&mut self, time_offset: f64) -> DemuxerResult;

    /// Install a new init segment / codec hints for the upcoming segment.
    fn reset_init_segment(
        &mut self,
        init_segment: Option<&Bytes>,
        audio_codec: Option<&str>,
        video_codec: Option<&str>,
        track_duration: f64,
    );

    /// Re-anchor timestamp generation for a new timeline.
    fn reset_timestamp(&mut self, default_init_pts: Option<MediaTimestamp>);

    /// Forget cross-segment continuity (PES assembly, frame carry-over).
    fn reset_contiguity(&mut self);
}
