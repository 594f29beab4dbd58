#![forbid(unsafe_code)]

//! Remuxing of demuxed elementary streams into fragmented MP4.
//!
//! Two remuxers share one trait: [`Mp4Remuxer`] packages elementary AVC /
//! AAC / MP3 samples into `moof`+`mdat` fragments (generating the init
//! segment itself), and [`PassthroughRemuxer`] forwards segments that are
//! already fragmented MP4, deriving timing from their `tfdt`.

pub mod mp4_generator;
mod mp4_remuxer;
mod passthrough;

use bytes::Bytes;
use syrinx_demux::{DemuxerResult, MediaTimestamp, MetadataTrack, UserdataTrack};

pub use mp4_generator::{FragmentSample, TrackSpec};
pub use mp4_remuxer::Mp4Remuxer;
pub use passthrough::PassthroughRemuxer;

/// Which playlist the segment belongs to; forwarded by the host so
/// remuxers can tell the main rendition from an alternate audio one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamKind {
    #[default]
    Main,
    Audio,
}

/// Medium of a remuxed track payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// One remuxed fragment ready for a source buffer.
#[derive(Debug, Clone)]
pub struct RemuxedTrack {
    pub kind: TrackKind,
    /// `moof`+`mdat` bytes (or the raw segment for passthrough).
    pub data: Bytes,
    /// Presentation window in seconds, relative to the init PTS anchor.
    pub start_pts: f64,
    pub end_pts: f64,
    pub start_dts: f64,
    pub end_dts: f64,
    pub sample_count: usize,
    pub dropped: usize,
}

/// Init segment for one track.
#[derive(Debug, Clone)]
pub struct InitSegmentTrack {
    pub id: u32,
    /// MIME container, e.g. `audio/mp4`.
    pub container: &'static str,
    pub codec: String,
    pub data: Bytes,
}

/// Init segments plus the timestamp anchor they establish.
#[derive(Debug, Clone, Default)]
pub struct InitSegmentData {
    pub audio: Option<InitSegmentTrack>,
    pub video: Option<InitSegmentTrack>,
    pub init_pts: Option<MediaTimestamp>,
}

/// Everything one remux pass produced.
#[derive(Debug, Clone, Default)]
pub struct RemuxResult {
    pub audio: Option<RemuxedTrack>,
    pub video: Option<RemuxedTrack>,
    pub init_segment: Option<InitSegmentData>,
    pub id3: Option<MetadataTrack>,
    pub text: Option<UserdataTrack>,
}

impl RemuxResult {
    /// True when the pass produced no output at all.
    pub fn is_empty(&self) -> bool {
        self.audio.is_none()
            && self.video.is_none()
            && self.init_segment.is_none()
            && self.id3.is_none()
            && self.text.is_none()
    }
}

/// A remuxer: repackages demuxed tracks into source-buffer-ready payloads.
pub trait Remuxer: Send {
    /// Remux one batch of demuxed tracks.
    ///
    /// `flush` marks the end-of-segment pass; `accurate_time_offset` tells
    /// the remuxer whether `time_offset` is authoritative or estimated.
    fn remux(
        &mut self,
        tracks: DemuxerResult,
        time_offset: f64,
        accurate_time_offset: bool,
        flush: bool,
        stream: StreamKind,
    ) -> RemuxResult;

    /// Install init-segment bytes / codec hints for the upcoming segment.
    fn reset_init_segment(
        &mut self,
        init_segment: Option<&Bytes>,
        audio_codec: Option<&str>,
        video_codec: Option<&str>,
    );

    /// Re-anchor the init PTS for a new timeline.
    fn reset_timestamp(&mut self, default_init_pts: Option<MediaTimestamp>);

    /// Forget output continuity so the next fragment starts a fresh run.
    fn reset_next_timestamp(&mut self);
}
