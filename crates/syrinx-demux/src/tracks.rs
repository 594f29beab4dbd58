#![forbid(unsafe_code)]

//! Demuxed track model shared by demuxers and remuxers.

use bytes::Bytes;

/// Timescale of MPEG-TS presentation timestamps.
pub const MPEG_TS_TIMESCALE: u32 = 90_000;

/// A rational timestamp: `base_time` ticks at `timescale` ticks per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaTimestamp {
    pub base_time: i64,
    pub timescale: u32,
}

impl MediaTimestamp {
    pub fn new(base_time: i64, timescale: u32) -> Self {
        Self {
            base_time,
            timescale,
        }
    }

    /// The timestamp in seconds.
    pub fn as_seconds(&self) -> f64 {
        if self.timescale == 0 {
            return 0.0;
        }
        self.base_time as f64 / self.timescale as f64
    }

    /// Rescale to another timescale, rounding toward zero.
    pub fn rescale(&self, timescale: u32) -> i64 {
        if self.timescale == 0 {
            return 0;
        }
        self.base_time * i64::from(timescale) / i64::from(self.timescale)
    }
}

/// Flavor of compressed audio carried by an [`AudioTrack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioCodecKind {
    #[default]
    Aac,
    Mp3,
}

/// One compressed audio frame.
#[derive(Debug, Clone)]
pub struct AudioSample {
    /// Presentation timestamp in the track's input timescale.
    pub pts: i64,
    /// Frame payload without transport framing (no ADTS header).
    pub data: Bytes,
}

/// Demuxed audio elementary stream.
#[derive(Debug, Clone, Default)]
pub struct AudioTrack {
    /// Track / PID identifier from the container.
    pub id: u32,
    pub segment_codec: AudioCodecKind,
    /// RFC 6381 codec string, e.g. `mp4a.40.2`.
    pub codec: Option<String>,
    /// Timescale the sample timestamps are expressed in.
    pub input_timescale: u32,
    pub sample_rate: Option<u32>,
    pub channel_count: Option<u8>,
    /// AudioSpecificConfig bytes for AAC.
    pub config: Option<Vec<u8>>,
    pub samples: Vec<AudioSample>,
}

/// One video access unit, split into NAL units.
#[derive(Debug, Clone)]
pub struct VideoSample {
    pub pts: i64,
    pub dts: i64,
    /// Contains an IDR slice.
    pub key: bool,
    /// NAL unit payloads without start codes.
    pub units: Vec<Bytes>,
}

/// Demuxed video elementary stream.
#[derive(Debug, Clone, Default)]
pub struct VideoTrack {
    pub id: u32,
    /// RFC 6381 codec string, e.g. `avc1.64001f`.
    pub codec: Option<String>,
    pub input_timescale: u32,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
    pub width: u32,
    pub height: u32,
    pub samples: Vec<VideoSample>,
    /// Access units discarded because no timestamp could be attached.
    pub dropped: usize,
    /// Raw container bytes, set when the segment is already fragmented MP4
    /// and travels through untouched for passthrough remuxing.
    pub raw: Option<Bytes>,
}

/// Timed metadata sample (ID3 payloads).
#[derive(Debug, Clone)]
pub struct MetadataSample {
    pub pts: i64,
    pub data: Bytes,
}

/// Timed metadata track.
#[derive(Debug, Clone, Default)]
pub struct MetadataTrack {
    pub samples: Vec<MetadataSample>,
}

/// User data sample (SEI payloads, captions).
#[derive(Debug, Clone)]
pub struct UserdataSample {
    pub pts: i64,
    pub data: Bytes,
}

/// User data track.
#[derive(Debug, Clone, Default)]
pub struct UserdataTrack {
    pub samples: Vec<UserdataSample>,
}

/// The four elementary streams a demux pass can produce.
#[derive(Debug, Clone, Default)]
pub struct DemuxerResult {
    pub audio: AudioTrack,
    pub video: VideoTrack,
    pub id3: MetadataTrack,
    pub text: UserdataTrack,
}

impl DemuxerResult {
    /// True when no track carries any payload.
    pub fn is_empty(&self) -> bool {
        self.audio.samples.is_empty()
            && self.video.samples.is_empty()
            && self.video.raw.is_none()
            && self.id3.samples.is_empty()
            && self.text.samples.is_empty()
    }
}
