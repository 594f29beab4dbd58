#![forbid(unsafe_code)]

//! Elementary MPEG audio (MP3) demuxing.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use syrinx_events::EventBus;

use crate::{
    AudioCodecKind, AudioSample, AudioTrack, Demuxer, DemuxerResult, MPEG_TS_TIMESCALE,
    MediaTimestamp, MetadataSample, id3,
};

/// Bytes the probe wants before its verdict is trustworthy.
pub const MIN_PROBE_LEN: usize = 512;

/// Bitrates in kbit/s, indexed `[version_group][layer_group][bitrate_index]`.
const BITRATES: [[[u32; 15]; 3]; 2] = [
    // MPEG-1
    [
        [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448], // layer I
        [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384],    // layer II
        [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320],     // layer III
    ],
    // MPEG-2 / 2.5
    [
        [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256], // layer I
        [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],      // layer II
        [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],      // layer III
    ],
];

/// Sample rates in Hz for MPEG-1; halved for MPEG-2, quartered for MPEG-2.5.
const SAMPLE_RATES: [u32; 3] = [44_100, 48_000, 32_000];

#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    frame_len: usize,
    sample_rate: u32,
    channels: u8,
    samples_per_frame: u32,
}

fn parse_header(data: &[u8], offset: usize) -> Option<FrameHeader> {
    let h = data.get(offset..offset + 4)?;
    if h[0] != 0xFF || h[1] & 0xE0 != 0xE0 {
        return None;
    }
    let version_bits = (h[1] >> 3) & 0x03; // 0: 2.5, 2: 2, 3: 1
    let layer_bits = (h[1] >> 1) & 0x03; // 1: III, 2: II, 3: I
    if version_bits == 1 || layer_bits == 0 {
        return None;
    }
    let bitrate_index = (h[2] >> 4) as usize;
    let rate_index = ((h[2] >> 2) & 0x03) as usize;
    if bitrate_index == 0 || bitrate_index == 15 || rate_index == 3 {
        return None;
    }
    let mpeg1 = version_bits == 3;
    let layer = (4 - layer_bits) as usize; // 1..=3
    let bitrate = BITRATES[usize::from(!mpeg1)][layer - 1][bitrate_index] * 1000;
    let sample_rate = SAMPLE_RATES[rate_index]
        >> match version_bits {
            3 => 0,
            2 => 1,
            _ => 2,
        };
    let padding = usize::from((h[2] >> 1) & 0x01);
    let samples_per_frame: u32 = match (layer, mpeg1) {
        (1, _) => 384,
        (2, _) | (3, true) => 1152,
        (3, false) => 576,
        _ => unreachable!(),
    };
    let frame_len = if layer == 1 {
        (12 * bitrate as usize / sample_rate as usize + padding) * 4
    } else {
        samples_per_frame as usize / 8 * bitrate as usize / sample_rate as usize + padding
    };
    if frame_len <= 4 {
        return None;
    }
    let channels = if (h[3] >> 6) == 0b11 { 1 } else { 2 };
    Some(FrameHeader {
        frame_len,
        sample_rate,
        channels,
        samples_per_frame,
    })
}

/// Container probe: an MPEG audio frame header right after any leading ID3
/// tags, corroborated by the following frame when enough bytes are present.
pub fn probe(data: &[u8]) -> bool {
    let start = id3::tags_len(data);
    let Some(header) = parse_header(data, start) else {
        return false;
    };
    let next = start + header.frame_len;
    next >= data.len() || parse_header(data, next).is_some()
}

fn frame_duration(header: &FrameHeader) -> i64 {
    i64::from(header.samples_per_frame) * i64::from(MPEG_TS_TIMESCALE)
        / i64::from(header.sample_rate)
}

fn configure_track(track: &mut AudioTrack, header: &FrameHeader) {
    if track.sample_rate.is_some() {
        return;
    }
    track.segment_codec = AudioCodecKind::Mp3;
    track.input_timescale = MPEG_TS_TIMESCALE;
    track.sample_rate = Some(header.sample_rate);
    track.channel_count = Some(header.channels);
    track.codec = Some("mp4a.40.34".into());
}

/// Parse a run of MPEG audio frames starting at `base_pts`.
///
/// Complete frames (header included — MP3 frames are self-framing) are
/// pushed into `track`; returns bytes consumed.
pub(crate) fn parse_frames(track: &mut AudioTrack, data: &[u8], base_pts: i64) -> usize {
    let mut offset = 0;
    let mut pts = base_pts;
    while offset < data.len() {
        let Some(header) = parse_header(data, offset) else {
            match data[offset..].iter().skip(1).position(|&b| b == 0xFF) {
                Some(step) => {
                    offset += step + 1;
                    continue;
                }
                None => return data.len(),
            }
        };
        if offset + header.frame_len > data.len() {
            break;
        }
        configure_track(track, &header);
        track.samples.push(AudioSample {
            pts,
            data: Bytes::copy_from_slice(&data[offset..offset + header.frame_len]),
        });
        pts += frame_duration(&header);
        offset += header.frame_len;
    }
    offset
}

/// Demuxer for elementary MP3 segments.
pub struct MpaDemuxer {
    #[allow(dead_code)]
    observer: EventBus,
    base_pts: Option<i64>,
    remainder: BytesMut,
}

impl MpaDemuxer {
    pub fn new(observer: EventBus) -> Self {
        Self {
            observer,
            base_pts: None,
            remainder: BytesMut::new(),
        }
    }

    fn demux_buffer(&mut self, data: &[u8], time_offset: f64) -> DemuxerResult {
        let mut result = DemuxerResult::default();
        result.audio.input_timescale = MPEG_TS_TIMESCALE;

        let tags = id3::tags_len(data);
        if self.base_pts.is_none() {
            let anchor = id3::timestamp(&data[..tags])
                .unwrap_or((time_offset * f64::from(MPEG_TS_TIMESCALE)) as i64);
            self.base_pts = Some(anchor);
        }
        let base_pts = self.base_pts.unwrap_or(0);
        if tags > 0 {
            result.id3.samples.push(MetadataSample {
                pts: base_pts,
                data: Bytes::copy_from_slice(&data[..tags]),
            });
        }

        let consumed = parse_frames(&mut result.audio, &data[tags..], base_pts);
        if let Some(rate) = result.audio.sample_rate
            && let Some(last) = result.audio.samples.last()
        {
            let spf = if result.audio.samples.len() >= 2 {
                result.audio.samples[1].pts - result.audio.samples[0].pts
            } else {
                1152 * i64::from(MPEG_TS_TIMESCALE) / i64::from(rate)
            };
            self.base_pts = Some(last.pts + spf);
        }
        self.remainder = BytesMut::from(&data[tags + consumed..]);
        result
    }
}

#[async_trait]
impl Demuxer for MpaDemuxer {
    fn demux(
        &mut self,
        data: Bytes,
        time_offset: f64,
        _contiguous: bool,
        _flush: bool,
    ) -> DemuxerResult {
        let buf = if self.remainder.is_empty() {
            data.to_vec()
        } else {
            let mut joined = std::mem::take(&mut self.remainder);
            joined.extend_from_slice(&data);
            joined.to_vec()
        };
        self.demux_buffer(&buf, time_offset)
    }

    async fn flush(&mut self, time_offset: f64) -> DemuxerResult {
        let buf = std::mem::take(&mut self.remainder);
        let result = self.demux_buffer(&buf, time_offset);
        self.remainder.clear();
        result
    }

    fn reset_init_segment(
        &mut self,
        _init_segment: Option<&Bytes>,
        _audio_codec: Option<&str>,
        _video_codec: Option<&str>,
        _track_duration: f64,
    ) {
        self.remainder.clear();
    }

    fn reset_timestamp(&mut self, default_init_pts: Option<MediaTimestamp>) {
        self.base_pts = default_init_pts.map(|ts| ts.rescale(MPEG_TS_TIMESCALE));
    }

    fn reset_contiguity(&mut self) {
        self.remainder.clear();
        self.base_pts = None;
    }
}

#[cfg(test)]
pub(crate) fn make_frame() -> Vec<u8> {
    // MPEG-1 layer III, 128 kbit/s, 44.1 kHz, no padding, stereo
    // frame length = 144 * 128000 / 44100 = 417 bytes
    let mut frame = vec![0xFF, 0xFB, 0x90, 0x00];
    frame.extend(std::iter::repeat_n(0x5A, 417 - 4));
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_math() {
        let frame = make_frame();
        let header = parse_header(&frame, 0).unwrap();
        assert_eq!(header.frame_len, 417);
        assert_eq!(header.sample_rate, 44_100);
        assert_eq!(header.samples_per_frame, 1152);
        assert_eq!(header.channels, 2);
    }

    #[test]
    fn probe_needs_two_headers_when_available() {
        let mut data = make_frame();
        data.extend(make_frame());
        assert!(probe(&data));

        let mut broken = make_frame();
        broken.extend(std::iter::repeat_n(0u8, 417));
        assert!(!probe(&broken));
    }

    #[test]
    fn probe_rejects_garbage() {
        assert!(!probe(&[0x55; 512]));
    }

    #[test]
    fn demux_produces_whole_frames() {
        let mut data = make_frame();
        data.extend(make_frame());
        let mut demuxer = MpaDemuxer::new(EventBus::default());
        let result = demuxer.demux(Bytes::from(data), 0.0, true, true);

        assert_eq!(result.audio.samples.len(), 2);
        assert_eq!(result.audio.segment_codec, AudioCodecKind::Mp3);
        assert_eq!(result.audio.samples[0].data.len(), 417);
        let duration = 1152 * i64::from(MPEG_TS_TIMESCALE) / 44_100;
        assert_eq!(result.audio.samples[1].pts, duration);
    }
}
