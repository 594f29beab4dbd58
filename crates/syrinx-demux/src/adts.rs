#![forbid(unsafe_code)]

//! Elementary AAC (ADTS) demuxing.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use syrinx_events::EventBus;
use tracing::trace;

use crate::{
    AudioCodecKind, AudioSample, AudioTrack, Demuxer, DemuxerResult, MPEG_TS_TIMESCALE,
    MediaTimestamp, MetadataSample, id3,
};

/// Bytes the probe wants before its verdict is trustworthy.
pub const MIN_PROBE_LEN: usize = 512;

/// Samples per AAC frame.
const SAMPLES_PER_FRAME: u32 = 1024;

const SAMPLING_FREQUENCIES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHeader {
    pub header_len: usize,
    pub frame_len: usize,
    pub sample_rate: u32,
    pub sampling_index: u8,
    pub channels: u8,
    pub object_type: u8,
}

pub(crate) fn parse_header(data: &[u8], offset: usize) -> Option<FrameHeader> {
    let h = data.get(offset..offset + 7)?;
    if h[0] != 0xFF || h[1] & 0xF6 != 0xF0 {
        return None;
    }
    let protection_absent = h[1] & 0x01 != 0;
    let object_type = ((h[2] >> 6) & 0x03) + 1;
    let sampling_index = (h[2] >> 2) & 0x0F;
    let sample_rate = *SAMPLING_FREQUENCIES.get(sampling_index as usize)?;
    let channels = ((h[2] & 0x01) << 2) | (h[3] >> 6);
    let frame_len = (usize::from(h[3] & 0x03) << 11) | (usize::from(h[4]) << 3) | usize::from(h[5] >> 5);
    let header_len = if protection_absent { 7 } else { 9 };
    if frame_len <= header_len {
        return None;
    }
    Some(FrameHeader {
        header_len,
        frame_len,
        sample_rate,
        sampling_index,
        channels,
        object_type,
    })
}

/// Container probe: an ADTS frame header right after any leading ID3 tags,
/// corroborated by the following frame when enough bytes are present.
pub fn probe(data: &[u8]) -> bool {
    let start = id3::tags_len(data);
    let Some(header) = parse_header(data, start) else {
        return false;
    };
    let next = start + header.frame_len;
    next >= data.len() || parse_header(data, next).is_some()
}

/// Frame duration in 90 kHz ticks.
fn frame_duration(sample_rate: u32) -> i64 {
    i64::from(SAMPLES_PER_FRAME) * i64::from(MPEG_TS_TIMESCALE) / i64::from(sample_rate)
}

fn audio_specific_config(object_type: u8, sampling_index: u8, channels: u8) -> Vec<u8> {
    vec![
        (object_type << 3) | ((sampling_index >> 1) & 0x07),
        ((sampling_index & 0x01) << 7) | (channels << 3),
    ]
}

/// Apply codec configuration from a frame header to a track, once.
pub(crate) fn configure_track(track: &mut AudioTrack, header: &FrameHeader) {
    if track.config.is_some() {
        return;
    }
    track.segment_codec = AudioCodecKind::Aac;
    track.input_timescale = MPEG_TS_TIMESCALE;
    track.sample_rate = Some(header.sample_rate);
    track.channel_count = Some(header.channels);
    track.config = Some(audio_specific_config(
        header.object_type,
        header.sampling_index,
        header.channels,
    ));
    track.codec = Some(format!("mp4a.40.{}", header.object_type));
}

/// Parse a run of ADTS frames starting at `base_pts`.
///
/// Pushes complete frames into `track` and returns the number of bytes
/// consumed; a trailing partial frame is left unconsumed for the caller to
/// carry over (or drop, at end of segment).
pub(crate) fn parse_frames(track: &mut AudioTrack, data: &[u8], base_pts: i64) -> usize {
    let mut offset = 0;
    let mut frames = 0i64;
    while offset < data.len() {
        let Some(header) = parse_header(data, offset) else {
            // lost sync; hunt for the next header byte
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
        let payload = &data[offset + header.header_len..offset + header.frame_len];
        track.samples.push(AudioSample {
            pts: base_pts + frames * frame_duration(header.sample_rate),
            data: Bytes::copy_from_slice(payload),
        });
        frames += 1;
        offset += header.frame_len;
    }
    offset
}

/// Demuxer for elementary AAC segments framed as ADTS.
pub struct AdtsDemuxer {
    #[allow(dead_code)]
    observer: EventBus,
    /// Timestamp anchor for the current timeline, 90 kHz.
    base_pts: Option<i64>,
    /// Partial frame carried between progressive chunks.
    remainder: BytesMut,
    manifest_codec: Option<String>,
}

impl AdtsDemuxer {
    pub fn new(observer: EventBus) -> Self {
        Self {
            observer,
            base_pts: None,
            remainder: BytesMut::new(),
            manifest_codec: None,
        }
    }

    fn demux_buffer(&mut self, data: &[u8], time_offset: f64) -> DemuxerResult {
        let mut result = DemuxerResult::default();
        result.audio.id = 0;
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
        if let Some(codec) = &self.manifest_codec
            && result.audio.codec.is_none()
        {
            result.audio.codec = Some(codec.clone());
        }
        if let (Some(rate), Some(last)) = (result.audio.sample_rate, result.audio.samples.last()) {
            self.base_pts = Some(last.pts + frame_duration(rate));
        }
        self.remainder = BytesMut::from(&data[tags + consumed..]);
        trace!(
            frames = result.audio.samples.len(),
            pending = self.remainder.len(),
            "adts chunk demuxed"
        );
        result
    }
}

#[async_trait]
impl Demuxer for AdtsDemuxer {
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
        // a trailing partial frame is unusable; parse what remains and drop it
        let buf = std::mem::take(&mut self.remainder);
        let result = self.demux_buffer(&buf, time_offset);
        self.remainder.clear();
        result
    }

    fn reset_init_segment(
        &mut self,
        _init_segment: Option<&Bytes>,
        audio_codec: Option<&str>,
        _video_codec: Option<&str>,
        _track_duration: f64,
    ) {
        self.manifest_codec = audio_codec.map(str::to_owned);
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
pub(crate) fn make_frame(payload_len: usize, sampling_index: u8) -> Vec<u8> {
    let frame_len = payload_len + 7;
    let mut frame = vec![
        0xFF,
        0xF1, // MPEG-4, no CRC
        (0x01 << 6) | (sampling_index << 2), // AAC LC
        0x40 | ((frame_len >> 11) & 0x03) as u8, // 1 channel
        ((frame_len >> 3) & 0xFF) as u8,
        (((frame_len & 0x07) << 5) | 0x1F) as u8,
        0xFC,
    ];
    frame.extend(std::iter::repeat_n(0xA5, payload_len));
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_accepts_adts_after_id3() {
        let mut data = id3::make_tag(&[(b"TIT2", b"\x00x".to_vec())]);
        data.extend(make_frame(100, 4));
        data.extend(make_frame(100, 4));
        assert!(probe(&data));
    }

    #[test]
    fn probe_rejects_garbage() {
        assert!(!probe(&[0x55; 512]));
        assert!(!probe(b"\xFF\x00not adts"));
    }

    #[test]
    fn demux_extracts_frames_and_config() {
        let mut data = Vec::new();
        data.extend(make_frame(64, 4)); // 44.1 kHz
        data.extend(make_frame(64, 4));
        let mut demuxer = AdtsDemuxer::new(EventBus::default());
        let result = demuxer.demux(Bytes::from(data), 10.0, true, true);

        assert_eq!(result.audio.samples.len(), 2);
        assert_eq!(result.audio.sample_rate, Some(44_100));
        assert_eq!(result.audio.codec.as_deref(), Some("mp4a.40.2"));
        assert_eq!(result.audio.config.as_deref(), Some(&[0x12, 0x08][..]));
        assert_eq!(result.audio.samples[0].pts, 900_000);
        let duration = frame_duration(44_100);
        assert_eq!(result.audio.samples[1].pts, 900_000 + duration);
    }

    #[tokio::test]
    async fn partial_frame_carries_over_to_next_chunk() {
        let mut data = Vec::new();
        data.extend(make_frame(64, 4));
        data.extend(make_frame(64, 4));
        let (head, tail) = data.split_at(80);

        let mut demuxer = AdtsDemuxer::new(EventBus::default());
        let first = demuxer.demux(Bytes::copy_from_slice(head), 0.0, true, false);
        assert_eq!(first.audio.samples.len(), 1);
        let second = demuxer.demux(Bytes::copy_from_slice(tail), 0.0, true, false);
        assert_eq!(second.audio.samples.len(), 1);
        let flushed = demuxer.flush(0.0).await;
        assert!(flushed.audio.samples.is_empty());
    }

    #[test]
    fn id3_timestamp_anchors_pts() {
        let ticks: u64 = 180_000;
        let mut owner = b"com.apple.streaming.transportStreamTimestamp\0".to_vec();
        owner.extend_from_slice(&ticks.to_be_bytes());
        let mut data = id3::make_tag(&[(b"PRIV", owner)]);
        data.extend(make_frame(32, 4));

        let mut demuxer = AdtsDemuxer::new(EventBus::default());
        let result = demuxer.demux(Bytes::from(data), 99.0, true, true);
        assert_eq!(result.audio.samples[0].pts, 180_000);
        assert_eq!(result.id3.samples.len(), 1);
    }
}
