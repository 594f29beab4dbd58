#![forbid(unsafe_code)]

//! Remuxing of elementary streams into fragmented MP4.

use bytes::{Bytes, BytesMut};
use syrinx_demux::{
    AudioCodecKind, AudioTrack, DemuxerResult, MPEG_TS_TIMESCALE, MediaTimestamp, TypeSupported,
    VideoTrack,
};
use syrinx_events::EventBus;
use tracing::{debug, warn};

use crate::{
    InitSegmentData, InitSegmentTrack, RemuxResult, RemuxedTrack, Remuxer, StreamKind, TrackKind,
    mp4_generator::{
        self, FragmentSample, SAMPLE_FLAGS_NON_SYNC, SAMPLE_FLAGS_SYNC, TrackSpec,
    },
};

/// Output track ids: source buffers address tracks by these, not by the
/// container PIDs they came from.
const AUDIO_TRACK_ID: u32 = 1;
const VIDEO_TRACK_ID: u32 = 2;

/// 33-bit PTS rollover period.
const ROLLOVER: i64 = 1 << 33;

/// Snap distance for contiguous fragments: 100 ms in 90 kHz ticks.
const CONTIGUITY_SNAP: i64 = 9_000;

/// Fallback video frame duration: 30 fps in 90 kHz ticks.
const DEFAULT_VIDEO_DURATION: i64 = 3_000;

/// Pull a timestamp into the 2^32-neighborhood of `reference` by shifting
/// whole 33-bit rollover periods.
fn normalize_pts(mut value: i64, reference: Option<i64>) -> i64 {
    let Some(reference) = reference else {
        return value;
    };
    let offset = if reference < value { -ROLLOVER } else { ROLLOVER };
    while (value - reference).abs() > ROLLOVER / 2 {
        value += offset;
    }
    value
}

/// Remuxer that packages elementary AVC/AAC/MP3 samples into `moof`+`mdat`
/// fragments, generating per-track init segments itself.
pub struct Mp4Remuxer {
    #[allow(dead_code)]
    observer: EventBus,
    type_supported: TypeSupported,
    audio_codec_hint: Option<String>,
    video_codec_hint: Option<String>,
    init_pts: Option<MediaTimestamp>,
    init_sent: bool,
    /// Absolute 90 kHz PTS the next audio fragment should start at.
    next_audio_pts: Option<i64>,
    /// Absolute 90 kHz DTS the next video fragment should start at.
    next_video_dts: Option<i64>,
    sequence: u32,
}

impl Mp4Remuxer {
    pub fn new(observer: EventBus, type_supported: TypeSupported, vendor: &str) -> Self {
        debug!(vendor, "mp4 remuxer created");
        Self {
            observer,
            type_supported,
            audio_codec_hint: None,
            video_codec_hint: None,
            init_pts: None,
            init_sent: false,
            next_audio_pts: None,
            next_video_dts: None,
            sequence: 1,
        }
    }

    fn audio_ready(track: &AudioTrack) -> bool {
        match track.segment_codec {
            AudioCodecKind::Aac => track.config.is_some(),
            AudioCodecKind::Mp3 => track.sample_rate.is_some(),
        }
    }

    fn video_ready(track: &VideoTrack) -> bool {
        !track.sps.is_empty() && !track.pps.is_empty()
    }

    fn anchor(&self) -> Option<i64> {
        self.init_pts.map(|ts| ts.rescale(MPEG_TS_TIMESCALE))
    }

    fn compute_init_pts(&mut self, tracks: &DemuxerResult, time_offset: f64) {
        if self.init_pts.is_some() {
            return;
        }
        let audio_first = tracks.audio.samples.first().map(|s| s.pts);
        let video_first = tracks.video.samples.first().map(|s| s.dts);
        let first = match (audio_first, video_first) {
            (Some(a), Some(v)) => Some(a.min(normalize_pts(v, Some(a)))),
            (a, v) => a.or(v),
        };
        if let Some(first) = first {
            let base = first - (time_offset * f64::from(MPEG_TS_TIMESCALE)) as i64;
            self.init_pts = Some(MediaTimestamp::new(base, MPEG_TS_TIMESCALE));
            debug!(base, "init PTS derived from first samples");
        }
    }

    fn generate_init(&self, tracks: &DemuxerResult) -> InitSegmentData {
        let mut init = InitSegmentData {
            init_pts: self.init_pts,
            ..Default::default()
        };
        let audio = &tracks.audio;
        if Self::audio_ready(audio) {
            let sample_rate = audio.sample_rate.unwrap_or(44_100);
            let (object_type, default_codec) = match audio.segment_codec {
                AudioCodecKind::Aac => (0x40u8, "mp4a.40.2"),
                AudioCodecKind::Mp3 => {
                    if !self.type_supported.mpeg && !self.type_supported.mp3 {
                        warn!("remuxing MPEG audio although no source buffer flavor accepts it");
                    }
                    (0x6Bu8, "mp4a.40.34")
                }
            };
            let config = audio.config.clone().unwrap_or_default();
            let spec = TrackSpec::Audio {
                id: AUDIO_TRACK_ID,
                timescale: sample_rate,
                duration: 0,
                channels: u16::from(audio.channel_count.unwrap_or(2)),
                sample_rate,
                object_type,
                config: &config,
            };
            init.audio = Some(InitSegmentTrack {
                id: AUDIO_TRACK_ID,
                container: "audio/mp4",
                codec: audio
                    .codec
                    .clone()
                    .or_else(|| self.audio_codec_hint.clone())
                    .unwrap_or_else(|| default_codec.to_owned()),
                data: mp4_generator::init_segment(&[spec]),
            });
        }
        let video = &tracks.video;
        if Self::video_ready(video) {
            let spec = TrackSpec::Video {
                id: VIDEO_TRACK_ID,
                timescale: MPEG_TS_TIMESCALE,
                duration: 0,
                width: video.width,
                height: video.height,
                sps: &video.sps,
                pps: &video.pps,
            };
            init.video = Some(InitSegmentTrack {
                id: VIDEO_TRACK_ID,
                container: "video/mp4",
                codec: video
                    .codec
                    .clone()
                    .or_else(|| self.video_codec_hint.clone())
                    .unwrap_or_else(|| "avc1.42e01e".to_owned()),
                data: mp4_generator::init_segment(&[spec]),
            });
        }
        init
    }

    fn remux_audio(&mut self, track: &mut AudioTrack, anchor: i64) -> Option<RemuxedTrack> {
        let sample_rate = track.sample_rate.unwrap_or(44_100);
        let samples_per_frame: i64 = match track.segment_codec {
            AudioCodecKind::Aac => 1024,
            AudioCodecKind::Mp3 => 1152,
        };
        let frame_ticks_90k =
            samples_per_frame * i64::from(MPEG_TS_TIMESCALE) / i64::from(sample_rate);

        let reference = self.next_audio_pts.or(Some(anchor));
        for sample in &mut track.samples {
            sample.pts = normalize_pts(sample.pts, reference);
        }
        let first_pts = track.samples.first()?.pts;
        let shift = match self.next_audio_pts {
            Some(next) if (first_pts - next).abs() <= CONTIGUITY_SNAP => first_pts - next,
            _ => 0,
        };

        let scale = |pts90: i64| -> i64 {
            (pts90 - anchor - shift) * i64::from(sample_rate) / i64::from(MPEG_TS_TIMESCALE)
        };

        let mut payload = BytesMut::new();
        let mut rows = Vec::with_capacity(track.samples.len());
        for (i, sample) in track.samples.iter().enumerate() {
            let duration = match track.samples.get(i + 1) {
                Some(next) => {
                    // ideal cadence gets the exact frame length; anything
                    // else (a gap, dropped frames) takes the scaled delta
                    let delta = next.pts - sample.pts;
                    if (delta - frame_ticks_90k).abs() <= frame_ticks_90k / 2 {
                        samples_per_frame
                    } else {
                        let d = scale(next.pts) - scale(sample.pts);
                        if d > 0 { d } else { samples_per_frame }
                    }
                }
                None => samples_per_frame,
            };
            rows.push(FragmentSample {
                duration: duration as u32,
                size: sample.data.len() as u32,
                flags: SAMPLE_FLAGS_SYNC,
                cts: 0,
            });
            payload.extend_from_slice(&sample.data);
        }

        let base_out = scale(first_pts).max(0);
        let total_out: i64 = rows.iter().map(|r| i64::from(r.duration)).sum();
        let data = mp4_generator::fragment(
            AUDIO_TRACK_ID,
            self.next_sequence(),
            base_out as u64,
            &rows,
            &payload,
            false,
        );

        let last_pts = track.samples.last()?.pts;
        self.next_audio_pts = Some(last_pts - shift + frame_ticks_90k);

        let start = base_out as f64 / f64::from(sample_rate);
        let end = (base_out + total_out) as f64 / f64::from(sample_rate);
        Some(RemuxedTrack {
            kind: TrackKind::Audio,
            data,
            start_pts: start,
            end_pts: end,
            start_dts: start,
            end_dts: end,
            sample_count: track.samples.len(),
            dropped: 0,
        })
    }

    fn remux_video(&mut self, track: &mut VideoTrack, anchor: i64) -> Option<RemuxedTrack> {
        let reference = self.next_video_dts.or(Some(anchor));
        for sample in &mut track.samples {
            sample.dts = normalize_pts(sample.dts, reference);
            sample.pts = normalize_pts(sample.pts, Some(sample.dts));
        }
        let first_dts = track.samples.first()?.dts;
        let shift = match self.next_video_dts {
            Some(next) if (first_dts - next).abs() <= CONTIGUITY_SNAP => first_dts - next,
            _ => 0,
        };

        let mut payload = BytesMut::new();
        let mut rows = Vec::with_capacity(track.samples.len());
        let mut last_duration = DEFAULT_VIDEO_DURATION;
        for (i, sample) in track.samples.iter().enumerate() {
            let mut size = 0usize;
            for unit in &sample.units {
                payload.extend_from_slice(&(unit.len() as u32).to_be_bytes());
                payload.extend_from_slice(unit);
                size += 4 + unit.len();
            }
            let duration = match track.samples.get(i + 1) {
                Some(next) => {
                    let d = next.dts - sample.dts;
                    if d > 0 { d } else { last_duration }
                }
                None => last_duration,
            };
            last_duration = duration;
            rows.push(FragmentSample {
                duration: duration as u32,
                size: size as u32,
                flags: if sample.key {
                    SAMPLE_FLAGS_SYNC
                } else {
                    SAMPLE_FLAGS_NON_SYNC
                },
                cts: (sample.pts - sample.dts) as i32,
            });
        }

        let base_out = (first_dts - anchor - shift).max(0);
        let total: i64 = rows.iter().map(|r| i64::from(r.duration)).sum();
        let data = mp4_generator::fragment(
            VIDEO_TRACK_ID,
            self.next_sequence(),
            base_out as u64,
            &rows,
            &payload,
            true,
        );

        let last = track.samples.last()?;
        self.next_video_dts = Some(last.dts - shift + last_duration);

        let ts = f64::from(MPEG_TS_TIMESCALE);
        let start_dts = base_out as f64 / ts;
        let end_dts = (base_out + total) as f64 / ts;
        let start_pts = (track.samples.first()?.pts - anchor - shift).max(0) as f64 / ts;
        let end_pts = (last.pts - anchor - shift + last_duration) as f64 / ts;
        Some(RemuxedTrack {
            kind: TrackKind::Video,
            data,
            start_pts,
            end_pts,
            start_dts,
            end_dts,
            sample_count: track.samples.len(),
            dropped: track.dropped,
        })
    }

    fn next_sequence(&mut self) -> u32 {
        let seq = self.sequence;
        self.sequence += 1;
        seq
    }
}

impl Remuxer for Mp4Remuxer {
    fn remux(
        &mut self,
        mut tracks: DemuxerResult,
        time_offset: f64,
        _accurate_time_offset: bool,
        _flush: bool,
        _stream: StreamKind,
    ) -> RemuxResult {
        let mut result = RemuxResult::default();

        self.compute_init_pts(&tracks, time_offset);
        if !self.init_sent {
            let init = self.generate_init(&tracks);
            if init.audio.is_some() || init.video.is_some() {
                self.init_sent = true;
                result.init_segment = Some(init);
            }
        }

        let Some(anchor) = self.anchor() else {
            return result;
        };
        if Self::audio_ready(&tracks.audio) && !tracks.audio.samples.is_empty() {
            result.audio = self.remux_audio(&mut tracks.audio, anchor);
        }
        if Self::video_ready(&tracks.video) && !tracks.video.samples.is_empty() {
            result.video = self.remux_video(&mut tracks.video, anchor);
        }
        if !tracks.id3.samples.is_empty() {
            result.id3 = Some(tracks.id3);
        }
        if !tracks.text.samples.is_empty() {
            result.text = Some(tracks.text);
        }
        result
    }

    fn reset_init_segment(
        &mut self,
        _init_segment: Option<&Bytes>,
        audio_codec: Option<&str>,
        video_codec: Option<&str>,
    ) {
        self.audio_codec_hint = audio_codec.map(str::to_owned);
        self.video_codec_hint = video_codec.map(str::to_owned);
        self.init_sent = false;
    }

    fn reset_timestamp(&mut self, default_init_pts: Option<MediaTimestamp>) {
        self.init_pts = default_init_pts;
        self.next_audio_pts = None;
        self.next_video_dts = None;
    }

    fn reset_next_timestamp(&mut self) {
        self.next_audio_pts = None;
        self.next_video_dts = None;
    }
}
